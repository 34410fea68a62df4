pub mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};

/// relaybroker: rendezvous and relay broker for agents and controllers.
#[derive(Debug, Parser)]
#[command(name = "relaybroker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the broker server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `RB_CONFIG` (or
/// `config.toml` by default).  Returns the parsed [`Config`] and the
/// path that was used.
///
/// [`Config`]: rb_domain::config::Config
pub fn load_config() -> anyhow::Result<(rb_domain::config::Config, String)> {
    let config_path = std::env::var("RB_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = rb_domain::config::Config::from_path(std::path::Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;
    Ok((config, config_path))
}
