mod auth;
mod broker;
mod observability;
mod server;

pub use auth::*;
pub use broker::*;
pub use observability::*;
pub use server::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a TOML config file. A missing file yields the defaults.
    pub fn from_path(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError::error(
                "server.max_concurrent_requests",
                "must be greater than 0",
            ));
        }
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 || rl.burst_size == 0 {
                errors.push(ConfigError::error(
                    "server.rate_limit",
                    "requests_per_second and burst_size must be > 0",
                ));
            }
        }
        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError::warning(
                "server.cors.allowed_origins",
                "wildcard \"*\" allows all origins (not recommended for production)",
            ));
        }

        let b = &self.broker;
        if b.liveness_interval_secs == 0 {
            errors.push(ConfigError::error(
                "broker.liveness_interval_secs",
                "sweep interval must be greater than 0",
            ));
        }
        if b.liveness_timeout_secs <= b.liveness_interval_secs {
            errors.push(ConfigError::error(
                "broker.liveness_timeout_secs",
                "timeout must be longer than the sweep interval",
            ));
        } else if b.liveness_timeout_secs < b.liveness_interval_secs * 2 {
            errors.push(ConfigError::warning(
                "broker.liveness_timeout_secs",
                "timeout below 2x the sweep interval evicts agents that miss a single heartbeat",
            ));
        }
        if b.max_command_history == 0 {
            errors.push(ConfigError::error(
                "broker.max_command_history",
                "history cap must be greater than 0",
            ));
        }
        if b.outbound_queue_capacity == 0 {
            errors.push(ConfigError::error(
                "broker.outbound_queue_capacity",
                "queue capacity must be greater than 0",
            ));
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "sample rate must be between 0.0 and 1.0",
            ));
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
