//! AppState construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;

use rb_broker::{Broker, LivenessMonitor, TokenVerifier, Verifier};
use rb_domain::config::{Config, ConfigSeverity};
use tokio::task::JoinHandle;

use crate::api::auth::hash_token;
use crate::state::AppState;

/// Validate the config and wire up the broker.
///
/// Validation errors abort startup; warnings are logged and ignored.
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    let mut errors = 0;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => {
                tracing::error!(field = %issue.field, "{}", issue.message);
                errors += 1;
            }
            ConfigSeverity::Warning => {
                tracing::warn!(field = %issue.field, "{}", issue.message);
            }
        }
    }
    if errors > 0 {
        anyhow::bail!("{errors} configuration error(s), refusing to start");
    }

    // ── Connection verifier (tokens read once) ──────────────────────
    let verifier: Arc<dyn Verifier> = Arc::new(TokenVerifier::from_env(&config.auth));

    // ── Broker ──────────────────────────────────────────────────────
    let broker = Arc::new(Broker::new(&config.broker, verifier));
    tracing::info!(
        liveness_interval_secs = config.broker.liveness_interval_secs,
        liveness_timeout_secs = config.broker.liveness_timeout_secs,
        max_command_history = config.broker.max_command_history,
        "broker ready"
    );

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %format!("env:{env_var}"), "API bearer-token auth enabled");
                Some(hash_token(&t))
            }
            None => {
                tracing::warn!(
                    "API bearer-token auth DISABLED, set the {env_var} env var to protect /v1/agents and /v1/sessions"
                );
                None
            }
        }
    };

    Ok(AppState::new(config, broker, api_token_hash))
}

/// Spawn the liveness monitor. It stops when `state.shutdown` is cancelled.
pub fn spawn_background_tasks(state: &AppState) -> JoinHandle<()> {
    let handle = LivenessMonitor::new(state.broker.clone()).spawn(state.shutdown.clone());
    tracing::info!("background tasks spawned");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_refuses_to_start() {
        let mut config = Config::default();
        config.broker.liveness_timeout_secs = config.broker.liveness_interval_secs;
        assert!(build_app_state(Arc::new(config)).is_err());
    }

    #[test]
    fn default_config_builds() {
        let state = build_app_state(Arc::new(Config::default())).unwrap();
        assert!(state.broker.registry().is_empty());
        assert!(!state.shutdown.is_cancelled());
    }
}
