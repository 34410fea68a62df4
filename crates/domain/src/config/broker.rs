use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Liveness, retention and back-pressure knobs for the session broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// How often the liveness monitor sweeps the agent registry.
    #[serde(default = "d_interval")]
    pub liveness_interval_secs: u64,
    /// Silence after which an agent is presumed gone.
    #[serde(default = "d_timeout")]
    pub liveness_timeout_secs: u64,
    /// How long a closed session stays resolvable for late messages.
    #[serde(default = "d_grace")]
    pub closed_session_grace_secs: u64,
    /// Per-session command history cap (oldest entries evicted first).
    #[serde(default = "d_history")]
    pub max_command_history: usize,
    /// Outbound queue depth per connection.
    #[serde(default = "d_queue")]
    pub outbound_queue_capacity: usize,
    /// Largest accepted WebSocket frame (file chunks included).
    #[serde(default = "d_max_message")]
    pub max_message_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: d_interval(),
            liveness_timeout_secs: d_timeout(),
            closed_session_grace_secs: d_grace(),
            max_command_history: d_history(),
            outbound_queue_capacity: d_queue(),
            max_message_bytes: d_max_message(),
        }
    }
}

impl BrokerConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn closed_session_grace(&self) -> Duration {
        Duration::from_secs(self.closed_session_grace_secs)
    }
}

fn d_interval() -> u64 {
    30
}
fn d_timeout() -> u64 {
    90
}
fn d_grace() -> u64 {
    60
}
fn d_history() -> usize {
    1000
}
fn d_queue() -> usize {
    256
}
fn d_max_message() -> usize {
    16 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg: BrokerConfig = toml::from_str("liveness_timeout_secs = 120").unwrap();
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.liveness_interval(), Duration::from_secs(30));
        assert_eq!(cfg.max_command_history, 1000);
    }
}
