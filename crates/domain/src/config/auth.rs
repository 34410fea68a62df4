use serde::{Deserialize, Serialize};

/// Where the per-role connection tokens come from.
///
/// Tokens are read once at startup. A role whose env var is unset or empty
/// connects without a credential (dev mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "d_agent_token_env")]
    pub agent_token_env: String,
    #[serde(default = "d_controller_token_env")]
    pub controller_token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            agent_token_env: d_agent_token_env(),
            controller_token_env: d_controller_token_env(),
        }
    }
}

fn d_agent_token_env() -> String {
    "RB_AGENT_TOKEN".into()
}

fn d_controller_token_env() -> String {
    "RB_CONTROLLER_TOKEN".into()
}
