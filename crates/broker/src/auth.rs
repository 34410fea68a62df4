//! Connection authentication. The verifier is consulted once per connection,
//! before the WebSocket upgrade, with the role the peer claims.

use rb_domain::config::AuthConfig;
use rb_protocol::Role;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub trait Verifier: Send + Sync {
    fn verify(&self, role: Role, credential: Option<&str>) -> bool;
}

/// Accepts every connection. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Verifier for AllowAll {
    fn verify(&self, _role: Role, _credential: Option<&str>) -> bool {
        true
    }
}

/// Per-role pre-shared tokens, held as SHA-256 digests.
///
/// A role without a configured token is open.
#[derive(Clone, Default)]
pub struct TokenVerifier {
    agent: Option<Vec<u8>>,
    controller: Option<Vec<u8>>,
}

impl TokenVerifier {
    pub fn new(agent_token: Option<&str>, controller_token: Option<&str>) -> Self {
        Self {
            agent: digest_non_empty(agent_token),
            controller: digest_non_empty(controller_token),
        }
    }

    /// Read both tokens from the environment once.
    pub fn from_env(cfg: &AuthConfig) -> Self {
        let agent = std::env::var(&cfg.agent_token_env).ok();
        let controller = std::env::var(&cfg.controller_token_env).ok();
        let verifier = Self::new(agent.as_deref(), controller.as_deref());

        if verifier.agent.is_none() {
            tracing::warn!(
                env = %cfg.agent_token_env,
                "no agent token configured, agent connections are unauthenticated"
            );
        }
        if verifier.controller.is_none() {
            tracing::warn!(
                env = %cfg.controller_token_env,
                "no controller token configured, controller connections are unauthenticated"
            );
        }
        verifier
    }

    pub fn is_open(&self, role: Role) -> bool {
        self.expected(role).is_none()
    }

    fn expected(&self, role: Role) -> Option<&[u8]> {
        match role {
            Role::Agent => self.agent.as_deref(),
            Role::Controller => self.controller.as_deref(),
        }
    }
}

impl Verifier for TokenVerifier {
    fn verify(&self, role: Role, credential: Option<&str>) -> bool {
        let Some(expected) = self.expected(role) else {
            return true;
        };
        // Hashing first keeps the comparison fixed-length.
        let provided = Sha256::digest(credential.unwrap_or("").as_bytes());
        bool::from(provided.ct_eq(expected))
    }
}

fn digest_non_empty(token: Option<&str>) -> Option<Vec<u8>> {
    token
        .filter(|t| !t.is_empty())
        .map(|t| Sha256::digest(t.as_bytes()).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_checked_per_role() {
        let v = TokenVerifier::new(Some("agent-secret"), Some("ctl-secret"));
        assert!(v.verify(Role::Agent, Some("agent-secret")));
        assert!(!v.verify(Role::Agent, Some("ctl-secret")));
        assert!(v.verify(Role::Controller, Some("ctl-secret")));
        assert!(!v.verify(Role::Controller, None));
    }

    #[test]
    fn unset_or_empty_token_leaves_role_open() {
        let v = TokenVerifier::new(Some(""), None);
        assert!(v.is_open(Role::Agent));
        assert!(v.verify(Role::Agent, None));
        assert!(v.verify(Role::Controller, Some("anything")));
    }

    #[test]
    fn allow_all_allows() {
        assert!(AllowAll.verify(Role::Controller, None));
    }
}
