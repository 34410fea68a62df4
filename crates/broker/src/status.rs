//! Status projection: a point-in-time summary of agents and sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::registry::AgentRegistry;
use crate::sessions::{SessionBroker, SessionCounts};

/// Read-only view of the broker served by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub online: bool,
    /// Agents heard from within the liveness timeout.
    pub agent_count: usize,
    /// Pending plus active sessions.
    pub session_count: usize,
    pub sessions: SessionCounts,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn project(registry: &AgentRegistry, sessions: &SessionBroker, started: Instant) -> Self {
        let counts = sessions.counts();
        Self {
            online: true,
            agent_count: registry.online_count(),
            session_count: counts.live(),
            sessions: counts,
            uptime_secs: started.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }
}
