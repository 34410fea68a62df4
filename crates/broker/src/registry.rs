//! In-memory registry of registered agents and the connections that speak
//! for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rb_protocol::{AgentSummary, Metadata};
use tokio::time::Instant;

use crate::presence::{PresenceEvent, PresenceHub};
use crate::transport::TransportId;

/// A registered agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub transport: TransportId,
    /// Bumped on every fresh registration of the id. A reconnect that
    /// takes over a live record keeps the old generation.
    pub generation: u64,
    pub registered_at: DateTime<Utc>,
    /// Monotonic liveness timestamp.
    pub last_seen: Instant,
    /// Wall-clock copy of `last_seen` for listings.
    pub last_seen_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Outcome of [`AgentRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: AgentRecord,
    /// Previous connection of the same agent id, now without authority.
    pub superseded: Option<TransportId>,
    /// Another agent id this same connection held before re-registering.
    pub replaced: Option<AgentRecord>,
}

/// What a connection is allowed to speak for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// Current connection of this agent.
    Current(String),
    /// Was this agent's connection until a newer registration took over.
    Superseded(String),
    /// Not an agent (a controller, or an agent that was evicted).
    Unknown,
}

/// Thread-safe registry of all registered agents.
///
/// `agents` is the source of truth; `by_transport` remembers which agent id
/// each connection registered as, so a connection whose record was replaced
/// can be told apart from one that never registered.
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
    by_transport: DashMap<TransportId, String>,
    generations: AtomicU64,
    timeout: Duration,
    presence: PresenceHub,
}

impl AgentRegistry {
    pub fn new(timeout: Duration, presence: PresenceHub) -> Self {
        Self {
            agents: DashMap::new(),
            by_transport: DashMap::new(),
            generations: AtomicU64::new(0),
            timeout,
            presence,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an agent connection. Replaces any live record with the same
    /// id (reconnect); an empty id gets a generated one.
    pub fn register(
        &self,
        agent_id: &str,
        transport: &TransportId,
        metadata: Metadata,
    ) -> Registration {
        let agent_id = match agent_id.trim() {
            "" => self.generate_id(),
            id => id.to_owned(),
        };

        // Same connection re-registering under a new name drops the old one.
        let replaced = self
            .by_transport
            .get(transport)
            .map(|id| id.clone())
            .filter(|old_id| *old_id != agent_id)
            .and_then(|old_id| {
                self.agents
                    .remove_if(&old_id, |_, r| r.transport == *transport)
                    .map(|(_, rec)| rec)
            });

        let now = Utc::now();
        let mut record = AgentRecord {
            agent_id: agent_id.clone(),
            transport: transport.clone(),
            generation: 0,
            registered_at: now,
            last_seen: Instant::now(),
            last_seen_at: now,
            metadata,
        };

        self.by_transport.insert(transport.clone(), agent_id.clone());
        let superseded = match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut e) => {
                record.generation = e.get().generation;
                let old = e.insert(record.clone());
                (old.transport != *transport).then_some(old.transport)
            }
            Entry::Vacant(e) => {
                record.generation = self.generations.fetch_add(1, Ordering::Relaxed);
                e.insert(record.clone());
                None
            }
        };

        if let Some(old) = &replaced {
            tracing::info!(
                agent_id = %old.agent_id,
                transport = %transport,
                "agent renamed by its connection, old id removed"
            );
            self.presence.publish(PresenceEvent::AgentOffline {
                agent_id: old.agent_id.clone(),
            });
        }
        if let Some(old) = &superseded {
            tracing::info!(
                agent_id = %agent_id,
                old_transport = %old,
                transport = %transport,
                "agent re-registered, previous connection superseded"
            );
        } else {
            tracing::info!(agent_id = %agent_id, transport = %transport, "agent registered");
        }
        self.presence.publish(PresenceEvent::AgentOnline {
            agent_id: agent_id.clone(),
        });

        Registration {
            record,
            superseded,
            replaced,
        }
    }

    /// Refresh liveness (and replace metadata when given). Unknown agents
    /// are ignored: a heartbeat racing an eviction is expected.
    pub fn heartbeat(&self, agent_id: &str, metadata: Option<Metadata>) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(mut rec) => {
                rec.last_seen = Instant::now();
                rec.last_seen_at = Utc::now();
                if let Some(metadata) = metadata {
                    rec.metadata = metadata;
                }
                true
            }
            None => {
                tracing::debug!(agent_id = %agent_id, "heartbeat for unknown agent ignored");
                false
            }
        }
    }

    /// Remove the agent this connection speaks for (on disconnect).
    ///
    /// A superseded connection only forgets its marker; the newer
    /// registration stays.
    pub fn unregister_by_transport(&self, transport: &TransportId) -> Option<AgentRecord> {
        let (_, agent_id) = self.by_transport.remove(transport)?;
        let (_, rec) = self
            .agents
            .remove_if(&agent_id, |_, r| r.transport == *transport)?;
        tracing::info!(agent_id = %agent_id, transport = %transport, "agent unregistered");
        self.presence.publish(PresenceEvent::AgentOffline { agent_id });
        Some(rec)
    }

    pub fn resolve_transport(&self, transport: &TransportId) -> TransportStatus {
        let Some(agent_id) = self.by_transport.get(transport).map(|id| id.clone()) else {
            return TransportStatus::Unknown;
        };
        match self.agents.get(&agent_id) {
            Some(rec) if rec.transport == *transport => TransportStatus::Current(agent_id),
            Some(_) => TransportStatus::Superseded(agent_id),
            None => TransportStatus::Unknown,
        }
    }

    /// Current connection of an agent, re-read on every call.
    pub fn current_transport(&self, agent_id: &str) -> Option<TransportId> {
        self.agents.get(agent_id).map(|r| r.transport.clone())
    }

    /// Generation of the live registration of `agent_id`, if any.
    pub fn generation(&self, agent_id: &str) -> Option<u64> {
        self.agents.get(agent_id).map(|r| r.generation)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|r| r.clone())
    }

    /// Online means heard from within the timeout, whether or not the
    /// monitor has swept yet.
    pub fn is_online(&self, agent_id: &str) -> bool {
        let now = Instant::now();
        self.agents
            .get(agent_id)
            .is_some_and(|r| now.saturating_duration_since(r.last_seen) < self.timeout)
    }

    /// Ids whose silence exceeds the timeout as of `now`. Snapshot only;
    /// eviction re-checks each one.
    pub fn stale_candidates(&self, now: Instant) -> Vec<String> {
        self.agents
            .iter()
            .filter(|e| self.is_stale(e.value(), now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Evict one agent if it is still stale. Checked under the entry lock,
    /// so a heartbeat that landed after the snapshot keeps the agent.
    pub fn evict_if_stale(&self, agent_id: &str, now: Instant) -> Option<AgentRecord> {
        let (_, rec) = self.agents.remove_if(agent_id, |_, r| self.is_stale(r, now))?;
        tracing::warn!(
            agent_id = %agent_id,
            silent_secs = now.saturating_duration_since(rec.last_seen).as_secs(),
            "agent evicted after liveness timeout"
        );
        self.presence.publish(PresenceEvent::AgentOffline {
            agent_id: agent_id.to_owned(),
        });
        Some(rec)
    }

    /// List registered agents, sorted by id.
    pub fn list(&self) -> Vec<AgentSummary> {
        let now = Instant::now();
        let mut agents: Vec<AgentSummary> = self
            .agents
            .iter()
            .map(|r| AgentSummary {
                agent_id: r.agent_id.clone(),
                online: now.saturating_duration_since(r.last_seen) < self.timeout,
                registered_at: r.registered_at,
                last_seen: r.last_seen_at,
                metadata: r.metadata.clone(),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn online_count(&self) -> usize {
        let now = Instant::now();
        self.agents
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_seen) < self.timeout)
            .count()
    }

    fn is_stale(&self, rec: &AgentRecord, now: Instant) -> bool {
        now.saturating_duration_since(rec.last_seen) > self.timeout
    }

    fn generate_id(&self) -> String {
        loop {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(8);
            if !self.agents.contains_key(&id) {
                return id;
            }
        }
    }
}
