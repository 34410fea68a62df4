//! Session broker: pairs a controller with a registered agent and drives the
//! `pending → active → closed` lifecycle.
//!
//! Each session lives behind its own mutex, so work on one session never
//! waits on another. Lock order is map shard, then session mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rb_protocol::{CloseReason, ServerMessage, SessionState};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::{BrokerError, Result};
use crate::registry::{AgentRegistry, TransportStatus};
use crate::transport::{ConnectionTable, TransportId};

/// Attempts at generating a free session id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_id: String,
    /// Registration generation of the agent this session was paired with.
    pub agent_generation: u64,
    pub controller: TransportId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<Instant>,
    pub close_reason: Option<CloseReason>,
}

impl SessionRecord {
    fn pending(
        session_id: String,
        agent_id: &str,
        agent_generation: u64,
        controller: &TransportId,
    ) -> Self {
        Self {
            session_id,
            agent_id: agent_id.to_owned(),
            agent_generation,
            controller: controller.clone(),
            state: SessionState::Pending,
            created_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            controller_id: self.controller.to_string(),
            state: self.state,
            created_at: self.created_at,
            close_reason: self.close_reason,
        }
    }
}

/// Serializable view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_id: String,
    pub controller_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub pending: usize,
    pub active: usize,
    pub closed: usize,
}

impl SessionCounts {
    /// Sessions that can still carry traffic.
    pub fn live(&self) -> usize {
        self.pending + self.active
    }
}

/// Which side of a session acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Agent,
    Controller,
    /// The broker itself (neither participant initiated).
    Broker,
}

pub(crate) type SessionCell = Arc<Mutex<SessionRecord>>;

pub(crate) fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Pending => "pending",
        SessionState::Active => "active",
        SessionState::Closed => "closed",
    }
}

pub(crate) fn invalid_state(rec: &SessionRecord, expected: &'static str) -> BrokerError {
    BrokerError::InvalidState {
        session_id: rec.session_id.clone(),
        expected,
        actual: state_name(rec.state),
    }
}

/// `sess_<agent>_<controller digest>_<seq>`. `seq` is process-wide and
/// monotonic, so two calls never produce the same id.
pub(crate) fn session_id_for(agent_id: &str, controller: &TransportId, seq: u64) -> String {
    let digest = hex::encode(Sha256::digest(controller.as_str().as_bytes()));
    format!("sess_{agent_id}_{}_{seq}", &digest[..8])
}

pub struct SessionBroker {
    sessions: DashMap<String, SessionCell>,
    seq: AtomicU64,
    registry: Arc<AgentRegistry>,
    connections: Arc<ConnectionTable>,
}

impl SessionBroker {
    pub fn new(registry: Arc<AgentRegistry>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            sessions: DashMap::new(),
            seq: AtomicU64::new(0),
            registry,
            connections,
        }
    }

    /// Open a pending session between `controller` and an online agent and
    /// tell the agent about it.
    pub fn request_session(
        &self,
        agent_id: &str,
        controller: &TransportId,
    ) -> Result<SessionRecord> {
        if !self.registry.is_online(agent_id) {
            return Err(BrokerError::AgentNotFound(agent_id.to_owned()));
        }
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| BrokerError::AgentNotFound(agent_id.to_owned()))?;

        let record = self.allocate(agent_id, agent.generation, controller)?;

        // The agent may have left between the lookup and the insert, after
        // its sessions were already swept.
        if self.registry.generation(agent_id) != Some(agent.generation) {
            self.sessions.remove(&record.session_id);
            return Err(BrokerError::AgentNotFound(agent_id.to_owned()));
        }

        let request = ServerMessage::SessionRequest {
            session_id: record.session_id.clone(),
            controller_id: controller.to_string(),
        };
        if let Err(e) = self.connections.deliver(&agent.transport, request) {
            self.sessions.remove(&record.session_id);
            return Err(e);
        }

        tracing::info!(
            session_id = %record.session_id,
            agent_id = %agent_id,
            controller = %controller,
            "session requested"
        );
        Ok(record)
    }

    /// Agent acknowledges a pending session.
    pub fn accept_session(&self, session_id: &str, caller: &TransportId) -> Result<SessionRecord> {
        let cell = self.cell(session_id)?;
        let mut rec = cell.lock();

        if self.party_of(&rec, caller)? != Party::Agent {
            return Err(BrokerError::NotParticipant(session_id.to_owned()));
        }
        if rec.state != SessionState::Pending {
            return Err(invalid_state(&rec, "pending"));
        }

        rec.state = SessionState::Active;
        self.connections.notify(
            &rec.controller,
            ServerMessage::SessionActive {
                session_id: rec.session_id.clone(),
                agent_id: rec.agent_id.clone(),
            },
        );
        tracing::info!(session_id = %session_id, agent_id = %rec.agent_id, "session active");
        Ok(rec.clone())
    }

    /// Explicit close from one of the participants.
    pub fn close_requested(&self, session_id: &str, caller: &TransportId) -> Result<bool> {
        let party = {
            let cell = self.cell(session_id)?;
            let rec = cell.lock();
            self.party_of(&rec, caller)?
        };
        self.close_session(session_id, CloseReason::Requested, party)
    }

    /// Move a session to `closed`. Idempotent: only the call that performs
    /// the transition notifies, and it notifies whoever did not initiate.
    pub fn close_session(
        &self,
        session_id: &str,
        reason: CloseReason,
        initiator: Party,
    ) -> Result<bool> {
        let cell = self.cell(session_id)?;
        let closed = {
            let mut rec = cell.lock();
            if rec.state == SessionState::Closed {
                return Ok(false);
            }
            rec.state = SessionState::Closed;
            rec.closed_at = Some(Instant::now());
            rec.close_reason = Some(reason);
            rec.clone()
        };

        let msg = ServerMessage::SessionClosed {
            session_id: closed.session_id.clone(),
            reason,
        };
        if initiator != Party::Controller {
            self.connections.notify(&closed.controller, msg.clone());
        }
        if initiator != Party::Agent {
            let agent = self
                .registry
                .get(&closed.agent_id)
                .filter(|a| a.generation == closed.agent_generation);
            if let Some(agent) = agent {
                self.connections.notify(&agent.transport, msg);
            }
        }

        tracing::info!(
            session_id = %session_id,
            agent_id = %closed.agent_id,
            reason = ?reason,
            "session closed"
        );
        Ok(true)
    }

    /// Close every live session paired with the given registration of an
    /// agent that went away. Sessions of a later registration under the
    /// same id are left alone.
    pub fn close_for_agent(&self, agent_id: &str, generation: u64) -> Vec<String> {
        let ids = self.live_matching(|rec| {
            rec.agent_id == agent_id && rec.agent_generation == generation
        });
        self.close_all(ids, CloseReason::AgentGone, Party::Agent)
    }

    /// Close every live session driven by a controller connection that dropped.
    pub fn close_for_controller(&self, controller: &TransportId) -> Vec<String> {
        let ids = self.live_matching(|rec| rec.controller == *controller);
        self.close_all(ids, CloseReason::ControllerGone, Party::Controller)
    }

    /// Drop closed sessions whose grace window has elapsed as of `now`.
    pub fn purge_closed(&self, grace: Duration, now: Instant) -> Vec<String> {
        let mut purged = Vec::new();
        self.sessions.retain(|id, cell| {
            let rec = cell.lock();
            let expired = rec
                .closed_at
                .is_some_and(|at| now.saturating_duration_since(at) >= grace);
            if expired {
                purged.push(id.clone());
            }
            !expired
        });
        if !purged.is_empty() {
            tracing::debug!(purged = purged.len(), "purged closed sessions");
        }
        purged
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|c| c.lock().clone())
    }

    /// All retained sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> =
            self.sessions.iter().map(|c| c.lock().summary()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for cell in self.sessions.iter() {
            match cell.lock().state {
                SessionState::Pending => counts.pending += 1,
                SessionState::Active => counts.active += 1,
                SessionState::Closed => counts.closed += 1,
            }
        }
        counts
    }

    /// Number of retained sessions (closed ones included until purged).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ── crate-internal ──────────────────────────────────────────────

    pub(crate) fn cell(&self, session_id: &str) -> Result<SessionCell> {
        self.sessions
            .get(session_id)
            .map(|c| c.clone())
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_owned()))
    }

    /// Which side of `rec` the caller is. The agent side is whatever
    /// connection currently holds the agent id.
    pub(crate) fn party_of(&self, rec: &SessionRecord, caller: &TransportId) -> Result<Party> {
        if rec.controller == *caller {
            return Ok(Party::Controller);
        }
        match self.registry.resolve_transport(caller) {
            TransportStatus::Current(id) if id == rec.agent_id => Ok(Party::Agent),
            TransportStatus::Superseded(id) if id == rec.agent_id => {
                Err(BrokerError::StaleTransport(id))
            }
            _ => Err(BrokerError::NotParticipant(rec.session_id.clone())),
        }
    }

    fn allocate(
        &self,
        agent_id: &str,
        generation: u64,
        controller: &TransportId,
    ) -> Result<SessionRecord> {
        let mut attempt = 1;
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let session_id = session_id_for(agent_id, controller, seq);
            let record = SessionRecord::pending(session_id, agent_id, generation, controller);
            match self.try_insert(record) {
                Ok(rec) => return Ok(rec),
                Err(e) if attempt < MAX_ID_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "session id collision, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_insert(&self, record: SessionRecord) -> Result<SessionRecord> {
        match self.sessions.entry(record.session_id.clone()) {
            Entry::Occupied(e) => Err(BrokerError::DuplicateSessionId(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(Arc::new(Mutex::new(record.clone())));
                Ok(record)
            }
        }
    }

    fn live_matching(&self, pred: impl Fn(&SessionRecord) -> bool) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|c| {
                let rec = c.lock();
                rec.state != SessionState::Closed && pred(&rec)
            })
            .map(|c| c.key().clone())
            .collect()
    }

    fn close_all(&self, ids: Vec<String>, reason: CloseReason, initiator: Party) -> Vec<String> {
        ids.into_iter()
            .filter(|id| match self.close_session(id, reason, initiator) {
                Ok(closed) => closed,
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "session vanished before close");
                    false
                }
            })
            .collect()
    }
}
