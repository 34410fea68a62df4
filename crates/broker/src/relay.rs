//! Relay engine: forwards commands, results and file chunks between the two
//! parties of an active session, and keeps a bounded per-session command log
//! that correlates results with the commands they answer.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rb_protocol::{ServerMessage, SessionState};
use serde_json::Value;

use crate::error::{BrokerError, Result};
use crate::registry::AgentRegistry;
use crate::sessions::{invalid_state, Party, SessionBroker, SessionRecord};
use crate::transport::{ConnectionTable, TransportId};

/// Upper bound on the stored copy of a command result.
pub const MAX_STORED_RESULT_BYTES: usize = 64 * 1024;

/// Upper bound on the stored copy of a command payload.
pub const MAX_STORED_COMMAND_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub command_id: u64,
    /// Serialized command, cut at [`MAX_STORED_COMMAND_BYTES`]. The agent
    /// always receives the full payload.
    pub payload: String,
    pub payload_truncated: bool,
    pub issued_at: DateTime<Utc>,
    /// Serialized result, cut at [`MAX_STORED_RESULT_BYTES`].
    pub result: Option<String>,
    pub result_truncated: bool,
}

/// Append-only log for one session. Ids start at 0 and never repeat, even
/// after old entries fall off the front.
#[derive(Debug, Default)]
struct CommandLog {
    next_id: u64,
    entries: VecDeque<CommandEntry>,
}

impl CommandLog {
    fn push(&mut self, entry: CommandEntry, cap: usize) {
        self.next_id = entry.command_id + 1;
        self.entries.push_back(entry);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
    }

    fn find_mut(&mut self, command_id: u64) -> Option<&mut CommandEntry> {
        // Ids are contiguous inside the window.
        let first = self.entries.front()?.command_id;
        let idx = command_id.checked_sub(first)?;
        self.entries.get_mut(usize::try_from(idx).ok()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Delivered,
    /// No outstanding command with that id; nothing was forwarded or stored.
    Dropped,
}

pub struct RelayEngine {
    sessions: Arc<SessionBroker>,
    registry: Arc<AgentRegistry>,
    connections: Arc<ConnectionTable>,
    logs: DashMap<String, Arc<Mutex<CommandLog>>>,
    history_cap: usize,
}

impl RelayEngine {
    pub fn new(
        sessions: Arc<SessionBroker>,
        registry: Arc<AgentRegistry>,
        connections: Arc<ConnectionTable>,
        history_cap: usize,
    ) -> Self {
        Self {
            sessions,
            registry,
            connections,
            logs: DashMap::new(),
            history_cap: history_cap.max(1),
        }
    }

    /// Controller → agent. Returns the assigned command id.
    ///
    /// The id is assigned and the `execute` frame enqueued while the session
    /// lock is held, so the agent sees commands in id order.
    pub fn forward_command(
        &self,
        session_id: &str,
        caller: &TransportId,
        command: Value,
    ) -> Result<u64> {
        let cell = self.sessions.cell(session_id)?;
        let rec = cell.lock();
        self.expect_party(&rec, caller, Party::Controller)?;
        ensure_active(&rec)?;

        let agent_transport = self
            .registry
            .current_transport(&rec.agent_id)
            .ok_or_else(|| BrokerError::AgentNotFound(rec.agent_id.clone()))?;

        let log = self.log(session_id);
        let mut log = log.lock();
        let command_id = log.next_id;

        let (payload, payload_truncated) =
            truncate_stored(command.to_string(), MAX_STORED_COMMAND_BYTES);
        self.connections.deliver(
            &agent_transport,
            ServerMessage::Execute {
                session_id: session_id.to_owned(),
                command_id,
                command,
            },
        )?;

        log.push(
            CommandEntry {
                command_id,
                payload,
                payload_truncated,
                issued_at: Utc::now(),
                result: None,
                result_truncated: false,
            },
            self.history_cap,
        );

        tracing::debug!(session_id = %session_id, command_id, "command forwarded");
        Ok(command_id)
    }

    /// Agent → controller, correlated by `command_id`.
    pub fn forward_result(
        &self,
        session_id: &str,
        caller: &TransportId,
        command_id: u64,
        output: Value,
    ) -> Result<ResultOutcome> {
        let cell = self.sessions.cell(session_id)?;
        let rec = cell.lock();
        self.expect_party(&rec, caller, Party::Agent)?;
        ensure_active(&rec)?;

        let Some(log) = self.logs.get(session_id).map(|l| l.clone()) else {
            tracing::warn!(session_id = %session_id, command_id, "result for session with no commands dropped");
            return Ok(ResultOutcome::Dropped);
        };
        let mut log = log.lock();
        let Some(entry) = log.find_mut(command_id).filter(|e| e.result.is_none()) else {
            tracing::warn!(session_id = %session_id, command_id, "unmatched result dropped");
            return Ok(ResultOutcome::Dropped);
        };

        let stored = output.to_string();
        self.connections.deliver(
            &rec.controller,
            ServerMessage::Result {
                session_id: session_id.to_owned(),
                command_id,
                output,
            },
        )?;

        let (stored, truncated) = truncate_stored(stored, MAX_STORED_RESULT_BYTES);
        entry.result = Some(stored);
        entry.result_truncated = truncated;

        tracing::debug!(session_id = %session_id, command_id, truncated, "result forwarded");
        Ok(ResultOutcome::Delivered)
    }

    /// Pass a file chunk to the other party, in arrival order.
    pub fn forward_file_chunk(
        &self,
        session_id: &str,
        caller: &TransportId,
        chunk_number: u64,
        data: String,
    ) -> Result<()> {
        let cell = self.sessions.cell(session_id)?;
        let rec = cell.lock();
        let party = self.sessions.party_of(&rec, caller)?;
        ensure_active(&rec)?;

        let target = match party {
            Party::Controller => self
                .registry
                .current_transport(&rec.agent_id)
                .ok_or_else(|| BrokerError::AgentNotFound(rec.agent_id.clone()))?,
            _ => rec.controller.clone(),
        };

        self.connections.deliver(
            &target,
            ServerMessage::FileData {
                session_id: session_id.to_owned(),
                chunk_number,
                data,
            },
        )?;
        tracing::trace!(session_id = %session_id, chunk_number, "file chunk relayed");
        Ok(())
    }

    /// Retained command entries of a session, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<CommandEntry> {
        self.logs
            .get(session_id)
            .map(|l| l.lock().entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn drop_log(&self, session_id: &str) -> bool {
        self.logs.remove(session_id).is_some()
    }

    fn log(&self, session_id: &str) -> Arc<Mutex<CommandLog>> {
        self.logs
            .entry(session_id.to_owned())
            .or_default()
            .value()
            .clone()
    }

    fn expect_party(&self, rec: &SessionRecord, caller: &TransportId, want: Party) -> Result<()> {
        if self.sessions.party_of(rec, caller)? == want {
            Ok(())
        } else {
            Err(BrokerError::NotParticipant(rec.session_id.clone()))
        }
    }
}

fn ensure_active(rec: &SessionRecord) -> Result<()> {
    match rec.state {
        SessionState::Active => Ok(()),
        SessionState::Closed => Err(BrokerError::SessionClosed(rec.session_id.clone())),
        SessionState::Pending => Err(invalid_state(rec, "active")),
    }
}

/// Cut `s` to at most `limit` bytes on a char boundary.
fn truncate_stored(mut s: String, limit: usize) -> (String, bool) {
    if s.len() <= limit {
        return (s, false);
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    (s, true)
}
