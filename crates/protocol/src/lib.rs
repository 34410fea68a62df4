//! Broker protocol: WebSocket message types exchanged between agents,
//! controllers and the relay broker.
//!
//! Every frame is a JSON object tagged by `"type"`. Payloads of commands,
//! results and file chunks are opaque to the broker and travel unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value system info an agent attaches to itself.
pub type Metadata = serde_json::Map<String, Value>;

/// Which side of a session a connection claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Controller,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => f.write_str("agent"),
            Role::Controller => f.write_str("controller"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// One of the participants asked for it.
    Requested,
    /// The agent disconnected or was evicted by the liveness monitor.
    AgentGone,
    /// The controller's connection dropped.
    ControllerGone,
}

/// Stable machine-readable error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AgentNotFound,
    UnknownSession,
    InvalidState,
    SessionClosed,
    NotParticipant,
    Forbidden,
    Transport,
    InvalidMessage,
    Internal,
}

/// One row of an agent listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Client → broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Agent: announce presence. An absent or empty id asks the broker to
    /// pick one.
    AgentRegister {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        metadata: Metadata,
    },

    /// Agent: liveness signal. Metadata, when present, replaces the stored map.
    Heartbeat {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        metadata: Option<Metadata>,
    },

    /// Controller: greet the broker.
    ControllerHello,

    ListAgents,

    /// Controller: open a session with an online agent.
    RequestSession { agent_id: String },

    /// Agent: acknowledge a pending session.
    AcceptSession { session_id: String },

    CloseSession { session_id: String },

    /// Controller: relay a command to the session's agent.
    SendCommand { session_id: String, command: Value },

    /// Agent: relay the result of a previously forwarded command.
    CommandResult {
        session_id: String,
        command_id: u64,
        output: Value,
    },

    /// Either side: relay one chunk of a file transfer.
    FileChunk {
        session_id: String,
        chunk_number: u64,
        data: String,
    },

    Ping { timestamp: i64 },
}

/// Broker → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AgentRegistered { agent_id: String },

    ControllerWelcome { broker_version: String },

    AgentsList { agents: Vec<AgentSummary> },

    /// Broadcast to every connection.
    AgentOnline { agent_id: String },

    /// Broadcast to every connection.
    AgentOffline { agent_id: String },

    /// To the controller: a pending session was created.
    SessionCreated { session_id: String, agent_id: String },

    /// To the agent: a controller wants a session.
    SessionRequest {
        session_id: String,
        controller_id: String,
    },

    SessionActive { session_id: String, agent_id: String },

    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },

    /// To the controller: the command was assigned an id and handed to the agent.
    CommandAccepted { session_id: String, command_id: u64 },

    /// To the agent: run this.
    Execute {
        session_id: String,
        command_id: u64,
        command: Value,
    },

    /// To the controller.
    Result {
        session_id: String,
        command_id: u64,
        output: Value,
    },

    FileData {
        session_id: String,
        chunk_number: u64,
        data: String,
    },

    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    Pong { timestamp: i64 },
}
