use rb_protocol::{ErrorCode, ServerMessage};

/// Conditions reported back to the originator of a broker operation.
///
/// None of these are fatal to the broker or to the connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {session_id} is {actual}, expected {expected}")]
    InvalidState {
        session_id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Generated session id already taken. Retried internally.
    #[error("duplicate session id: {0}")]
    DuplicateSessionId(String),

    /// The sender was superseded by a newer registration of the same agent.
    #[error("stale transport for agent {0}")]
    StaleTransport(String),

    #[error("not a participant of session {0}")]
    NotParticipant(String),

    #[error("{role} connections may not {action}")]
    Forbidden {
        role: rb_protocol::Role,
        action: &'static str,
    },

    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Wire code for this condition. `None` means the message is dropped
    /// without a reply.
    pub fn code(&self) -> Option<ErrorCode> {
        let code = match self {
            BrokerError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            BrokerError::UnknownSession(_) => ErrorCode::UnknownSession,
            BrokerError::InvalidState { .. } => ErrorCode::InvalidState,
            BrokerError::SessionClosed(_) => ErrorCode::SessionClosed,
            BrokerError::NotParticipant(_) => ErrorCode::NotParticipant,
            BrokerError::Forbidden { .. } => ErrorCode::Forbidden,
            BrokerError::Transport(_) => ErrorCode::Transport,
            BrokerError::DuplicateSessionId(_) => ErrorCode::Internal,
            BrokerError::StaleTransport(_) => return None,
        };
        Some(code)
    }

    /// Session the error concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BrokerError::UnknownSession(id)
            | BrokerError::SessionClosed(id)
            | BrokerError::NotParticipant(id)
            | BrokerError::DuplicateSessionId(id) => Some(id),
            BrokerError::InvalidState { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Structured reply for the originating caller.
    pub fn to_message(&self) -> Option<ServerMessage> {
        let code = self.code()?;
        Some(ServerMessage::Error {
            code,
            message: self.to_string(),
            session_id: self.session_id().map(str::to_owned),
        })
    }
}
