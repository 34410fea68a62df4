//! Inbound message dispatch: role gating, routing to broker operations, and
//! turning outcomes into the reply for the sending connection.

use std::fmt;

use rb_protocol::{ClientMessage, CloseReason, ErrorCode, Role, ServerMessage};

use crate::broker::{Broker, BROKER_VERSION};
use crate::error::{BrokerError, Result};
use crate::transport::TransportId;

/// Wire name of a client message, for logs and `forbidden` errors.
pub fn action_name(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::AgentRegister { .. } => "agent_register",
        ClientMessage::Heartbeat { .. } => "heartbeat",
        ClientMessage::ControllerHello => "controller_hello",
        ClientMessage::ListAgents => "list_agents",
        ClientMessage::RequestSession { .. } => "request_session",
        ClientMessage::AcceptSession { .. } => "accept_session",
        ClientMessage::CloseSession { .. } => "close_session",
        ClientMessage::SendCommand { .. } => "send_command",
        ClientMessage::CommandResult { .. } => "command_result",
        ClientMessage::FileChunk { .. } => "file_chunk",
        ClientMessage::Ping { .. } => "ping",
    }
}

/// Role allowed to send `msg`; `None` means either.
fn required_role(msg: &ClientMessage) -> Option<Role> {
    match msg {
        ClientMessage::AgentRegister { .. }
        | ClientMessage::Heartbeat { .. }
        | ClientMessage::AcceptSession { .. }
        | ClientMessage::CommandResult { .. } => Some(Role::Agent),
        ClientMessage::ControllerHello
        | ClientMessage::RequestSession { .. }
        | ClientMessage::SendCommand { .. } => Some(Role::Controller),
        ClientMessage::ListAgents
        | ClientMessage::CloseSession { .. }
        | ClientMessage::FileChunk { .. }
        | ClientMessage::Ping { .. } => None,
    }
}

/// Reply for a frame that did not parse.
pub fn invalid_message(detail: impl fmt::Display) -> ServerMessage {
    ServerMessage::Error {
        code: ErrorCode::InvalidMessage,
        message: format!("invalid message: {detail}"),
        session_id: None,
    }
}

impl Broker {
    /// Handle one inbound message. Returns the reply for the sender, if any.
    ///
    /// Errors become structured `error` replies; a message from a superseded
    /// connection is dropped without one.
    pub fn handle_message(
        &self,
        transport: &TransportId,
        role: Role,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        let action = action_name(&msg);
        match self.dispatch(transport, role, msg) {
            Ok(reply) => reply,
            Err(BrokerError::StaleTransport(agent_id)) => {
                tracing::debug!(
                    transport = %transport,
                    agent_id = %agent_id,
                    action,
                    "message from superseded connection ignored"
                );
                None
            }
            Err(e) => {
                tracing::debug!(transport = %transport, action, error = %e, "request rejected");
                e.to_message()
            }
        }
    }

    fn dispatch(
        &self,
        transport: &TransportId,
        role: Role,
        msg: ClientMessage,
    ) -> Result<Option<ServerMessage>> {
        if let Some(required) = required_role(&msg) {
            if required != role {
                return Err(BrokerError::Forbidden {
                    role,
                    action: action_name(&msg),
                });
            }
        }

        let reply = match msg {
            ClientMessage::AgentRegister { agent_id, metadata } => {
                let agent_id =
                    self.register_agent(transport, agent_id.as_deref().unwrap_or(""), metadata);
                Some(ServerMessage::AgentRegistered { agent_id })
            }
            ClientMessage::Heartbeat { agent_id, metadata } => {
                self.heartbeat(transport, agent_id.as_deref(), metadata)?;
                None
            }
            ClientMessage::ControllerHello => Some(ServerMessage::ControllerWelcome {
                broker_version: BROKER_VERSION.to_owned(),
            }),
            ClientMessage::ListAgents => Some(ServerMessage::AgentsList {
                agents: self.list_agents(),
            }),
            ClientMessage::RequestSession { agent_id } => {
                let rec = self.request_session(transport, &agent_id)?;
                Some(ServerMessage::SessionCreated {
                    session_id: rec.session_id,
                    agent_id: rec.agent_id,
                })
            }
            ClientMessage::AcceptSession { session_id } => {
                self.accept_session(transport, &session_id)?;
                None
            }
            ClientMessage::CloseSession { session_id } => {
                self.close_session(transport, &session_id)?;
                let reason = self
                    .sessions()
                    .get(&session_id)
                    .and_then(|r| r.close_reason)
                    .unwrap_or(CloseReason::Requested);
                Some(ServerMessage::SessionClosed { session_id, reason })
            }
            ClientMessage::SendCommand {
                session_id,
                command,
            } => {
                let command_id = self.send_command(transport, &session_id, command)?;
                Some(ServerMessage::CommandAccepted {
                    session_id,
                    command_id,
                })
            }
            ClientMessage::CommandResult {
                session_id,
                command_id,
                output,
            } => {
                self.command_result(transport, &session_id, command_id, output)?;
                None
            }
            ClientMessage::FileChunk {
                session_id,
                chunk_number,
                data,
            } => {
                self.file_chunk(transport, &session_id, chunk_number, data)?;
                None
            }
            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong { timestamp }),
        };
        Ok(reply)
    }
}
