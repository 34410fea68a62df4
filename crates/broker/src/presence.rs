//! Fan-out of agent presence changes to every interested subscriber.

use rb_protocol::ServerMessage;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    AgentOnline { agent_id: String },
    AgentOffline { agent_id: String },
}

impl From<PresenceEvent> for ServerMessage {
    fn from(ev: PresenceEvent) -> Self {
        match ev {
            PresenceEvent::AgentOnline { agent_id } => ServerMessage::AgentOnline { agent_id },
            PresenceEvent::AgentOffline { agent_id } => ServerMessage::AgentOffline { agent_id },
        }
    }
}

/// Fire-and-forget publisher. Publishing never waits on subscribers and
/// never fails when nobody is listening.
#[derive(Clone)]
pub struct PresenceHub {
    tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PresenceEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
