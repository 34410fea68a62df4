//! Connection table: per-connection outbound queues keyed by transport id.
//!
//! The socket layer owns the receiving half of each queue and drains it into
//! the WebSocket; the broker only ever enqueues, so delivery never blocks a
//! broker operation.

use std::fmt;

use dashmap::DashMap;
use rb_protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{BrokerError, Result};

/// Opaque handle for one live connection. Not stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(String);

impl TransportId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransportId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sending half of a connection's outbound queue.
pub type OutboundSink = mpsc::Sender<ServerMessage>;

pub struct ConnectionTable {
    conns: DashMap<TransportId, OutboundSink>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            conns: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open an outbound queue for a new connection. Re-attaching an id
    /// replaces (and closes) its previous queue.
    pub fn attach(&self, transport: &TransportId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.conns.insert(transport.clone(), tx);
        rx
    }

    pub fn detach(&self, transport: &TransportId) -> bool {
        self.conns.remove(transport).is_some()
    }

    pub fn is_connected(&self, transport: &TransportId) -> bool {
        self.conns.contains_key(transport)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Enqueue a message for one connection without waiting.
    pub fn deliver(&self, to: &TransportId, msg: ServerMessage) -> Result<()> {
        let sink = self
            .conns
            .get(to)
            .map(|s| s.clone())
            .ok_or_else(|| BrokerError::Transport(format!("connection {to} is gone")))?;

        match sink.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(transport = %to, "outbound queue full, message not delivered");
                Err(BrokerError::Transport(format!(
                    "outbound queue for {to} is full"
                )))
            }
            Err(TrySendError::Closed(_)) => {
                Err(BrokerError::Transport(format!("connection {to} is closing")))
            }
        }
    }

    /// Best-effort delivery for notifications whose loss is tolerable.
    pub fn notify(&self, to: &TransportId, msg: ServerMessage) {
        if let Err(e) = self.deliver(to, msg) {
            tracing::debug!(transport = %to, error = %e, "notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(ts: i64) -> ServerMessage {
        ServerMessage::Pong { timestamp: ts }
    }

    #[test]
    fn deliver_reaches_attached_queue_in_order() {
        let table = ConnectionTable::new(8);
        let t = TransportId::from("t1");
        let mut rx = table.attach(&t);

        table.deliver(&t, pong(1)).unwrap();
        table.deliver(&t, pong(2)).unwrap();

        assert_eq!(rx.try_recv().unwrap(), pong(1));
        assert_eq!(rx.try_recv().unwrap(), pong(2));
    }

    #[test]
    fn deliver_to_unknown_transport_fails() {
        let table = ConnectionTable::new(8);
        let err = table.deliver(&TransportId::from("nobody"), pong(1)).unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
    }

    #[test]
    fn full_queue_is_reported() {
        let table = ConnectionTable::new(1);
        let t = TransportId::from("t1");
        let _rx = table.attach(&t);

        table.deliver(&t, pong(1)).unwrap();
        assert!(matches!(
            table.deliver(&t, pong(2)),
            Err(BrokerError::Transport(_))
        ));
    }

    #[test]
    fn detach_stops_delivery() {
        let table = ConnectionTable::new(4);
        let t = TransportId::from("t1");
        let _rx = table.attach(&t);
        assert!(table.detach(&t));
        assert!(!table.detach(&t));
        assert!(table.deliver(&t, pong(1)).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(TransportId::generate(), TransportId::generate());
    }
}
