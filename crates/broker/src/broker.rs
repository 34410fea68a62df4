//! The broker facade: owns every component and exposes the operations the
//! transport layer drives.

use std::sync::Arc;

use rb_domain::config::BrokerConfig;
use rb_protocol::{AgentSummary, Metadata, Role, ServerMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::auth::Verifier;
use crate::error::{BrokerError, Result};
use crate::presence::{PresenceEvent, PresenceHub};
use crate::registry::{AgentRegistry, TransportStatus};
use crate::relay::{ResultOutcome, RelayEngine};
use crate::sessions::{SessionBroker, SessionRecord};
use crate::status::StatusSnapshot;
use crate::transport::{ConnectionTable, TransportId};

pub const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffered presence events per subscriber before it starts lagging.
const PRESENCE_CAPACITY: usize = 1024;

pub struct Broker {
    config: BrokerConfig,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionBroker>,
    relay: RelayEngine,
    connections: Arc<ConnectionTable>,
    presence: PresenceHub,
    verifier: Arc<dyn Verifier>,
    started: Instant,
}

impl Broker {
    pub fn new(config: &BrokerConfig, verifier: Arc<dyn Verifier>) -> Self {
        let presence = PresenceHub::new(PRESENCE_CAPACITY);
        let registry = Arc::new(AgentRegistry::new(
            config.liveness_timeout(),
            presence.clone(),
        ));
        let connections = Arc::new(ConnectionTable::new(config.outbound_queue_capacity));
        let sessions = Arc::new(SessionBroker::new(registry.clone(), connections.clone()));
        let relay = RelayEngine::new(
            sessions.clone(),
            registry.clone(),
            connections.clone(),
            config.max_command_history,
        );

        Self {
            config: config.clone(),
            registry,
            sessions,
            relay,
            connections,
            presence,
            verifier,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionBroker {
        &self.sessions
    }

    pub fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    // ── connection lifecycle ────────────────────────────────────────

    pub fn verify(&self, role: Role, credential: Option<&str>) -> bool {
        self.verifier.verify(role, credential)
    }

    /// Attach a new connection; the returned queue feeds its socket writer.
    pub fn on_connect(&self, transport: &TransportId, role: Role) -> mpsc::Receiver<ServerMessage> {
        tracing::info!(transport = %transport, role = %role, "connection opened");
        self.connections.attach(transport)
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Tear down everything a dropped connection owned: the agent it spoke
    /// for (and that agent's sessions) and any sessions it controlled.
    pub fn on_disconnect(&self, transport: &TransportId) {
        self.connections.detach(transport);

        if let Some(agent) = self.registry.unregister_by_transport(transport) {
            let closed = self.sessions.close_for_agent(&agent.agent_id, agent.generation);
            if !closed.is_empty() {
                tracing::info!(
                    agent_id = %agent.agent_id,
                    sessions = closed.len(),
                    "closed sessions of disconnected agent"
                );
            }
        }

        let closed = self.sessions.close_for_controller(transport);
        if !closed.is_empty() {
            tracing::info!(
                transport = %transport,
                sessions = closed.len(),
                "closed sessions of disconnected controller"
            );
        }
        tracing::info!(transport = %transport, "connection closed");
    }

    // ── agent operations ────────────────────────────────────────────

    /// Register the calling connection as an agent. Returns the id it was
    /// registered under.
    pub fn register_agent(
        &self,
        transport: &TransportId,
        agent_id: &str,
        metadata: Metadata,
    ) -> String {
        let reg = self.registry.register(agent_id, transport, metadata);
        if let Some(old) = reg.replaced {
            self.sessions.close_for_agent(&old.agent_id, old.generation);
        }
        reg.record.agent_id
    }

    /// Liveness refresh from the calling connection. The connection's own
    /// registration decides which agent is refreshed; a claimed id that
    /// disagrees is ignored.
    pub fn heartbeat(
        &self,
        transport: &TransportId,
        claimed: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        match self.registry.resolve_transport(transport) {
            TransportStatus::Current(agent_id) => {
                if claimed.is_some_and(|c| !c.is_empty() && c != agent_id) {
                    tracing::debug!(
                        agent_id = %agent_id,
                        claimed = ?claimed,
                        "heartbeat claimed a different agent id"
                    );
                }
                self.registry.heartbeat(&agent_id, metadata);
                Ok(())
            }
            TransportStatus::Superseded(agent_id) => Err(BrokerError::StaleTransport(agent_id)),
            TransportStatus::Unknown => {
                tracing::debug!(transport = %transport, "heartbeat from unregistered connection ignored");
                Ok(())
            }
        }
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry.list()
    }

    // ── session operations ──────────────────────────────────────────

    pub fn request_session(&self, controller: &TransportId, agent_id: &str) -> Result<SessionRecord> {
        self.sessions.request_session(agent_id, controller)
    }

    pub fn accept_session(&self, agent: &TransportId, session_id: &str) -> Result<SessionRecord> {
        self.sessions.accept_session(session_id, agent)
    }

    pub fn close_session(&self, caller: &TransportId, session_id: &str) -> Result<bool> {
        self.sessions.close_requested(session_id, caller)
    }

    pub fn send_command(
        &self,
        controller: &TransportId,
        session_id: &str,
        command: serde_json::Value,
    ) -> Result<u64> {
        self.relay.forward_command(session_id, controller, command)
    }

    pub fn command_result(
        &self,
        agent: &TransportId,
        session_id: &str,
        command_id: u64,
        output: serde_json::Value,
    ) -> Result<ResultOutcome> {
        self.relay.forward_result(session_id, agent, command_id, output)
    }

    pub fn file_chunk(
        &self,
        caller: &TransportId,
        session_id: &str,
        chunk_number: u64,
        data: String,
    ) -> Result<()> {
        self.relay.forward_file_chunk(session_id, caller, chunk_number, data)
    }

    // ── housekeeping ────────────────────────────────────────────────

    /// Evict one agent if it is still stale at `now`, closing its sessions
    /// the same way a disconnect would. Returns the sessions closed.
    pub fn evict_if_stale(&self, agent_id: &str, now: Instant) -> Option<Vec<String>> {
        let rec = self.registry.evict_if_stale(agent_id, now)?;
        Some(self.sessions.close_for_agent(&rec.agent_id, rec.generation))
    }

    /// Forget closed sessions past their grace window, command logs included.
    pub fn purge_closed(&self, now: Instant) -> Vec<String> {
        let purged = self
            .sessions
            .purge_closed(self.config.closed_session_grace(), now);
        for id in &purged {
            self.relay.drop_log(id);
        }
        purged
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::project(&self.registry, &self.sessions, self.started)
    }
}

#[cfg(test)]
mod tests {
    use rb_protocol::{CloseReason, SessionState};
    use serde_json::json;

    use super::*;
    use crate::auth::AllowAll;

    fn broker() -> Broker {
        Broker::new(&BrokerConfig::default(), Arc::new(AllowAll))
    }

    #[test]
    fn controller_disconnect_closes_its_sessions() {
        let b = broker();
        let (a, c) = (TransportId::from("ta"), TransportId::from("tc"));
        let mut arx = b.on_connect(&a, Role::Agent);
        let _crx = b.on_connect(&c, Role::Controller);
        b.register_agent(&a, "A", Metadata::new());
        let rec = b.request_session(&c, "A").unwrap();
        b.accept_session(&a, &rec.session_id).unwrap();
        while arx.try_recv().is_ok() {}

        b.on_disconnect(&c);

        assert_eq!(b.sessions().get(&rec.session_id).unwrap().state, SessionState::Closed);
        assert_eq!(
            arx.try_recv().unwrap(),
            ServerMessage::SessionClosed {
                session_id: rec.session_id,
                reason: CloseReason::ControllerGone,
            }
        );
        assert!(b.registry().get("A").is_some());
    }

    #[test]
    fn superseded_connection_cannot_heartbeat_or_disconnect_the_agent() {
        let b = broker();
        let (old, new) = (TransportId::from("t1"), TransportId::from("t2"));
        let _r1 = b.on_connect(&old, Role::Agent);
        let _r2 = b.on_connect(&new, Role::Agent);
        b.register_agent(&old, "A", Metadata::new());
        b.register_agent(&new, "A", Metadata::new());

        assert_eq!(
            b.heartbeat(&old, Some("A"), None).unwrap_err(),
            BrokerError::StaleTransport("A".into())
        );
        b.on_disconnect(&old);
        assert_eq!(b.registry().current_transport("A"), Some(new));
    }

    #[test]
    fn heartbeat_ignores_claimed_id_of_another_agent() {
        let b = broker();
        let (ta, tb) = (TransportId::from("ta"), TransportId::from("tb"));
        b.register_agent(&ta, "A", Metadata::new());
        b.register_agent(&tb, "B", Metadata::new());

        let mut meta = Metadata::new();
        meta.insert("os".into(), json!("linux"));
        b.heartbeat(&ta, Some("B"), Some(meta)).unwrap();

        assert_eq!(b.registry().get("A").unwrap().metadata["os"], "linux");
        assert!(b.registry().get("B").unwrap().metadata.is_empty());
    }

    #[test]
    fn rename_on_same_connection_closes_old_sessions() {
        let b = broker();
        let (a, c) = (TransportId::from("ta"), TransportId::from("tc"));
        let _arx = b.on_connect(&a, Role::Agent);
        let _crx = b.on_connect(&c, Role::Controller);
        b.register_agent(&a, "old-name", Metadata::new());
        let rec = b.request_session(&c, "old-name").unwrap();

        assert_eq!(b.register_agent(&a, "new-name", Metadata::new()), "new-name");
        assert!(b.registry().get("old-name").is_none());
        assert_eq!(
            b.sessions().get(&rec.session_id).unwrap().close_reason,
            Some(CloseReason::AgentGone)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_cascade_leaves_reregistered_agent_sessions_open() {
        let b = broker();
        let (t1, t2, c) = (
            TransportId::from("ta1"),
            TransportId::from("ta2"),
            TransportId::from("tc"),
        );
        let _r1 = b.on_connect(&t1, Role::Agent);
        let _r2 = b.on_connect(&t2, Role::Agent);
        let _crx = b.on_connect(&c, Role::Controller);
        b.register_agent(&t1, "A", Metadata::new());

        tokio::time::advance(std::time::Duration::from_secs(91)).await;
        let evicted = b.registry().evict_if_stale("A", Instant::now()).unwrap();

        b.register_agent(&t2, "A", Metadata::new());
        let rec = b.request_session(&c, "A").unwrap();
        b.accept_session(&t2, &rec.session_id).unwrap();

        assert!(b
            .sessions()
            .close_for_agent(&evicted.agent_id, evicted.generation)
            .is_empty());
        let live = b.sessions().get(&rec.session_id).unwrap();
        assert_eq!(live.state, SessionState::Active);
        assert_eq!(live.close_reason, None);
        assert!(b.registry().is_online("A"));
        assert_eq!(b.send_command(&c, &rec.session_id, json!("ls")).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_command_logs() {
        let b = broker();
        let (a, c) = (TransportId::from("ta"), TransportId::from("tc"));
        let _arx = b.on_connect(&a, Role::Agent);
        let _crx = b.on_connect(&c, Role::Controller);
        b.register_agent(&a, "A", Metadata::new());
        let rec = b.request_session(&c, "A").unwrap();
        b.accept_session(&a, &rec.session_id).unwrap();
        b.send_command(&c, &rec.session_id, json!("ls")).unwrap();
        b.close_session(&c, &rec.session_id).unwrap();

        tokio::time::advance(b.config().closed_session_grace()).await;
        assert_eq!(b.purge_closed(Instant::now()), vec![rec.session_id.clone()]);
        assert!(b.relay().history(&rec.session_id).is_empty());
        assert!(!b.relay().drop_log(&rec.session_id));
    }
}
