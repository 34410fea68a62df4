use std::sync::Arc;
use std::time::Duration;

use rb_broker::{AllowAll, Broker, BrokerError, LivenessMonitor, TransportId};
use rb_domain::config::BrokerConfig;
use rb_protocol::{ClientMessage, CloseReason, Metadata, Role, ServerMessage, SessionState};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Peer {
    id: TransportId,
    role: Role,
    rx: mpsc::Receiver<ServerMessage>,
}

impl Peer {
    fn connect(broker: &Broker, role: Role) -> Self {
        let id = TransportId::generate();
        let rx = broker.on_connect(&id, role);
        Self { id, role, rx }
    }

    fn send(&self, broker: &Broker, msg: ClientMessage) -> Option<ServerMessage> {
        broker.handle_message(&self.id, self.role, msg)
    }

    fn next(&mut self) -> ServerMessage {
        self.rx.try_recv().expect("expected a queued message")
    }
}

fn broker() -> Arc<Broker> {
    Arc::new(Broker::new(&BrokerConfig::default(), Arc::new(AllowAll)))
}

#[test]
fn register_request_accept_command_result_disconnect() {
    let broker = broker();
    let mut agent = Peer::connect(&broker, Role::Agent);
    let mut controller = Peer::connect(&broker, Role::Controller);

    let reply = agent.send(
        &broker,
        ClientMessage::AgentRegister {
            agent_id: Some("A".into()),
            metadata: Metadata::new(),
        },
    );
    assert_eq!(reply, Some(ServerMessage::AgentRegistered { agent_id: "A".into() }));

    let session_id = match controller.send(
        &broker,
        ClientMessage::RequestSession {
            agent_id: "A".into(),
        },
    ) {
        Some(ServerMessage::SessionCreated { session_id, agent_id }) => {
            assert_eq!(agent_id, "A");
            session_id
        }
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(
        agent.next(),
        ServerMessage::SessionRequest {
            session_id: session_id.clone(),
            controller_id: controller.id.to_string(),
        }
    );

    assert!(agent
        .send(
            &broker,
            ClientMessage::AcceptSession {
                session_id: session_id.clone(),
            },
        )
        .is_none());
    assert_eq!(
        controller.next(),
        ServerMessage::SessionActive {
            session_id: session_id.clone(),
            agent_id: "A".into(),
        }
    );

    let reply = controller.send(
        &broker,
        ClientMessage::SendCommand {
            session_id: session_id.clone(),
            command: json!("ls"),
        },
    );
    assert_eq!(
        reply,
        Some(ServerMessage::CommandAccepted {
            session_id: session_id.clone(),
            command_id: 0,
        })
    );
    assert_eq!(
        agent.next(),
        ServerMessage::Execute {
            session_id: session_id.clone(),
            command_id: 0,
            command: json!("ls"),
        }
    );

    agent.send(
        &broker,
        ClientMessage::CommandResult {
            session_id: session_id.clone(),
            command_id: 0,
            output: json!("file.txt"),
        },
    );
    assert_eq!(
        controller.next(),
        ServerMessage::Result {
            session_id: session_id.clone(),
            command_id: 0,
            output: json!("file.txt"),
        }
    );

    broker.on_disconnect(&agent.id);
    assert_eq!(
        controller.next(),
        ServerMessage::SessionClosed {
            session_id: session_id.clone(),
            reason: CloseReason::AgentGone,
        }
    );

    let reply = controller.send(
        &broker,
        ClientMessage::SendCommand {
            session_id: session_id.clone(),
            command: json!("pwd"),
        },
    );
    match reply {
        Some(ServerMessage::Error { code, session_id: sid, .. }) => {
            assert_eq!(code, rb_protocol::ErrorCode::SessionClosed);
            assert_eq!(sid.as_deref(), Some(session_id.as_str()));
        }
        other => panic!("unexpected {other:?}"),
    }

    let status = broker.status();
    assert_eq!(status.agent_count, 0);
    assert_eq!(status.session_count, 0);
    assert_eq!(status.sessions.closed, 1);
}

#[test]
fn reconnecting_agent_takes_over_live_sessions() {
    let broker = broker();
    let mut first = Peer::connect(&broker, Role::Agent);
    let mut second = Peer::connect(&broker, Role::Agent);
    let controller = Peer::connect(&broker, Role::Controller);

    broker.register_agent(&first.id, "A", Metadata::new());
    let rec = broker.request_session(&controller.id, "A").unwrap();
    first.next();
    broker.accept_session(&first.id, &rec.session_id).unwrap();

    broker.register_agent(&second.id, "A", Metadata::new());
    assert_eq!(broker.registry().len(), 1);

    broker
        .send_command(&controller.id, &rec.session_id, json!("uptime"))
        .unwrap();
    assert!(matches!(second.next(), ServerMessage::Execute { command_id: 0, .. }));
    assert!(first.rx.try_recv().is_err());

    // The old socket closing must not take the new registration down.
    broker.on_disconnect(&first.id);
    assert!(broker.registry().is_online("A"));
    assert_eq!(
        broker.sessions().get(&rec.session_id).unwrap().state,
        SessionState::Active
    );
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_evicted_with_its_sessions() {
    let broker = broker();
    let monitor = LivenessMonitor::new(broker.clone());
    let agent = Peer::connect(&broker, Role::Agent);
    let mut controller = Peer::connect(&broker, Role::Controller);
    let mut presence = broker.subscribe_presence();

    broker.register_agent(&agent.id, "A", Metadata::new());
    let mut sessions = Vec::new();
    for _ in 0..2 {
        let rec = broker.request_session(&controller.id, "A").unwrap();
        broker.accept_session(&agent.id, &rec.session_id).unwrap();
        assert!(matches!(controller.next(), ServerMessage::SessionActive { .. }));
        sessions.push(rec.session_id);
    }

    tokio::time::advance(Duration::from_secs(91)).await;
    let report = monitor.sweep(Instant::now());
    assert_eq!(report.evicted, vec!["A".to_string()]);

    for _ in 0..2 {
        assert!(matches!(
            controller.next(),
            ServerMessage::SessionClosed {
                reason: CloseReason::AgentGone,
                ..
            }
        ));
    }
    for id in &sessions {
        assert_eq!(
            broker.send_command(&controller.id, id, json!("ls")).unwrap_err(),
            BrokerError::SessionClosed(id.clone())
        );
    }
    assert!(broker
        .request_session(&controller.id, "A")
        .is_err());

    let mut events = Vec::new();
    while let Ok(ev) = presence.try_recv() {
        events.push(ServerMessage::from(ev));
    }
    assert_eq!(
        events,
        vec![
            ServerMessage::AgentOnline { agent_id: "A".into() },
            ServerMessage::AgentOffline { agent_id: "A".into() },
        ]
    );
}
