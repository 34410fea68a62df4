//! Background sweep that evicts silent agents and forgets closed sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;

/// Shortest sweep period the monitor will run at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    /// Sessions closed because their agent was evicted.
    pub closed: Vec<String>,
    pub purged: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.closed.is_empty() && self.purged.is_empty()
    }
}

pub struct LivenessMonitor {
    broker: Arc<Broker>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(broker: Arc<Broker>) -> Self {
        let configured = broker.config().liveness_interval();
        if configured < MIN_INTERVAL {
            tracing::warn!(
                configured_ms = configured.as_millis() as u64,
                "liveness interval below 1s, clamping"
            );
        }
        Self {
            broker,
            interval: configured.max(MIN_INTERVAL),
        }
    }

    /// One pass. Candidates are snapshotted first, then each is evicted on
    /// its own, so no lock is held across the scan.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for agent_id in self.broker.registry().stale_candidates(now) {
            match self.broker.evict_if_stale(&agent_id, now) {
                Some(closed) => {
                    report.evicted.push(agent_id);
                    report.closed.extend(closed);
                }
                // Heartbeat or disconnect got there first.
                None => tracing::debug!(agent_id = %agent_id, "eviction skipped"),
            }
        }
        report.purged = self.broker.purge_closed(now);
        report
    }

    /// Run until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            tracing::info!(interval_secs = self.interval.as_secs(), "liveness monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep(Instant::now());
                        if !report.is_empty() {
                            tracing::info!(
                                evicted = report.evicted.len(),
                                closed = report.closed.len(),
                                purged = report.purged.len(),
                                "liveness sweep"
                            );
                        }
                    }
                }
            }
            tracing::info!("liveness monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use rb_domain::config::BrokerConfig;
    use rb_protocol::{CloseReason, Metadata, Role, SessionState};

    use serde_json::json;

    use super::*;
    use crate::auth::AllowAll;
    use crate::error::BrokerError;
    use crate::transport::TransportId;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(&BrokerConfig::default(), Arc::new(AllowAll)))
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_is_strictly_after_timeout() {
        let b = broker();
        let monitor = LivenessMonitor::new(b.clone());
        b.register_agent(&TransportId::from("ta"), "A", Metadata::new());

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(monitor.sweep(Instant::now()).evicted.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(monitor.sweep(Instant::now()).evicted, vec!["A".to_string()]);
        assert!(b.registry().get("A").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_agent_alive() {
        let b = broker();
        let monitor = LivenessMonitor::new(b.clone());
        let t = TransportId::from("ta");
        b.register_agent(&t, "A", Metadata::new());

        tokio::time::advance(Duration::from_secs(60)).await;
        b.heartbeat(&t, None, None).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(monitor.sweep(Instant::now()).evicted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evicting_agent_closes_both_active_sessions() {
        let b = broker();
        let monitor = LivenessMonitor::new(b.clone());
        let (a, c) = (TransportId::from("ta"), TransportId::from("tc"));
        let _arx = b.on_connect(&a, Role::Agent);
        let mut crx = b.on_connect(&c, Role::Controller);
        b.register_agent(&a, "A", Metadata::new());

        let mut ids = Vec::new();
        for _ in 0..2 {
            let rec = b.request_session(&c, "A").unwrap();
            b.accept_session(&a, &rec.session_id).unwrap();
            ids.push(rec.session_id);
        }
        while crx.try_recv().is_ok() {}

        tokio::time::advance(Duration::from_secs(91)).await;
        let mut report = monitor.sweep(Instant::now());
        report.closed.sort();
        ids.sort();
        assert_eq!(report.closed, ids);

        for id in &ids {
            let rec = b.sessions().get(id).unwrap();
            assert_eq!(rec.state, SessionState::Closed);
            assert_eq!(rec.close_reason, Some(CloseReason::AgentGone));
            assert_eq!(
                b.send_command(&c, id, json!("ls")).unwrap_err(),
                BrokerError::SessionClosed(id.clone())
            );
        }
        let mut notified = 0;
        while let Ok(msg) = crx.try_recv() {
            if matches!(msg, rb_protocol::ServerMessage::SessionClosed { reason: CloseReason::AgentGone, .. }) {
                notified += 1;
            }
        }
        assert_eq!(notified, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped() {
        let config = BrokerConfig {
            liveness_interval_secs: 0,
            ..BrokerConfig::default()
        };
        let b = Arc::new(Broker::new(&config, Arc::new(AllowAll)));
        b.register_agent(&TransportId::from("ta"), "A", Metadata::new());

        let monitor = LivenessMonitor::new(b.clone());
        assert_eq!(monitor.interval, MIN_INTERVAL);

        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_secs(92)).await;
        assert!(b.registry().get("A").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_sweeps_and_stops() {
        let b = broker();
        b.register_agent(&TransportId::from("ta"), "A", Metadata::new());
        let cancel = CancellationToken::new();
        let handle = LivenessMonitor::new(b.clone()).spawn(cancel.clone());

        // Timeout (90s) plus three 30s ticks covers the strict boundary.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(b.registry().get("A").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
