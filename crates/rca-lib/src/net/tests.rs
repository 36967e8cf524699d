//! Integration tests for the network layer
//!
//! These tests verify:
//! - Backpressure on peer queues and staleness handling
//! - Schema version filtering of inbound envelopes
//! - Delivery over a real TCP connection

use super::*;
use crate::models::{Payload, ResourceType};
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;

const UNREACHABLE: &str = "127.0.0.1:1";

/// Records every unit routed to it
struct RecordingRouter {
    schema: String,
    received: Mutex<Vec<Arc<FlowUnit>>>,
    calls: AtomicUsize,
}

impl RecordingRouter {
    fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            received: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InboundRouter for RecordingRouter {
    fn schema_version(&self) -> &str {
        &self.schema
    }

    fn route_inbound(&self, unit: Arc<FlowUnit>) -> usize {
        self.received.lock().push(unit);
        self.calls.fetch_add(1, Ordering::SeqCst);
        1
    }
}

fn conf(peers: &[&str], queue_length: usize) -> RcaConf {
    RcaConf {
        peer_ip_list: peers.iter().map(|p| p.to_string()).collect(),
        network_queue_length: queue_length,
        ..RcaConf::default()
    }
}

fn verdict(ts: i64) -> Arc<FlowUnit> {
    Arc::new(
        FlowUnit::unhealthy(ts, ResourceType::HeapYoungGen, Payload::new(["rate"]).with_row([ts]))
            .produced_by("young_gen"),
    )
}

fn envelope(schema: &str, units: &[Arc<FlowUnit>]) -> WireEnvelope {
    WireEnvelope {
        schema_version: schema.to_string(),
        source_node: "10.0.0.9:9650".to_string(),
        sent_at: 0,
        units: units.iter().map(|u| WireFlowUnit::from(u.as_ref())).collect(),
    }
}

mod backpressure_tests {
    use super::*;

    #[test]
    fn test_full_queue_keeps_newest_then_goes_stale() {
        let config = NetworkConfig {
            peer_staleness: Duration::from_secs(10),
            ..NetworkConfig::default()
        };
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[UNREACHABLE], 2), config);

        for ts in 1..=3 {
            network.send(UNREACHABLE, verdict(ts)).unwrap();
        }

        let queued: Vec<i64> = network
            .roster()
            .queue(UNREACHABLE)
            .unwrap()
            .snapshot()
            .iter()
            .map(|u| u.timestamp())
            .collect();
        assert_eq!(queued, vec![2, 3]);
        assert_eq!(network.stats().units_evicted, 1);

        // Nothing heard within the window: still up
        assert!(network.sweep(now_millis()).is_empty());

        let stale = network.sweep(now_millis() + 11_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].dropped_units, 2);
        assert_eq!(network.roster().status(UNREACHABLE), Some(PeerStatus::Stale));
        assert!(network.roster().queue(UNREACHABLE).unwrap().is_empty());
        assert_eq!(network.stats().dropped_stale_peer, 2);
    }

    #[test]
    fn test_send_to_unknown_peer_is_transport_error() {
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[], 2), NetworkConfig::default());
        let err = network.send("10.0.0.7:9650", verdict(1)).unwrap_err();
        assert!(matches!(err, RcaError::Transport { .. }));
        assert!(!err.is_fatal());
        assert_eq!(network.stats().dropped_unknown_peer, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let config = NetworkConfig {
            send_timeout: Duration::from_millis(500),
            ..NetworkConfig::default()
        };
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[UNREACHABLE], 4), config);
        network.send(UNREACHABLE, verdict(1)).unwrap();

        assert!(network.flush_peer(UNREACHABLE).await.is_err());
        assert!(network.roster().queue(UNREACHABLE).unwrap().is_empty());
        assert_eq!(network.stats().dropped_failed_flush, 1);
    }

    #[test]
    fn test_remote_sink_enqueues() {
        let network = Arc::new(NetworkLayer::new(
            "10.0.0.1:9650",
            &conf(&[UNREACHABLE], 4),
            NetworkConfig::default(),
        ));
        let sink = network.sink_for(UNREACHABLE);
        assert_eq!(sink.accept(verdict(1)).unwrap(), 0);
        assert_eq!(network.roster().queue(UNREACHABLE).unwrap().len(), 1);
    }

    #[test]
    fn test_reconcile_applies_new_peer_list() {
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[UNREACHABLE], 4), NetworkConfig::default());
        network.reconcile(&conf(&["10.0.0.5:9650"], 8));

        assert!(!network.roster().contains(UNREACHABLE));
        assert_eq!(network.roster().queue("10.0.0.5:9650").unwrap().capacity(), 8);
    }
}

mod inbound_tests {
    use super::*;

    #[test]
    fn test_foreign_schema_dropped() {
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[], 2), NetworkConfig::default());
        let router = RecordingRouter::new("local-schema");

        let delivered = network.handle_envelope(envelope("other-schema", &[verdict(1)]), &router);
        assert_eq!(delivered, 0);
        assert_eq!(router.count(), 0);
        assert_eq!(network.stats().schema_mismatches, 1);
    }

    #[test]
    fn test_matching_schema_delivered() {
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[], 2), NetworkConfig::default());
        let router = RecordingRouter::new("local-schema");
        let units = [verdict(1), verdict(2)];

        let delivered = network.handle_envelope(envelope("local-schema", &units), &router);
        assert_eq!(delivered, 2);
        assert_eq!(network.stats().units_received, 2);
        let received = router.received.lock();
        assert_eq!(received[0].as_ref(), units[0].as_ref());
        assert_eq!(received[1].producing_vertex(), Some("young_gen"));
    }

    #[test]
    fn test_inbound_traffic_revives_stale_peer() {
        let source = "10.0.0.9:9650";
        let config = NetworkConfig {
            peer_staleness: Duration::from_secs(1),
            ..NetworkConfig::default()
        };
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[source], 2), config);
        network.sweep(now_millis() + 5_000);
        assert_eq!(network.roster().status(source), Some(PeerStatus::Stale));

        let router = RecordingRouter::new("s");
        network.handle_envelope(envelope("s", &[]), &router);
        assert_eq!(network.roster().status(source), Some(PeerStatus::Up));
    }

    #[tokio::test]
    async fn test_flush_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = listener.local_addr().unwrap().to_string();

        let receiver = Arc::new(NetworkLayer::new(
            receiver_addr.clone(),
            &conf(&[], 2),
            NetworkConfig::default(),
        ));
        let router = Arc::new(RecordingRouter::new("shared-schema"));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(Arc::clone(&receiver).serve(
            listener,
            Arc::clone(&router) as Arc<dyn InboundRouter>,
            shutdown_rx,
        ));

        let sender = NetworkLayer::new("10.0.0.1:9650", &conf(&[receiver_addr.as_str()], 4), NetworkConfig::default());
        sender.set_schema_version("shared-schema");
        sender.send(&receiver_addr, verdict(1)).unwrap();
        sender.send(&receiver_addr, verdict(2)).unwrap();

        assert_eq!(sender.flush_peer(&receiver_addr).await.unwrap(), 2);
        assert_eq!(sender.roster().status(&receiver_addr), Some(PeerStatus::Up));

        tokio::time::timeout(Duration::from_secs(5), async {
            while router.count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("units were not delivered");

        let timestamps: Vec<i64> = router.received.lock().iter().map(|u| u.timestamp()).collect();
        assert_eq!(timestamps, vec![1, 2]);

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}

mod health_tests {
    use super::*;
    use crate::health::ComponentStatus;

    #[test]
    fn test_peer_health_follows_staleness() {
        let source = "10.0.0.9:9650";
        let config = NetworkConfig {
            peer_staleness: Duration::from_secs(1),
            ..NetworkConfig::default()
        };
        let network = NetworkLayer::new("10.0.0.1:9650", &conf(&[source, UNREACHABLE], 2), config);
        assert_eq!(network.peer_health().status, ComponentStatus::Healthy);

        network.sweep(now_millis() + 5_000);
        let health = network.peer_health();
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(health.message.as_deref(), Some("2 of 2 peers stale"));

        network.handle_envelope(envelope("s", &[]), &RecordingRouter::new("s"));
        assert_eq!(network.peer_health().message.as_deref(), Some("1 of 2 peers stale"));
    }

    #[tokio::test]
    async fn test_worker_reports_stale_peers() {
        let config = NetworkConfig {
            flush_interval: Duration::from_millis(10),
            peer_staleness: Duration::ZERO,
            ..NetworkConfig::default()
        };
        let network = Arc::new(NetworkLayer::new("10.0.0.1:9650", &conf(&[UNREACHABLE], 2), config));
        let health = HealthRegistry::new();
        health.register(components::NETWORK).await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(
            NetworkWorker::new(Arc::clone(&network))
                .with_health(health.clone())
                .run(shutdown_rx),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = health.component(components::NETWORK).await.map(|c| c.status);
                if status == Some(ComponentStatus::Degraded) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stale peer was not reported");

        shutdown_tx.send(()).unwrap();
        worker.await.unwrap();
    }
}
