//! Peer-to-peer transport of flow units
//!
//! Handles:
//! - Bounded per-peer outbound queues (newest-wins, never blocks the caller)
//! - Periodic batched flushes as length-prefixed protobuf frames over TCP
//! - Staleness detection for silent peers
//! - Inbound frames, filtered by graph schema version and routed into the
//!   local graph

pub mod peer;
pub mod wire;

#[cfg(test)]
mod tests;

pub use peer::{PeerRoster, PeerSnapshot, PeerStatus, StalePeer};
pub use wire::{WireEnvelope, WireFlowUnit};

use crate::config::RcaConf;
use crate::error::{RcaError, RcaResult};
use crate::graph::sink::FlowUnitSink;
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::{now_millis, FlowUnit, Timestamp};
use crate::observability::{RcaMetrics, StructuredLogger};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between outbound flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default connect/write timeout
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default silence after which a peer is stale
pub const DEFAULT_PEER_STALENESS: Duration = Duration::from_secs(60);

/// Default maximum units per flushed batch
pub const DEFAULT_MAX_BATCH: usize = 500;

/// Transport tuning
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub flush_interval: Duration,
    pub send_timeout: Duration,
    pub peer_staleness: Duration,
    pub max_frame_bytes: usize,
    pub max_batch: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            peer_staleness: DEFAULT_PEER_STALENESS,
            max_frame_bytes: wire::DEFAULT_MAX_FRAME_BYTES,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// Receiving side of the graph, as seen by the transport
pub trait InboundRouter: Send + Sync {
    /// Fingerprint of the local graph topology
    fn schema_version(&self) -> &str;

    /// Deliver a unit produced on another node. Returns how many local
    /// vertices received it.
    fn route_inbound(&self, unit: Arc<FlowUnit>) -> usize;
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    evicted: AtomicU64,
    dropped_unknown_peer: AtomicU64,
    dropped_failed_flush: AtomicU64,
    dropped_stale_peer: AtomicU64,
    received: AtomicU64,
    schema_mismatches: AtomicU64,
    decode_errors: AtomicU64,
}

/// Transport statistics
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub node_address: String,
    pub units_sent: u64,
    pub units_evicted: u64,
    pub dropped_unknown_peer: u64,
    pub dropped_failed_flush: u64,
    pub dropped_stale_peer: u64,
    pub units_received: u64,
    pub schema_mismatches: u64,
    pub decode_errors: u64,
    pub peers: Vec<PeerSnapshot>,
}

/// Outbound and inbound flow unit transport for one node
pub struct NetworkLayer {
    node_address: String,
    config: NetworkConfig,
    roster: PeerRoster,
    schema_version: RwLock<String>,
    counters: Counters,
    metrics: RcaMetrics,
    logger: StructuredLogger,
}

impl NetworkLayer {
    /// Create the layer with one peer per `remote-peers` entry
    pub fn new(node_address: impl Into<String>, conf: &RcaConf, config: NetworkConfig) -> Self {
        let node_address = node_address.into();
        let roster = PeerRoster::new(
            conf.peer_ip_list.iter().cloned(),
            conf.network_queue_length,
            now_millis(),
        );
        let metrics = RcaMetrics::new();
        metrics.set_peer_counts(roster.len(), 0);

        Self {
            logger: StructuredLogger::new(node_address.clone()),
            node_address,
            config,
            roster,
            schema_version: RwLock::new(String::new()),
            counters: Counters::default(),
            metrics,
        }
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    /// Schema version stamped on outbound envelopes
    pub fn set_schema_version(&self, version: impl Into<String>) {
        *self.schema_version.write() = version.into();
    }

    pub fn schema_version(&self) -> String {
        self.schema_version.read().clone()
    }

    /// Queue a unit for `peer`. Never blocks; a full queue evicts its
    /// oldest unit. Unknown peers are a transport error and the unit is
    /// dropped.
    pub fn send(&self, peer: &str, unit: Arc<FlowUnit>) -> RcaResult<usize> {
        match self.roster.enqueue(peer, unit) {
            Some(evicted) => {
                if evicted > 0 {
                    self.counters
                        .evicted
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    self.metrics.add_buffer_evictions("peer", evicted);
                    debug!(peer = %peer, evicted = evicted, "Peer queue full, evicted oldest units");
                }
                Ok(evicted)
            }
            None => {
                self.counters
                    .dropped_unknown_peer
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics.add_units_dropped("unknown_peer", 1);
                let err = RcaError::transport(peer, "peer is not in the roster");
                warn!(error = %err, "Dropping flow unit");
                Err(err)
            }
        }
    }

    /// Sink delivering to `peer` through this layer
    pub fn sink_for(self: &Arc<Self>, peer: impl Into<String>) -> RemoteSink {
        RemoteSink {
            peer: peer.into(),
            network: Arc::clone(self),
        }
    }

    /// Ship one batch of queued units to `peer`.
    ///
    /// At-most-once: a failed batch is dropped, not re-queued.
    pub async fn flush_peer(&self, peer: &str) -> RcaResult<usize> {
        let Some(queue) = self.roster.queue(peer) else {
            return Ok(0);
        };
        let batch = queue.drain_batch(self.config.max_batch);
        if batch.is_empty() {
            return Ok(0);
        }

        let envelope = WireEnvelope {
            schema_version: self.schema_version(),
            source_node: self.node_address.clone(),
            sent_at: now_millis(),
            units: batch.iter().map(|u| WireFlowUnit::from(u.as_ref())).collect(),
        };

        match self.deliver(peer, &envelope).await {
            Ok(()) => {
                let count = batch.len();
                self.roster.touch(peer, now_millis());
                self.counters.sent.fetch_add(count as u64, Ordering::Relaxed);
                self.metrics.add_units_sent(count);
                debug!(peer = %peer, units = count, "Flushed batch to peer");
                Ok(count)
            }
            Err(e) => {
                self.counters
                    .dropped_failed_flush
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.metrics.add_units_dropped("flush_failed", batch.len());
                warn!(peer = %peer, units = batch.len(), error = %e, "Dropping batch for peer");
                Err(e)
            }
        }
    }

    async fn deliver(&self, peer: &str, envelope: &WireEnvelope) -> RcaResult<()> {
        let send = async {
            let mut stream = TcpStream::connect(peer).await?;
            wire::write_frame(&mut stream, envelope).await
        };

        match timeout(self.config.send_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RcaError::transport(peer, e.to_string())),
            Err(_) => Err(RcaError::transport(peer, "send timed out")),
        }
    }

    /// Flush every peer once
    pub async fn flush_all(&self) -> usize {
        let mut sent = 0;
        for peer in self.roster.addresses() {
            if let Ok(count) = self.flush_peer(&peer).await {
                sent += count;
            }
        }
        sent
    }

    /// Mark silent peers stale and discard their queues
    pub fn sweep(&self, now: Timestamp) -> Vec<StalePeer> {
        let stale = self.roster.sweep(now, self.config.peer_staleness);
        for peer in &stale {
            self.counters
                .dropped_stale_peer
                .fetch_add(peer.dropped_units as u64, Ordering::Relaxed);
            self.metrics.add_units_dropped("peer_stale", peer.dropped_units);
            self.logger.log_peer_stale(
                &peer.address,
                peer.silent_for.as_secs() as i64,
                peer.dropped_units,
            );
        }
        self.metrics
            .set_peer_counts(self.roster.len(), self.roster.stale_count());
        stale
    }

    /// Degraded while any peer is stale
    pub fn peer_health(&self) -> ComponentHealth {
        match (self.roster.stale_count(), self.roster.len()) {
            (0, _) => ComponentHealth::healthy(),
            (stale, total) => ComponentHealth::degraded(format!("{stale} of {total} peers stale")),
        }
    }

    /// Apply the peer list and queue length of a new configuration snapshot
    pub fn reconcile(&self, conf: &RcaConf) {
        let (added, removed) =
            self.roster
                .reconcile(&conf.peer_ip_list, conf.network_queue_length, now_millis());
        if !added.is_empty() || !removed.is_empty() {
            info!(added = ?added, removed = ?removed, "Peer roster updated");
        }
        self.metrics
            .set_peer_counts(self.roster.len(), self.roster.stale_count());
    }

    /// Process one inbound envelope. Returns the number of local deliveries.
    pub fn handle_envelope(&self, envelope: WireEnvelope, router: &dyn InboundRouter) -> usize {
        if self.roster.touch(&envelope.source_node, now_millis()) {
            info!(peer = %envelope.source_node, "Peer is back");
        }

        if envelope.schema_version != router.schema_version() {
            self.counters
                .schema_mismatches
                .fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_schema_mismatches();
            warn!(
                peer = %envelope.source_node,
                remote_schema = %envelope.schema_version,
                local_schema = %router.schema_version(),
                units = envelope.units.len(),
                "Graph schema mismatch, dropping envelope"
            );
            return 0;
        }

        let count = envelope.units.len();
        self.counters
            .received
            .fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.add_units_received(count);

        let mut delivered = 0;
        for wire_unit in envelope.units {
            match FlowUnit::try_from(wire_unit) {
                Ok(unit) => delivered += router.route_inbound(Arc::new(unit)),
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %envelope.source_node, error = %e, "Dropping undecodable flow unit");
                }
            }
        }
        delivered
    }

    /// Accept peer connections until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        router: Arc<dyn InboundRouter>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Starting peer listener");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let network = Arc::clone(&self);
                            let router = Arc::clone(&router);
                            tokio::spawn(async move {
                                network.read_connection(stream, router.as_ref()).await;
                                debug!(remote = %remote, "Peer connection closed");
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept peer connection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down peer listener");
                    break;
                }
            }
        }
    }

    async fn read_connection(&self, mut stream: TcpStream, router: &dyn InboundRouter) {
        loop {
            match wire::read_frame(&mut stream, self.config.max_frame_bytes).await {
                Ok(Some(envelope)) => {
                    self.handle_envelope(envelope, router);
                }
                Ok(None) => break,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping malformed frame");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> NetworkStats {
        let c = &self.counters;
        NetworkStats {
            node_address: self.node_address.clone(),
            units_sent: c.sent.load(Ordering::Relaxed),
            units_evicted: c.evicted.load(Ordering::Relaxed),
            dropped_unknown_peer: c.dropped_unknown_peer.load(Ordering::Relaxed),
            dropped_failed_flush: c.dropped_failed_flush.load(Ordering::Relaxed),
            dropped_stale_peer: c.dropped_stale_peer.load(Ordering::Relaxed),
            units_received: c.received.load(Ordering::Relaxed),
            schema_mismatches: c.schema_mismatches.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            peers: self.roster.snapshot(),
        }
    }
}

impl std::fmt::Debug for NetworkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkLayer")
            .field("node_address", &self.node_address)
            .field("peers", &self.roster.len())
            .finish()
    }
}

/// Edge into a vertex owned by a peer
#[derive(Debug, Clone)]
pub struct RemoteSink {
    peer: String,
    network: Arc<NetworkLayer>,
}

impl RemoteSink {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl FlowUnitSink for RemoteSink {
    fn destination(&self) -> String {
        format!("peer {}", self.peer)
    }

    fn buffer_label(&self) -> &'static str {
        "peer"
    }

    fn accept(&self, unit: Arc<FlowUnit>) -> RcaResult<usize> {
        self.network.send(&self.peer, unit)
    }
}

/// Periodically flushes peer queues and sweeps stale peers
pub struct NetworkWorker {
    network: Arc<NetworkLayer>,
    health: Option<HealthRegistry>,
}

impl NetworkWorker {
    pub fn new(network: Arc<NetworkLayer>) -> Self {
        Self {
            network,
            health: None,
        }
    }

    /// Report peer staleness into `health` after every sweep
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let config = self.network.config().clone();
        info!(
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            peer_staleness_secs = config.peer_staleness.as_secs(),
            "Starting network worker"
        );

        let mut ticker = interval(config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.network.flush_all().await;
                    self.network.sweep(now_millis());
                    if let Some(health) = &self.health {
                        health.report(components::NETWORK, self.network.peer_health()).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down network worker");
                    break;
                }
            }
        }
    }
}
