//! Metrics collection loop
//!
//! Periodically reads samples from a [`MetricsCollector`] and ingests them
//! into the metric-source vertices of the analysis graph.

use super::MetricsCollector;
use crate::graph::AnalysisGraph;
use crate::health::{components, HealthRegistry};
use crate::models::{now_millis, FlowUnit, Timestamp};
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the metrics collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Base collection interval (default: 5 seconds)
    pub interval: Duration,
    /// Upper bound of the first-tick offset (default: 500 ms)
    pub jitter: Duration,
    /// Node address the offset is derived from
    pub node: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: Duration::from_millis(500),
            node: String::new(),
        }
    }
}

/// Results from a collection cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionResults {
    pub ingested: usize,
    /// Samples for vertices that are not local metric sources
    pub rejected: usize,
    pub collector_failed: bool,
}

/// Metrics collection loop feeding the analysis graph
pub struct CollectionLoop {
    collector: Arc<dyn MetricsCollector>,
    graph: Arc<AnalysisGraph>,
    config: CollectionConfig,
    health: Option<HealthRegistry>,
}

impl CollectionLoop {
    pub fn new(
        collector: Arc<dyn MetricsCollector>,
        graph: Arc<AnalysisGraph>,
        config: CollectionConfig,
    ) -> Self {
        Self {
            collector,
            graph,
            config,
            health: None,
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            collector = %self.collector.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting metrics collection loop"
        );

        // Spread collectors of different nodes over the interval
        tokio::time::sleep(node_offset(&self.config.node, self.config.jitter)).await;

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let results = self.collect_once(now_millis()).await;
                    cycles += 1;

                    if cycles % 12 == 0 {
                        debug!(
                            ingested = results.ingested,
                            rejected = results.rejected,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Collection cycle complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics collection loop");
                    break;
                }
            }
        }
    }

    /// Collect once and ingest every sample stamped with `now`
    pub async fn collect_once(&self, now: Timestamp) -> CollectionResults {
        let mut results = CollectionResults::default();

        let samples = match self.collector.collect().await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(collector = %self.collector.name(), error = %e, "Failed to collect metrics");
                results.collector_failed = true;
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::COLLECTOR, format!("collection failed: {e}"))
                        .await;
                }
                return results;
            }
        };

        for sample in samples {
            match self.graph.ingest(&sample.vertex, FlowUnit::metric(now, sample.payload)) {
                Ok(()) => results.ingested += 1,
                Err(e) => {
                    results.rejected += 1;
                    debug!(vertex = %sample.vertex, error = %e, "Ignoring sample");
                }
            }
        }

        if let Some(health) = &self.health {
            health.set_healthy(components::COLLECTOR).await;
        }
        results
    }
}

/// Stable per-node offset in `[0, max)`. Each node keeps the same phase
/// across restarts while different nodes land apart.
fn node_offset(node: &str, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }

    let digest = Sha256::digest(node.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Duration::from_millis(u64::from_be_bytes(prefix) % max_ms)
}

/// Builder for creating the collection loop
pub struct CollectionLoopBuilder {
    collector: Option<Arc<dyn MetricsCollector>>,
    graph: Option<Arc<AnalysisGraph>>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            collector: None,
            graph: None,
            health: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn graph(mut self, graph: Arc<AnalysisGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Report collector health into `health`
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Node address the first-tick offset is derived from
    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.config.node = node.into();
        self
    }

    pub fn build(self) -> Result<CollectionLoop> {
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Collector is required"))?;
        let graph = self
            .graph
            .ok_or_else(|| anyhow::anyhow!("Analysis graph is required"))?;

        let mut collection_loop = CollectionLoop::new(collector, graph, self.config);
        collection_loop.health = self.health;
        Ok(collection_loop)
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
