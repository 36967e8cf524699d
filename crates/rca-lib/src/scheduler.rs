//! Periodic evaluation of the analysis graph
//!
//! A single loop drives ticks. On every tick the vertices that are due run
//! level by level in topological order; vertices within a level run
//! concurrently on a bounded pool, and a level only starts once the previous
//! one has routed its output.

use crate::config::ConfHandle;
use crate::graph::{AnalysisGraph, Evaluation};
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::{now_millis, FlowUnit, Timestamp, VertexId};
use crate::observability::{RcaMetrics, StructuredLogger};
use crate::vertex::Outcome;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default scheduler tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Default number of vertices evaluated concurrently within a level
pub const DEFAULT_MAX_CONCURRENT_EVALUATIONS: usize = 4;

/// Inputs older than this are dropped before evaluation
pub const DEFAULT_MAX_FLOW_UNIT_AGE: Duration = Duration::from_secs(10 * 60);

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_evaluations: usize,
    pub max_flow_unit_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: DEFAULT_MAX_CONCURRENT_EVALUATIONS,
            max_flow_unit_age: DEFAULT_MAX_FLOW_UNIT_AGE,
        }
    }
}

/// Statistics about the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub evaluations: u64,
    pub empty_emissions: u64,
    pub evaluation_failures: u64,
    pub unhealthy_verdicts: u64,
    pub last_tick_duration_ms: u64,
}

/// What one tick evaluated
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Zero-based tick index
    pub tick: u64,
    pub now: Timestamp,
    pub outcomes: BTreeMap<VertexId, Outcome>,
    pub duration: Duration,
}

type EvaluationTask = JoinHandle<(Option<Evaluation>, Duration)>;

/// Drives periodic evaluation of every local vertex
pub struct Scheduler {
    graph: Arc<AnalysisGraph>,
    conf: Arc<ConfHandle>,
    config: SchedulerConfig,
    pool: Arc<Semaphore>,
    ticks: AtomicU64,
    stats: Mutex<SchedulerStats>,
    metrics: RcaMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<AnalysisGraph>,
        conf: Arc<ConfHandle>,
        config: SchedulerConfig,
        logger: StructuredLogger,
    ) -> Self {
        let permits = config.max_concurrent_evaluations.max(1);
        Self {
            graph,
            conf,
            config,
            pool: Arc::new(Semaphore::new(permits)),
            ticks: AtomicU64::new(0),
            stats: Mutex::new(SchedulerStats::default()),
            metrics: RcaMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Report tick health into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn graph(&self) -> &Arc<AnalysisGraph> {
        &self.graph
    }

    /// Run the tick loop until shutdown. The signal is only observed
    /// between ticks, so an in-flight tick always completes.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let tick = self.graph.tick();
        info!(
            tick_ms = tick.as_millis() as u64,
            levels = self.graph.topological_levels().len(),
            max_concurrent = self.config.max_concurrent_evaluations,
            "Starting scheduler"
        );

        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scheduler");
                    break;
                }
            }
        }
    }

    /// Run the tick loop on its own task. If the loop ends other than
    /// through shutdown, the scheduler is reported unhealthy.
    pub async fn run_supervised(self: Arc<Self>, shutdown: broadcast::Receiver<()>) {
        let health = self.health.clone();
        if let Err(e) = tokio::spawn(self.run(shutdown)).await {
            error!(error = %e, "Scheduler tick loop died");
            if let Some(health) = health {
                health
                    .set_unhealthy(components::SCHEDULER, format!("Tick loop exited: {e}"))
                    .await;
            }
        }
    }

    /// Run a single tick against the wall clock
    pub async fn tick_once(&self) -> TickReport {
        self.tick_at(now_millis()).await
    }

    /// Run a single tick with `now` as the evaluation time
    pub async fn tick_at(&self, now: Timestamp) -> TickReport {
        let start = Instant::now();
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        let conf = self.conf.load();
        let mut outcomes = BTreeMap::new();

        for level in self.graph.topological_levels() {
            let mut pending: Vec<(VertexId, EvaluationTask)> = Vec::new();

            for vertex in level {
                if !self.is_due(vertex, tick) {
                    continue;
                }
                let Ok(permit) = Arc::clone(&self.pool).acquire_owned().await else {
                    warn!("Evaluation pool closed, skipping vertex");
                    continue;
                };

                let graph = Arc::clone(&self.graph);
                let conf = Arc::clone(&conf);
                let id = vertex.clone();
                let max_age = self.config.max_flow_unit_age;
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let evaluation = graph.evaluate(&id, now, &conf, max_age);
                    (evaluation, started.elapsed())
                });
                pending.push((vertex.clone(), task));
            }

            // Route this level before the next one drains its buffers
            for (vertex, task) in pending {
                let (unit, outcome) = match task.await {
                    Ok((Some(evaluation), elapsed)) => {
                        self.metrics.observe_evaluation(elapsed.as_secs_f64());
                        (evaluation.emission.unit, evaluation.emission.outcome)
                    }
                    Ok((None, _)) => continue,
                    Err(e) => {
                        warn!(vertex = %vertex, error = %e, "Evaluation task failed, emitting empty unit");
                        let unit = FlowUnit::empty(now).produced_by(vertex.clone());
                        (Arc::new(unit), Outcome::Failed)
                    }
                };

                self.record(&vertex, &unit, outcome);
                self.graph.route(unit, &vertex);
                outcomes.insert(vertex, outcome);
            }
        }

        let duration = start.elapsed();
        self.metrics.observe_tick(duration.as_secs_f64());
        {
            let mut stats = self.stats.lock();
            stats.ticks += 1;
            stats.last_tick_duration_ms = duration.as_millis() as u64;
        }
        if let Some(health) = &self.health {
            let failed = outcomes.values().filter(|o| **o == Outcome::Failed).count();
            let report = tick_health(failed, outcomes.len(), duration, self.graph.tick());
            health.report(components::SCHEDULER, report).await;
        }

        debug!(
            tick = tick,
            evaluated = outcomes.len(),
            duration_ms = duration.as_millis() as u64,
            "Tick completed"
        );

        TickReport {
            tick,
            now,
            outcomes,
            duration,
        }
    }

    /// A vertex fires every `period / tick` ticks
    fn is_due(&self, vertex: &str, tick: u64) -> bool {
        let Some(period) = self.graph.evaluation_period(vertex) else {
            return false;
        };
        let tick_ms = self.graph.tick().as_millis().max(1);
        let every = (period.as_millis() / tick_ms).max(1) as u64;
        tick % every == 0
    }

    fn record(&self, vertex: &str, unit: &FlowUnit, outcome: Outcome) {
        let mut stats = self.stats.lock();
        stats.evaluations += 1;

        if unit.is_empty() {
            stats.empty_emissions += 1;
            self.metrics.inc_empty_emissions();
        }

        match outcome {
            Outcome::Failed => {
                stats.evaluation_failures += 1;
                self.metrics.inc_evaluation_failures();
            }
            Outcome::Unhealthy => {
                stats.unhealthy_verdicts += 1;
                self.metrics.inc_unhealthy_verdicts();
                let resource = unit
                    .resource_context()
                    .map(|ctx| ctx.resource_type.as_str())
                    .unwrap_or("unknown");
                self.logger
                    .log_unhealthy_verdict(vertex, resource, unit.timestamp());
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }
}

/// Degraded when evaluations failed or the tick overran its interval
fn tick_health(failed: usize, evaluated: usize, duration: Duration, tick: Duration) -> ComponentHealth {
    if failed > 0 {
        ComponentHealth::degraded(format!("{failed} of {evaluated} evaluations failed"))
    } else if duration > tick {
        ComponentHealth::degraded(format!(
            "tick took {} ms, longer than the {} ms interval",
            duration.as_millis(),
            tick.as_millis()
        ))
    } else {
        ComponentHealth::healthy()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("graph", &self.graph.name())
            .field("config", &self.config)
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RcaConf;
    use crate::graph::{builtin, GraphContext, GraphRegistry, DEFAULT_ENTRY_POINT};
    use crate::models::Payload;
    use crate::vertex::heap::{gc_payload, heap_payload};

    const MB: f64 = 1024.0 * 1024.0;
    const MINUTE: Duration = Duration::from_secs(60);

    fn scheduler_with(conf: RcaConf, tick: Duration) -> Scheduler {
        let definition = GraphRegistry::with_builtins()
            .resolve(DEFAULT_ENTRY_POINT, &conf)
            .unwrap();
        let graph = AnalysisGraph::build(&definition, &GraphContext::local(&conf, tick)).unwrap();
        Scheduler::new(
            Arc::new(graph),
            Arc::new(ConfHandle::new(conf)),
            SchedulerConfig::default(),
            StructuredLogger::new("test-node"),
        )
    }

    fn ingest(scheduler: &Scheduler, now: Timestamp, heap_mb: f64, gc_ms: f64) {
        let graph = scheduler.graph();
        graph
            .ingest(builtin::HEAP_USAGE, FlowUnit::metric(now, heap_payload(heap_mb * MB)))
            .unwrap();
        graph
            .ingest(builtin::YOUNG_GC_TIME, FlowUnit::metric(now, gc_payload(gc_ms)))
            .unwrap();
    }

    #[tokio::test]
    async fn test_young_gen_scenario() {
        let scheduler = scheduler_with(RcaConf::default(), MINUTE);
        let mut verdicts = Vec::new();

        for (t, heap_mb, gc_ms) in [(0, 0.0, 0.0), (1, 450.0, 200.0), (2, 1050.0, 400.0), (3, 1550.0, 650.0)] {
            let now = t * 1000;
            ingest(&scheduler, now, heap_mb, gc_ms);
            let report = scheduler.tick_at(now).await;
            assert_eq!(report.outcomes[builtin::HEAP_USAGE], Outcome::Metric);
            verdicts.push(report.outcomes[builtin::HIGH_HEAP_USAGE_YOUNG_GEN]);
        }

        assert_eq!(
            verdicts,
            vec![
                Outcome::Insufficient,
                Outcome::Healthy,
                Outcome::Healthy,
                Outcome::Unhealthy
            ]
        );

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.evaluations, 12);
        assert_eq!(stats.unhealthy_verdicts, 1);
        assert_eq!(stats.evaluation_failures, 0);
        assert_eq!(stats.empty_emissions, 1);
    }

    #[tokio::test]
    async fn test_identical_inputs_identical_verdicts() {
        let samples = [(0, 0.0, 0.0), (1, 900.0, 500.0), (2, 1000.0, 10.0)];
        let mut runs = Vec::new();

        for _ in 0..2 {
            let scheduler = scheduler_with(RcaConf::default(), MINUTE);
            let mut verdicts = Vec::new();
            for (t, heap_mb, gc_ms) in samples {
                ingest(&scheduler, t * 1000, heap_mb, gc_ms);
                let report = scheduler.tick_at(t * 1000).await;
                verdicts.push(report.outcomes[builtin::HIGH_HEAP_USAGE_YOUNG_GEN]);
            }
            runs.push(verdicts);
        }

        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn test_vertices_fire_on_their_period() {
        let conf = RcaConf {
            new_rca_check_period_mins: 2,
            ..RcaConf::default()
        };
        let scheduler = scheduler_with(conf, MINUTE);

        let first = scheduler.tick_at(0).await;
        let second = scheduler.tick_at(60_000).await;
        let third = scheduler.tick_at(120_000).await;

        assert!(first.outcomes.contains_key(builtin::HIGH_HEAP_USAGE_YOUNG_GEN));
        assert!(!second.outcomes.contains_key(builtin::HIGH_HEAP_USAGE_YOUNG_GEN));
        assert!(second.outcomes.contains_key(builtin::HEAP_USAGE));
        assert!(third.outcomes.contains_key(builtin::HIGH_HEAP_USAGE_YOUNG_GEN));
        assert_eq!((first.tick, second.tick, third.tick), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_evaluation_error_counted_as_failure() {
        let scheduler = scheduler_with(RcaConf::default(), MINUTE);
        let malformed = Payload::new(["MemType", "max"]).with_row(["Eden", "lots"]);

        let mut last = None;
        for t in 0..2 {
            let now = t * 1000;
            let graph = scheduler.graph();
            graph
                .ingest(builtin::HEAP_USAGE, FlowUnit::metric(now, malformed.clone()))
                .unwrap();
            graph
                .ingest(builtin::YOUNG_GC_TIME, FlowUnit::metric(now, gc_payload(1.0)))
                .unwrap();
            last = Some(scheduler.tick_at(now).await);
        }

        let report = last.unwrap();
        assert_eq!(report.outcomes[builtin::HIGH_HEAP_USAGE_YOUNG_GEN], Outcome::Failed);
        assert_eq!(scheduler.stats().evaluation_failures, 1);
    }

    #[tokio::test]
    async fn test_tick_health_reported() {
        use crate::health::ComponentStatus;

        let health = HealthRegistry::new();
        let healthy = scheduler_with(RcaConf::default(), MINUTE).with_health(health.clone());
        ingest(&healthy, 0, 0.0, 0.0);
        healthy.tick_at(0).await;
        assert_eq!(
            health.component(components::SCHEDULER).await.unwrap().status,
            ComponentStatus::Healthy
        );

        let failing = scheduler_with(RcaConf::default(), MINUTE).with_health(health.clone());
        let malformed = Payload::new(["MemType", "max"]).with_row(["Eden", "lots"]);
        for t in 0..2 {
            let now = t * 1000;
            let graph = failing.graph();
            graph
                .ingest(builtin::HEAP_USAGE, FlowUnit::metric(now, malformed.clone()))
                .unwrap();
            graph
                .ingest(builtin::YOUNG_GC_TIME, FlowUnit::metric(now, gc_payload(1.0)))
                .unwrap();
            failing.tick_at(now).await;
        }

        let report = health.component(components::SCHEDULER).await.unwrap();
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert_eq!(report.message.as_deref(), Some("1 of 3 evaluations failed"));
    }

    #[test]
    fn test_overrun_tick_degrades() {
        let tick = Duration::from_secs(5);
        assert_eq!(
            tick_health(0, 3, Duration::from_secs(1), tick).status,
            crate::health::ComponentStatus::Healthy
        );
        assert_eq!(
            tick_health(0, 3, Duration::from_secs(6), tick).message.as_deref(),
            Some("tick took 6000 ms, longer than the 5000 ms interval")
        );
    }

    #[tokio::test]
    async fn test_muting_follows_conf_snapshot() {
        let scheduler = scheduler_with(RcaConf::default(), MINUTE);
        for (t, heap_mb, gc_ms) in [(0, 0.0, 0.0), (1, 2000.0, 1000.0)] {
            ingest(&scheduler, t * 1000, heap_mb, gc_ms);
            if t == 1 {
                scheduler.conf.replace(RcaConf {
                    muted_rca_list: vec![builtin::HIGH_HEAP_USAGE_YOUNG_GEN.to_string()],
                    ..RcaConf::default()
                });
            }
            scheduler.tick_at(t * 1000).await;
        }

        assert_eq!(scheduler.stats().unhealthy_verdicts, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let scheduler = Arc::new(scheduler_with(RcaConf::default(), Duration::from_millis(10)));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(scheduler.stats().ticks >= 1);
    }

    #[tokio::test]
    async fn test_supervised_run_stays_healthy_on_shutdown() {
        let health = HealthRegistry::new();
        health.register(components::SCHEDULER).await;
        let scheduler = Arc::new(
            scheduler_with(RcaConf::default(), Duration::from_millis(10)).with_health(health.clone()),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&scheduler).run_supervised(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(health.component(components::SCHEDULER).await.unwrap().status.is_operational());
    }
}
