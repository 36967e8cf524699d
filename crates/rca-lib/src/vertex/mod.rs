//! Graph vertices
//!
//! A [`Vertex`] is a generic shell around an evaluation strategy:
//! - one sliding window per upstream (or one ingest window for metric sources)
//! - a minimum-observation gate before the strategy is consulted
//! - muting, which keeps window state advancing but propagates EMPTY
//!
//! Strategies implement [`Analysis`]. Built-in ones live in the submodules.

pub mod cluster;
pub mod heap;
pub mod metric;

pub use cluster::ClusterAggregateRca;
pub use heap::HighHeapUsageYoungGenRca;
pub use metric::MetricSource;

use crate::config::RcaConf;
use crate::error::RcaResult;
use crate::models::{FlowUnit, Payload, ResourceType, Timestamp, VertexId};
use crate::window::SlidingWindow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of observations kept per input window
pub const DEFAULT_WINDOW_SLOTS: usize = 5;

/// Kind of vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexKind {
    /// Fed by the collection loop, emits metric units
    MetricSource,
    /// Consumes upstream units and emits verdicts
    Rca,
}

impl VertexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VertexKind::MetricSource => "metric_source",
            VertexKind::Rca => "rca",
        }
    }
}

/// What a strategy concluded for one tick
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not enough data to decide
    Empty,
    /// A metric sample to forward
    Metric(Payload),
    Healthy(ResourceType, Payload),
    Unhealthy(ResourceType, Payload),
}

/// Input windows of a vertex, keyed by upstream id
#[derive(Debug, Clone)]
pub struct InputWindows {
    windows: BTreeMap<VertexId, SlidingWindow<Arc<FlowUnit>>>,
}

impl InputWindows {
    fn new<'a>(keys: impl IntoIterator<Item = &'a VertexId>, slots: usize) -> Self {
        Self {
            windows: keys
                .into_iter()
                .map(|k| (k.clone(), SlidingWindow::new(slots)))
                .collect(),
        }
    }

    pub fn window(&self, upstream: &str) -> Option<&SlidingWindow<Arc<FlowUnit>>> {
        self.windows.get(upstream)
    }

    /// Non-empty units of one input, oldest first
    pub fn observations<'a>(&'a self, upstream: &str) -> impl Iterator<Item = &'a Arc<FlowUnit>> + 'a {
        self.windows
            .get(upstream)
            .into_iter()
            .flat_map(|w| w.iter())
            .filter(|u| !u.is_empty())
    }

    /// Number of non-empty units of one input
    pub fn observation_count(&self, upstream: &str) -> usize {
        self.observations(upstream).count()
    }

    /// Most recent non-empty unit of one input
    pub fn latest(&self, upstream: &str) -> Option<&Arc<FlowUnit>> {
        self.observations(upstream).last()
    }

    pub fn keys(&self) -> impl Iterator<Item = &VertexId> {
        self.windows.keys()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop units older than `max_age` from every window
    fn expire(&mut self, now: Timestamp, max_age: Duration) -> usize {
        self.windows
            .values_mut()
            .map(|w| w.retain(|u| !u.is_stale(now, max_age)))
            .sum()
    }

    fn push(&mut self, upstream: &str, unit: Arc<FlowUnit>) -> bool {
        match self.windows.get_mut(upstream) {
            Some(window) => {
                window.push(unit);
                true
            }
            None => false,
        }
    }
}

/// Everything a strategy may look at during one evaluation
pub struct EvalContext<'a> {
    pub vertex: &'a str,
    pub now: Timestamp,
    pub conf: &'a RcaConf,
    pub inputs: &'a InputWindows,
}

/// Evaluation strategy plugged into a [`Vertex`]
pub trait Analysis: Send {
    /// Strategy name, used in the graph fingerprint and in logs
    fn name(&self) -> &'static str;

    fn kind(&self) -> VertexKind {
        VertexKind::Rca
    }

    /// Observations each input needs before [`Analysis::evaluate`] is called
    fn min_observations(&self, _conf: &RcaConf) -> usize {
        1
    }

    /// Whether the inputs hold enough data to evaluate.
    /// By default every input must reach [`Analysis::min_observations`].
    fn has_enough_data(&self, inputs: &InputWindows, conf: &RcaConf) -> bool {
        let min = self.min_observations(conf);
        !inputs.is_empty() && inputs.keys().all(|k| inputs.observation_count(k) >= min)
    }

    fn evaluate(&mut self, ctx: &EvalContext<'_>) -> RcaResult<Verdict>;
}

/// Classification of one evaluation, used for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not enough observations yet, or the strategy declined
    Insufficient,
    Metric,
    Healthy,
    Unhealthy,
    /// Evaluated, but the vertex is muted
    Muted,
    /// The strategy returned an error
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Insufficient => "insufficient",
            Outcome::Metric => "metric",
            Outcome::Healthy => "healthy",
            Outcome::Unhealthy => "unhealthy",
            Outcome::Muted => "muted",
            Outcome::Failed => "failed",
        }
    }
}

/// Result of [`Vertex::operate`]
#[derive(Debug, Clone)]
pub struct Emission {
    pub unit: Arc<FlowUnit>,
    pub outcome: Outcome,
}

/// Generic graph node
pub struct Vertex {
    id: VertexId,
    kind: VertexKind,
    evaluation_period: Duration,
    upstream: Vec<VertexId>,
    downstream: BTreeSet<VertexId>,
    muted: bool,
    inputs: InputWindows,
    analysis: Box<dyn Analysis>,
}

impl Vertex {
    /// Create a vertex. Metric sources get a single ingest window keyed by
    /// their own id; other vertices one window per upstream.
    pub fn new(
        id: impl Into<VertexId>,
        analysis: Box<dyn Analysis>,
        upstream: Vec<VertexId>,
        evaluation_period: Duration,
        window_slots: usize,
    ) -> Self {
        let id = id.into();
        let kind = analysis.kind();
        let inputs = match kind {
            VertexKind::MetricSource => InputWindows::new(std::iter::once(&id), window_slots),
            VertexKind::Rca => InputWindows::new(upstream.iter(), window_slots),
        };

        Self {
            id,
            kind,
            evaluation_period,
            upstream,
            downstream: BTreeSet::new(),
            muted: false,
            inputs,
            analysis,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> VertexKind {
        self.kind
    }

    pub fn strategy_name(&self) -> &'static str {
        self.analysis.name()
    }

    pub fn evaluation_period(&self) -> Duration {
        self.evaluation_period
    }

    pub fn upstream(&self) -> &[VertexId] {
        &self.upstream
    }

    pub fn downstream(&self) -> &BTreeSet<VertexId> {
        &self.downstream
    }

    pub(crate) fn add_downstream(&mut self, id: VertexId) {
        self.downstream.insert(id);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn inputs(&self) -> &InputWindows {
        &self.inputs
    }

    /// Record a unit from `upstream` into its window
    pub fn consume(&mut self, upstream: &str, unit: Arc<FlowUnit>) {
        if !self.inputs.push(upstream, unit) {
            debug!(vertex = %self.id, upstream = %upstream, "Dropping unit from unconnected upstream");
        }
    }

    /// Forget window contents older than `max_age`, so a silent upstream's
    /// last verdict stops counting. Returns the number of units dropped.
    pub fn expire(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let expired = self.inputs.expire(now, max_age);
        if expired > 0 {
            debug!(vertex = %self.id, expired = expired, "Expired window contents");
        }
        expired
    }

    /// Evaluate once and build the unit to propagate
    pub fn operate(&mut self, now: Timestamp, conf: &RcaConf) -> Emission {
        let verdict = if self.analysis.has_enough_data(&self.inputs, conf) {
            let ctx = EvalContext {
                vertex: &self.id,
                now,
                conf,
                inputs: &self.inputs,
            };
            self.analysis.evaluate(&ctx)
        } else {
            Ok(Verdict::Empty)
        };

        let (unit, outcome) = match verdict {
            Ok(Verdict::Empty) => (FlowUnit::empty(now), Outcome::Insufficient),
            Ok(Verdict::Metric(payload)) => (FlowUnit::metric(now, payload), Outcome::Metric),
            Ok(Verdict::Healthy(rt, payload)) => {
                (FlowUnit::healthy_for(now, rt, payload), Outcome::Healthy)
            }
            Ok(Verdict::Unhealthy(rt, payload)) => {
                (FlowUnit::unhealthy(now, rt, payload), Outcome::Unhealthy)
            }
            Err(e) => {
                warn!(vertex = %self.id, error = %e, "Evaluation failed, emitting empty unit");
                (FlowUnit::empty(now), Outcome::Failed)
            }
        };

        if self.muted && !unit.is_empty() {
            debug!(vertex = %self.id, outcome = outcome.as_str(), "Vertex muted, suppressing output");
            return Emission {
                unit: Arc::new(FlowUnit::empty(now).produced_by(self.id.clone())),
                outcome: Outcome::Muted,
            };
        }

        Emission {
            unit: Arc::new(unit.produced_by(self.id.clone())),
            outcome,
        }
    }
}

impl std::fmt::Debug for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vertex")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("strategy", &self.analysis.name())
            .field("evaluation_period", &self.evaluation_period)
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("muted", &self.muted)
            .finish()
    }
}
