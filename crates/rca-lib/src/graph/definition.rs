//! Declarative graph definitions and the registry of named graphs

use crate::config::RcaConf;
use crate::error::{RcaError, RcaResult};
use crate::models::VertexId;
use crate::vertex::{
    heap::YoungGenThresholds, Analysis, ClusterAggregateRca, HighHeapUsageYoungGenRca,
    MetricSource, VertexKind, DEFAULT_WINDOW_SLOTS,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the built-in young generation heap graph
pub const DEFAULT_ENTRY_POINT: &str = "heap-young-gen";

/// Vertex ids of the built-in graph
pub mod builtin {
    pub const HEAP_USAGE: &str = "heap_usage";
    pub const YOUNG_GC_TIME: &str = "young_gc_time";
    pub const HIGH_HEAP_USAGE_YOUNG_GEN: &str = "high_heap_usage_young_gen";
}

/// Node that evaluates a vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Local,
    /// Peer address, as listed in `remote-peers`
    Peer(String),
}

/// Evaluation strategy of a vertex
#[derive(Debug, Clone, PartialEq)]
pub enum StrategySpec {
    MetricSource,
    HighHeapUsageYoungGen {
        heap_source: VertexId,
        gc_source: VertexId,
    },
    ClusterAggregate {
        min_unhealthy: usize,
    },
}

impl StrategySpec {
    pub fn name(&self) -> &'static str {
        match self {
            StrategySpec::MetricSource => "metric_source",
            StrategySpec::HighHeapUsageYoungGen { .. } => "high_heap_usage_young_gen",
            StrategySpec::ClusterAggregate { .. } => "cluster_aggregate",
        }
    }

    pub fn kind(&self) -> VertexKind {
        match self {
            StrategySpec::MetricSource => VertexKind::MetricSource,
            _ => VertexKind::Rca,
        }
    }

    pub fn instantiate(&self) -> Box<dyn Analysis> {
        match self {
            StrategySpec::MetricSource => Box::new(MetricSource::new()),
            StrategySpec::HighHeapUsageYoungGen {
                heap_source,
                gc_source,
            } => Box::new(HighHeapUsageYoungGenRca::new(
                heap_source.clone(),
                gc_source.clone(),
            )),
            StrategySpec::ClusterAggregate { min_unhealthy } => {
                Box::new(ClusterAggregateRca::new(*min_unhealthy))
            }
        }
    }

    /// Window size for this strategy under `conf`
    pub fn window_slots(&self, conf: &RcaConf) -> usize {
        match self {
            StrategySpec::HighHeapUsageYoungGen { .. } => {
                YoungGenThresholds::from_conf(conf).window_size
            }
            _ => DEFAULT_WINDOW_SLOTS,
        }
    }

    /// Upstreams the strategy reads by name
    pub fn required_upstreams(&self) -> Vec<&str> {
        match self {
            StrategySpec::HighHeapUsageYoungGen {
                heap_source,
                gc_source,
            } => vec![heap_source.as_str(), gc_source.as_str()],
            _ => Vec::new(),
        }
    }
}

/// One vertex of a definition
#[derive(Debug, Clone, PartialEq)]
pub struct VertexDef {
    pub id: VertexId,
    pub strategy: StrategySpec,
    /// Evaluation period; `None` picks the default for the vertex kind
    pub period: Option<Duration>,
    pub owner: Owner,
}

impl VertexDef {
    pub fn new(id: impl Into<VertexId>, strategy: StrategySpec) -> Self {
        Self {
            id: id.into(),
            strategy,
            period: None,
            owner: Owner::Local,
        }
    }

    pub fn metric_source(id: impl Into<VertexId>) -> Self {
        Self::new(id, StrategySpec::MetricSource)
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn owned_by(mut self, peer: impl Into<String>) -> Self {
        self.owner = Owner::Peer(peer.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.owner == Owner::Local
    }
}

/// Vertices and edges of an analysis graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDefinition {
    pub name: String,
    pub vertices: Vec<VertexDef>,
    /// Directed `(upstream, downstream)` pairs
    pub edges: Vec<(VertexId, VertexId)>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn vertex(mut self, def: VertexDef) -> Self {
        self.vertices.push(def);
        self
    }

    pub fn edge(mut self, upstream: impl Into<VertexId>, downstream: impl Into<VertexId>) -> Self {
        self.edges.push((upstream.into(), downstream.into()));
        self
    }
}

type GraphBuilder = Box<dyn Fn(&RcaConf) -> GraphDefinition + Send + Sync>;

/// Named graph definitions, resolved by `analysis-graph-implementor`
pub struct GraphRegistry {
    builders: BTreeMap<String, GraphBuilder>,
}

impl Default for GraphRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl GraphRegistry {
    /// Registry without any graphs
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in graphs
    pub fn with_builtins() -> Self {
        Self::empty().register(DEFAULT_ENTRY_POINT, heap_young_gen)
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        builder: impl Fn(&RcaConf) -> GraphDefinition + Send + Sync + 'static,
    ) -> Self {
        self.builders.insert(name.into(), Box::new(builder));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Build the definition registered under `name`
    pub fn resolve(&self, name: &str, conf: &RcaConf) -> RcaResult<GraphDefinition> {
        let builder = self.builders.get(name).ok_or_else(|| {
            RcaError::configuration(format!("unknown analysis graph entry point '{name}'"))
        })?;
        Ok(builder(conf))
    }
}

impl std::fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.builders.keys()).finish()
    }
}

/// Two heap metric sources feeding the young generation RCA
fn heap_young_gen(conf: &RcaConf) -> GraphDefinition {
    use builtin::*;

    GraphDefinition::new(DEFAULT_ENTRY_POINT)
        .vertex(VertexDef::metric_source(HEAP_USAGE))
        .vertex(VertexDef::metric_source(YOUNG_GC_TIME))
        .vertex(
            VertexDef::new(
                HIGH_HEAP_USAGE_YOUNG_GEN,
                StrategySpec::HighHeapUsageYoungGen {
                    heap_source: HEAP_USAGE.to_string(),
                    gc_source: YOUNG_GC_TIME.to_string(),
                },
            )
            .with_period(conf.rca_check_period()),
        )
        .edge(HEAP_USAGE, HIGH_HEAP_USAGE_YOUNG_GEN)
        .edge(YOUNG_GC_TIME, HIGH_HEAP_USAGE_YOUNG_GEN)
}
