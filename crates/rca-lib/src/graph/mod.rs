//! Analysis graph
//!
//! Owns the vertices of this node, the bounded input buffers in front of
//! them and the sinks behind them:
//! - built once from a [`GraphDefinition`], validated up front
//! - vertices grouped into topological levels for the scheduler
//! - units routed to local buffers or to the network layer through one
//!   [`FlowUnitSink`] abstraction
//! - a topology fingerprint shared with peers

pub mod buffer;
pub mod definition;
pub mod sink;


pub use buffer::{BufferStats, FlowUnitBuffer};
pub use definition::{
    builtin, GraphDefinition, GraphRegistry, Owner, StrategySpec, VertexDef, DEFAULT_ENTRY_POINT,
};
pub use sink::{FlowUnitSink, LocalSink};

use crate::config::RcaConf;
use crate::error::{RcaError, RcaResult};
use crate::models::{FlowUnit, Timestamp, VertexId};
use crate::net::{InboundRouter, NetworkLayer};
use crate::observability::RcaMetrics;
use crate::vertex::{Emission, Vertex, VertexKind};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Inputs needed to build a graph
pub struct GraphContext<'a> {
    pub conf: &'a RcaConf,
    /// Scheduler tick; every evaluation period must be a multiple of it
    pub tick: Duration,
    /// Required when any edge crosses to a peer
    pub network: Option<Arc<NetworkLayer>>,
}

impl<'a> GraphContext<'a> {
    pub fn local(conf: &'a RcaConf, tick: Duration) -> Self {
        Self {
            conf,
            tick,
            network: None,
        }
    }

    pub fn with_network(mut self, network: Arc<NetworkLayer>) -> Self {
        self.network = Some(network);
        self
    }
}

/// Input buffer of a local vertex for one upstream
#[derive(Debug, Clone)]
struct InputEdge {
    upstream: VertexId,
    buffer: Arc<FlowUnitBuffer>,
}

/// Per-vertex input buffer statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InputBufferStats {
    pub vertex: VertexId,
    pub upstream: VertexId,
    pub entries: usize,
    pub capacity: usize,
    pub evicted_total: u64,
}

/// Result of draining and evaluating one vertex
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub emission: Emission,
    /// Inputs dropped for exceeding the maximum age
    pub stale_dropped: usize,
}

/// Validated, wired analysis graph for one node
pub struct AnalysisGraph {
    name: String,
    vertices: BTreeMap<VertexId, Mutex<Vertex>>,
    inputs: BTreeMap<VertexId, Vec<InputEdge>>,
    sinks: BTreeMap<VertexId, Vec<Arc<dyn FlowUnitSink>>>,
    /// Local sinks fed by vertices owned by peers
    inbound: BTreeMap<VertexId, Vec<Arc<dyn FlowUnitSink>>>,
    remote_owners: BTreeMap<VertexId, String>,
    levels: Vec<Vec<VertexId>>,
    tick: Duration,
    schema_version: String,
    metrics: RcaMetrics,
}

impl AnalysisGraph {
    /// Validate `definition` and wire it for this node.
    ///
    /// Fails with [`RcaError::Configuration`] on duplicate or unknown
    /// vertices, cycles, unknown peers and invalid evaluation periods.
    pub fn build(definition: &GraphDefinition, ctx: &GraphContext<'_>) -> RcaResult<Self> {
        if ctx.tick.is_zero() {
            return Err(RcaError::configuration("scheduler tick must be > 0"));
        }

        let defs = index_vertices(definition)?;
        validate_owners(&defs, ctx.conf)?;
        let edges = validate_edges(definition, &defs)?;
        let all_levels = topological_levels(&defs, &edges)?;

        let mut upstreams: BTreeMap<&str, Vec<VertexId>> = BTreeMap::new();
        for (from, to) in &edges {
            upstreams.entry(to.as_str()).or_default().push(from.clone());
        }

        for def in defs.values() {
            for required in def.strategy.required_upstreams() {
                let connected = upstreams
                    .get(def.id.as_str())
                    .map(|ups| ups.iter().any(|u| u == required))
                    .unwrap_or(false);
                if !connected {
                    return Err(RcaError::configuration(format!(
                        "vertex '{}' reads '{}' but no such edge exists",
                        def.id, required
                    )));
                }
            }
        }

        // Local vertices and their input buffers
        let buffer_len = ctx.conf.per_vertex_buffer_length;
        let mut vertices = BTreeMap::new();
        let mut inputs: BTreeMap<VertexId, Vec<InputEdge>> = BTreeMap::new();
        let mut remote_owners = BTreeMap::new();

        for def in defs.values() {
            let period = evaluation_period(def, ctx)?;
            match &def.owner {
                Owner::Peer(peer) => {
                    remote_owners.insert(def.id.clone(), peer.clone());
                }
                Owner::Local => {
                    let ups = upstreams.get(def.id.as_str()).cloned().unwrap_or_default();
                    let mut vertex = Vertex::new(
                        def.id.clone(),
                        def.strategy.instantiate(),
                        ups.clone(),
                        period,
                        def.strategy.window_slots(ctx.conf),
                    );
                    for (from, to) in &edges {
                        if from == &def.id {
                            vertex.add_downstream(to.clone());
                        }
                    }

                    // Metric sources are fed through a single ingest buffer
                    let keys = match def.strategy.kind() {
                        VertexKind::MetricSource => vec![def.id.clone()],
                        VertexKind::Rca => ups,
                    };
                    inputs.insert(
                        def.id.clone(),
                        keys.into_iter()
                            .map(|upstream| InputEdge {
                                upstream,
                                buffer: Arc::new(FlowUnitBuffer::new(buffer_len)),
                            })
                            .collect(),
                    );
                    vertices.insert(def.id.clone(), Mutex::new(vertex));
                }
            }
        }

        // Sinks behind every vertex that has a local or remote consumer
        let mut sinks: BTreeMap<VertexId, Vec<Arc<dyn FlowUnitSink>>> = BTreeMap::new();
        let mut inbound: BTreeMap<VertexId, Vec<Arc<dyn FlowUnitSink>>> = BTreeMap::new();
        let mut remote_targets: BTreeMap<VertexId, BTreeSet<String>> = BTreeMap::new();

        for (from, to) in &edges {
            let from_local = !remote_owners.contains_key(from);
            match (from_local, remote_owners.get(to)) {
                (_, None) => {
                    let buffer = inputs
                        .get(to)
                        .and_then(|edges| edges.iter().find(|e| &e.upstream == from))
                        .map(|e| Arc::clone(&e.buffer))
                        .ok_or_else(|| {
                            RcaError::configuration(format!("no input buffer for edge {from} -> {to}"))
                        })?;
                    let sink: Arc<dyn FlowUnitSink> = Arc::new(LocalSink::new(to.clone(), buffer));
                    let target = if from_local { &mut sinks } else { &mut inbound };
                    target.entry(from.clone()).or_default().push(sink);
                }
                (true, Some(peer)) => {
                    remote_targets
                        .entry(from.clone())
                        .or_default()
                        .insert(peer.clone());
                }
                // Both ends on other nodes: not this node's concern
                (false, Some(_)) => {}
            }
        }

        if !remote_targets.is_empty() {
            let network = ctx.network.as_ref().ok_or_else(|| {
                RcaError::configuration("graph has cross-node edges but no network layer")
            })?;
            for (from, peers) in remote_targets {
                for peer in peers {
                    let sink: Arc<dyn FlowUnitSink> = Arc::new(network.sink_for(peer));
                    sinks.entry(from.clone()).or_default().push(sink);
                }
            }
        }

        let levels: Vec<Vec<VertexId>> = all_levels
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .filter(|id| vertices.contains_key(id))
                    .collect::<Vec<_>>()
            })
            .filter(|level| !level.is_empty())
            .collect();

        let schema_version = fingerprint(&defs, &edges);
        if let Some(network) = &ctx.network {
            network.set_schema_version(schema_version.clone());
        }

        info!(
            graph = %definition.name,
            local_vertices = vertices.len(),
            remote_vertices = remote_owners.len(),
            levels = levels.len(),
            schema_version = %schema_version,
            "Analysis graph built"
        );

        Ok(Self {
            name: definition.name.clone(),
            vertices,
            inputs,
            sinks,
            inbound,
            remote_owners,
            levels,
            tick: ctx.tick,
            schema_version,
            metrics: RcaMetrics::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable fingerprint of the topology
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Scheduler tick the evaluation periods were validated against
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Local vertices grouped by dependency depth
    pub fn topological_levels(&self) -> &[Vec<VertexId>] {
        &self.levels
    }

    pub fn local_vertices(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    pub fn is_local(&self, vertex: &str) -> bool {
        self.vertices.contains_key(vertex)
    }

    pub fn owner_of(&self, vertex: &str) -> Option<Owner> {
        if self.is_local(vertex) {
            Some(Owner::Local)
        } else {
            self.remote_owners.get(vertex).cloned().map(Owner::Peer)
        }
    }

    pub fn evaluation_period(&self, vertex: &str) -> Option<Duration> {
        self.vertices
            .get(vertex)
            .map(|v| v.lock().evaluation_period())
    }

    pub fn vertex_kind(&self, vertex: &str) -> Option<VertexKind> {
        self.vertices.get(vertex).map(|v| v.lock().kind())
    }

    /// Run `f` with exclusive access to a local vertex
    pub fn with_vertex<R>(&self, vertex: &str, f: impl FnOnce(&mut Vertex) -> R) -> Option<R> {
        self.vertices.get(vertex).map(|v| f(&mut *v.lock()))
    }

    /// Push a unit into every sink behind `from`.
    /// Returns the number of sinks that accepted it.
    pub fn route(&self, unit: Arc<FlowUnit>, from: &str) -> usize {
        match self.sinks.get(from) {
            Some(sinks) => self.deliver(sinks, unit, from),
            None => 0,
        }
    }

    /// Feed a metric sample into a local metric source
    pub fn ingest(&self, vertex: &str, unit: FlowUnit) -> RcaResult<()> {
        // A metric source has exactly one input, keyed by its own id
        let edge = self
            .inputs
            .get(vertex)
            .and_then(|edges| match edges.as_slice() {
                [edge] if edge.upstream == vertex => Some(edge),
                _ => None,
            })
            .ok_or_else(|| {
                RcaError::configuration(format!("'{vertex}' is not a local metric source"))
            })?;

        let evicted = edge.buffer.push(Arc::new(unit)).evicted;
        if evicted > 0 {
            self.metrics.add_buffer_evictions("vertex", evicted);
            debug!(vertex = %vertex, evicted = evicted, "Ingest buffer full, evicted oldest units");
        }
        Ok(())
    }

    /// Deliver a unit produced on a peer to its local consumers
    pub fn route_inbound(&self, unit: Arc<FlowUnit>) -> usize {
        let Some(producer) = unit.producing_vertex() else {
            warn!("Dropping inbound unit without producing vertex");
            return 0;
        };

        match self.inbound.get(producer) {
            Some(sinks) => {
                let producer = producer.to_string();
                self.deliver(sinks, unit, &producer)
            }
            None => {
                warn!(producer = %producer, "Dropping inbound unit from unknown producer");
                0
            }
        }
    }

    fn deliver(&self, sinks: &[Arc<dyn FlowUnitSink>], unit: Arc<FlowUnit>, from: &str) -> usize {
        let mut accepted = 0;
        for sink in sinks {
            match sink.accept(Arc::clone(&unit)) {
                Ok(evicted) => {
                    accepted += 1;
                    if evicted > 0 {
                        self.metrics.add_buffer_evictions(sink.buffer_label(), evicted);
                        debug!(
                            from = %from,
                            to = %sink.destination(),
                            evicted = evicted,
                            "Buffer full, evicted oldest units"
                        );
                    }
                }
                Err(e) => {
                    debug!(from = %from, to = %sink.destination(), error = %e, "Sink rejected unit");
                }
            }
        }
        accepted
    }

    /// Drain the inputs of `vertex`, fold them into its windows and
    /// evaluate it once. Inputs and window contents older than `max_age`
    /// are dropped first.
    pub fn evaluate(
        &self,
        vertex: &str,
        now: Timestamp,
        conf: &RcaConf,
        max_age: Duration,
    ) -> Option<Evaluation> {
        let cell = self.vertices.get(vertex)?;
        let edges = self.inputs.get(vertex)?;

        let mut v = cell.lock();
        v.set_muted(conf.is_muted(vertex));

        let mut stale_dropped = 0;
        for edge in edges {
            for unit in edge.buffer.drain() {
                if unit.is_stale(now, max_age) {
                    stale_dropped += 1;
                    continue;
                }
                v.consume(&edge.upstream, unit);
            }
        }
        // Window contents age too, not just freshly drained inputs
        stale_dropped += v.expire(now, max_age);
        if stale_dropped > 0 {
            self.metrics.add_units_dropped("stale", stale_dropped);
            debug!(vertex = %vertex, dropped = stale_dropped, "Dropped stale inputs");
        }

        Some(Evaluation {
            emission: v.operate(now, conf),
            stale_dropped,
        })
    }

    /// Apply the buffer length of a new configuration snapshot
    pub fn apply_conf(&self, conf: &RcaConf) {
        for edges in self.inputs.values() {
            for edge in edges {
                let evicted = edge.buffer.set_capacity(conf.per_vertex_buffer_length);
                self.metrics.add_buffer_evictions("vertex", evicted);
            }
        }
    }

    pub fn buffer_stats(&self) -> Vec<InputBufferStats> {
        self.inputs
            .iter()
            .flat_map(|(vertex, edges)| {
                edges.iter().map(move |edge| {
                    let stats = edge.buffer.stats();
                    InputBufferStats {
                        vertex: vertex.clone(),
                        upstream: edge.upstream.clone(),
                        entries: stats.entries,
                        capacity: stats.capacity,
                        evicted_total: stats.evicted_total,
                    }
                })
            })
            .collect()
    }
}

impl InboundRouter for AnalysisGraph {
    fn schema_version(&self) -> &str {
        &self.schema_version
    }

    fn route_inbound(&self, unit: Arc<FlowUnit>) -> usize {
        AnalysisGraph::route_inbound(self, unit)
    }
}

impl std::fmt::Debug for AnalysisGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisGraph")
            .field("name", &self.name)
            .field("levels", &self.levels)
            .field("remote_owners", &self.remote_owners)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

fn index_vertices(definition: &GraphDefinition) -> RcaResult<BTreeMap<VertexId, &VertexDef>> {
    let mut defs = BTreeMap::new();
    for def in &definition.vertices {
        if def.id.trim().is_empty() {
            return Err(RcaError::configuration("vertex id must not be empty"));
        }
        if defs.insert(def.id.clone(), def).is_some() {
            return Err(RcaError::configuration(format!(
                "duplicate vertex id '{}'",
                def.id
            )));
        }
    }
    Ok(defs)
}

fn validate_owners(defs: &BTreeMap<VertexId, &VertexDef>, conf: &RcaConf) -> RcaResult<()> {
    for def in defs.values() {
        if let Owner::Peer(peer) = &def.owner {
            if !conf.is_known_peer(peer) {
                return Err(RcaError::configuration(format!(
                    "vertex '{}' is owned by unknown peer '{}'",
                    def.id, peer
                )));
            }
        }
    }
    Ok(())
}

fn validate_edges(
    definition: &GraphDefinition,
    defs: &BTreeMap<VertexId, &VertexDef>,
) -> RcaResult<BTreeSet<(VertexId, VertexId)>> {
    let mut edges = BTreeSet::new();
    for (from, to) in &definition.edges {
        for end in [from, to] {
            if !defs.contains_key(end) {
                return Err(RcaError::configuration(format!(
                    "edge {from} -> {to} references undeclared vertex '{end}'"
                )));
            }
        }
        if defs[to].strategy.kind() == VertexKind::MetricSource {
            return Err(RcaError::configuration(format!(
                "metric source '{to}' cannot have upstream '{from}'"
            )));
        }
        edges.insert((from.clone(), to.clone()));
    }
    Ok(edges)
}

fn evaluation_period(def: &VertexDef, ctx: &GraphContext<'_>) -> RcaResult<Duration> {
    let period = match (def.period, def.strategy.kind()) {
        (Some(period), _) => period,
        (None, VertexKind::MetricSource) => ctx.tick,
        (None, VertexKind::Rca) => ctx.conf.rca_check_period(),
    };

    let (period_ms, tick_ms) = (period.as_millis(), ctx.tick.as_millis());
    if period_ms == 0 || tick_ms == 0 || period_ms % tick_ms != 0 {
        return Err(RcaError::configuration(format!(
            "evaluation period of '{}' ({period_ms} ms) is not a positive multiple of the {tick_ms} ms tick",
            def.id
        )));
    }
    Ok(period)
}

/// Kahn's algorithm, one level per dependency depth.
/// Anything left unvisited sits on a cycle.
fn topological_levels(
    defs: &BTreeMap<VertexId, &VertexDef>,
    edges: &BTreeSet<(VertexId, VertexId)>,
) -> RcaResult<Vec<Vec<VertexId>>> {
    let mut in_degree: BTreeMap<&str, usize> = defs.keys().map(|k| (k.as_str(), 0)).collect();
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (from, to) in edges {
        *in_degree.entry(to.as_str()).or_default() += 1;
        children.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut levels = Vec::new();
    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut visited = 0;

    while !current.is_empty() {
        visited += current.len();
        let mut next = BTreeSet::new();
        for id in &current {
            for child in children.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        next.insert(*child);
                    }
                }
            }
        }
        levels.push(current.iter().map(|s| s.to_string()).collect());
        current = next.into_iter().collect();
    }

    if visited != defs.len() {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(k, _)| *k)
            .collect();
        return Err(RcaError::configuration(format!(
            "analysis graph contains a cycle through {}",
            cyclic.join(", ")
        )));
    }

    Ok(levels)
}

fn fingerprint(
    defs: &BTreeMap<VertexId, &VertexDef>,
    edges: &BTreeSet<(VertexId, VertexId)>,
) -> String {
    let mut hasher = Sha256::new();
    for (id, def) in defs {
        hasher.update(format!("vertex {id} {}\n", def.strategy.name()));
    }
    for (from, to) in edges {
        hasher.update(format!("edge {from} {to}\n"));
    }
    hex::encode(hasher.finalize())
}
