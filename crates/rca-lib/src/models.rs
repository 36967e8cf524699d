//! Core data models: flow units and their payload tables

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a graph vertex
pub type VertexId = String;

/// Wall-clock instant in milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a flow unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowUnitState {
    /// No data for this tick
    Empty,
    /// Carries a metric sample or a verdict
    Valid,
    /// Arrived after its maximum useful age
    Stale,
}

/// Health verdict attached to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Resource a verdict is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Unknown,
    HeapYoungGen,
    HeapOldGen,
    Cpu,
    Cluster,
    Other(String),
}

const OTHER_PREFIX: &str = "other:";

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Unknown => "unknown",
            ResourceType::HeapYoungGen => "heap_young_gen",
            ResourceType::HeapOldGen => "heap_old_gen",
            ResourceType::Cpu => "cpu",
            ResourceType::Cluster => "cluster",
            ResourceType::Other(name) => name,
        }
    }

    /// Name carried on the wire. Custom types are prefixed so that a custom
    /// name equal to a built-in one still decodes as custom.
    pub fn wire_name(&self) -> String {
        match self {
            ResourceType::Other(name) => format!("{OTHER_PREFIX}{name}"),
            builtin => builtin.as_str().to_string(),
        }
    }

    /// Inverse of [`ResourceType::wire_name`]; unprefixed unknown names
    /// become [`ResourceType::Other`]
    pub fn from_name(name: &str) -> Self {
        if let Some(custom) = name.strip_prefix(OTHER_PREFIX) {
            return ResourceType::Other(custom.to_string());
        }
        match name {
            "unknown" | "" => ResourceType::Unknown,
            "heap_young_gen" => ResourceType::HeapYoungGen,
            "heap_old_gen" => ResourceType::HeapOldGen,
            "cpu" => ResourceType::Cpu,
            "cluster" => ResourceType::Cluster,
            other => ResourceType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict about a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContext {
    pub resource_type: ResourceType,
    pub health: Health,
}

impl ResourceContext {
    pub fn is_unhealthy(&self) -> bool {
        self.health == Health::Unhealthy
    }
}

/// A typed cell of a payload row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the cell. Text cells holding a number parse too,
    /// since metric readers commonly hand values over as strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Null | Value::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Table-like record set carried by a flow unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Payload {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row, builder style
    pub fn with_row<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rows.push(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `value_column` in the first row whose `key_column` equals `key`
    pub fn lookup(&self, key_column: &str, key: &str, value_column: &str) -> Option<&Value> {
        let key_idx = self.column_index(key_column)?;
        let value_idx = self.column_index(value_column)?;

        self.rows
            .iter()
            .find(|row| row.get(key_idx).and_then(Value::as_str) == Some(key))
            .and_then(|row| row.get(value_idx))
    }
}

/// Immutable unit of data moving along a graph edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowUnit {
    timestamp: Timestamp,
    state: FlowUnitState,
    resource_context: Option<ResourceContext>,
    payload: Payload,
    producing_vertex: Option<VertexId>,
}

impl FlowUnit {
    /// A unit carrying no data for this tick
    pub fn empty(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            state: FlowUnitState::Empty,
            resource_context: None,
            payload: Payload::default(),
            producing_vertex: None,
        }
    }

    /// A healthy verdict with no specific resource
    pub fn healthy(timestamp: Timestamp, payload: Payload) -> Self {
        Self::healthy_for(timestamp, ResourceType::Unknown, payload)
    }

    /// A healthy verdict about a specific resource
    pub fn healthy_for(timestamp: Timestamp, resource_type: ResourceType, payload: Payload) -> Self {
        Self::verdict(timestamp, resource_type, Health::Healthy, payload)
    }

    pub fn unhealthy(timestamp: Timestamp, resource_type: ResourceType, payload: Payload) -> Self {
        Self::verdict(timestamp, resource_type, Health::Unhealthy, payload)
    }

    /// A metric sample without a verdict
    pub fn metric(timestamp: Timestamp, payload: Payload) -> Self {
        Self {
            timestamp,
            state: FlowUnitState::Valid,
            resource_context: None,
            payload,
            producing_vertex: None,
        }
    }

    fn verdict(
        timestamp: Timestamp,
        resource_type: ResourceType,
        health: Health,
        payload: Payload,
    ) -> Self {
        Self {
            timestamp,
            state: FlowUnitState::Valid,
            resource_context: Some(ResourceContext {
                resource_type,
                health,
            }),
            payload,
            producing_vertex: None,
        }
    }

    /// Stamp the producing vertex. Consumes the unit, so it can only be
    /// applied before the unit is shared.
    pub fn produced_by(mut self, vertex: impl Into<VertexId>) -> Self {
        self.producing_vertex = Some(vertex.into());
        self
    }

    /// Re-label a valid unit as stale. Empty units stay empty.
    pub fn into_stale(mut self) -> Self {
        if self.state == FlowUnitState::Valid {
            self.state = FlowUnitState::Stale;
        }
        self
    }

    /// Rebuild a unit from its parts, as received from a peer.
    /// EMPTY units are normalised to carry no context and no rows.
    pub fn from_parts(
        timestamp: Timestamp,
        state: FlowUnitState,
        resource_context: Option<ResourceContext>,
        payload: Payload,
        producing_vertex: Option<VertexId>,
    ) -> Self {
        if state == FlowUnitState::Empty {
            return Self {
                producing_vertex,
                ..Self::empty(timestamp)
            };
        }

        Self {
            timestamp,
            state,
            resource_context,
            payload,
            producing_vertex,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn state(&self) -> FlowUnitState {
        self.state
    }

    pub fn resource_context(&self) -> Option<&ResourceContext> {
        self.resource_context.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn producing_vertex(&self) -> Option<&str> {
        self.producing_vertex.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.state == FlowUnitState::Empty
    }

    pub fn is_unhealthy(&self) -> bool {
        self.resource_context
            .as_ref()
            .map(ResourceContext::is_unhealthy)
            .unwrap_or(false)
    }

    /// True when the unit is older than `max_age` at `now`
    pub fn is_stale(&self, now: Timestamp, max_age: Duration) -> bool {
        // Timestamps may come off the wire, so neither side is trusted
        let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.timestamp) > max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_payload(bytes: f64) -> Payload {
        Payload::new(["MemType", "max"]).with_row([Value::from("OldGen"), Value::from(bytes)])
    }

    #[test]
    fn test_empty_unit_has_no_context_or_rows() {
        let unit = FlowUnit::empty(1_000);
        assert!(unit.is_empty());
        assert!(unit.resource_context().is_none());
        assert!(unit.payload().is_empty());
        assert!(!unit.is_unhealthy());
    }

    #[test]
    fn test_verdict_constructors() {
        let healthy = FlowUnit::healthy(10, Payload::default());
        assert_eq!(healthy.state(), FlowUnitState::Valid);
        assert_eq!(healthy.resource_context().unwrap().health, Health::Healthy);

        let unhealthy = FlowUnit::unhealthy(10, ResourceType::HeapYoungGen, heap_payload(1.0))
            .produced_by("young_gen");
        assert!(unhealthy.is_unhealthy());
        assert_eq!(unhealthy.producing_vertex(), Some("young_gen"));
        assert_eq!(
            unhealthy.resource_context().unwrap().resource_type,
            ResourceType::HeapYoungGen
        );
    }

    #[test]
    fn test_is_stale() {
        let unit = FlowUnit::metric(1_000, heap_payload(1.0));
        assert!(!unit.is_stale(1_500, Duration::from_secs(1)));
        assert!(unit.is_stale(2_001, Duration::from_secs(1)));
    }

    #[test]
    fn test_is_stale_extreme_timestamps() {
        let ancient = FlowUnit::from_parts(i64::MIN, FlowUnitState::Valid, None, Payload::default(), None);
        assert!(ancient.is_stale(1_000, Duration::from_secs(600)));
        assert!(ancient.is_stale(i64::MAX, Duration::from_secs(1)));

        let future = FlowUnit::from_parts(i64::MAX, FlowUnitState::Valid, None, Payload::default(), None);
        assert!(!future.is_stale(i64::MIN, Duration::from_secs(600)));
    }

    #[test]
    fn test_from_parts_normalises_empty() {
        let unit = FlowUnit::from_parts(
            5,
            FlowUnitState::Empty,
            Some(ResourceContext {
                resource_type: ResourceType::Cpu,
                health: Health::Unhealthy,
            }),
            heap_payload(3.0),
            Some("cpu".to_string()),
        );
        assert!(unit.is_empty());
        assert!(unit.resource_context().is_none());
        assert!(unit.payload().is_empty());
        assert_eq!(unit.producing_vertex(), Some("cpu"));
    }

    #[test]
    fn test_into_stale_keeps_empty() {
        assert_eq!(FlowUnit::empty(1).into_stale().state(), FlowUnitState::Empty);
        assert_eq!(
            FlowUnit::metric(1, heap_payload(1.0)).into_stale().state(),
            FlowUnitState::Stale
        );
    }

    #[test]
    fn test_payload_lookup() {
        let payload = Payload::new(["MemType", "max"])
            .with_row([Value::from("Eden"), Value::from(10.0)])
            .with_row([Value::from("OldGen"), Value::from("2048")]);

        assert_eq!(
            payload.lookup("MemType", "OldGen", "max").and_then(Value::as_f64),
            Some(2048.0)
        );
        assert!(payload.lookup("MemType", "Survivor", "max").is_none());
        assert!(payload.lookup("Missing", "OldGen", "max").is_none());
    }

    #[test]
    fn test_resource_type_names() {
        for rt in [
            ResourceType::Unknown,
            ResourceType::HeapYoungGen,
            ResourceType::HeapOldGen,
            ResourceType::Cpu,
            ResourceType::Cluster,
            ResourceType::Other("disk".to_string()),
            ResourceType::Other("cpu".to_string()),
            ResourceType::Other(String::new()),
            ResourceType::Other("other:disk".to_string()),
        ] {
            assert_eq!(ResourceType::from_name(&rt.wire_name()), rt);
        }
        assert_eq!(ResourceType::from_name("cpu"), ResourceType::Cpu);
        assert_eq!(ResourceType::from_name("disk"), ResourceType::Other("disk".to_string()));
        assert_eq!(ResourceType::Other("cpu".to_string()).to_string(), "cpu");
    }
}
