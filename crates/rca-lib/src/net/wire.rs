//! Peer wire format
//!
//! Flow units travel between nodes as protobuf messages, batched into a
//! [`WireEnvelope`] and framed with a big-endian `u32` length prefix.

use crate::error::{RcaError, RcaResult};
use crate::models::{
    FlowUnit, FlowUnitState, Health, Payload, ResourceContext, ResourceType, Value,
};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for an inbound frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct WireEnvelope {
    #[prost(string, tag = "1")]
    pub schema_version: String,
    #[prost(string, tag = "2")]
    pub source_node: String,
    #[prost(int64, tag = "3")]
    pub sent_at: i64,
    #[prost(message, repeated, tag = "4")]
    pub units: Vec<WireFlowUnit>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireFlowUnit {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(int32, tag = "2")]
    pub state: i32,
    #[prost(message, optional, tag = "3")]
    pub resource_context: Option<WireResourceContext>,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<WirePayload>,
    #[prost(string, optional, tag = "5")]
    pub producing_vertex: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireResourceContext {
    #[prost(string, tag = "1")]
    pub resource_type: String,
    #[prost(int32, tag = "2")]
    pub health: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct WirePayload {
    #[prost(string, repeated, tag = "1")]
    pub columns: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<WireRow>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireRow {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<WireValue>,
}

/// A typed cell; an unset `kind` is null
#[derive(Clone, PartialEq, Message)]
pub struct WireValue {
    #[prost(oneof = "wire_value::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<wire_value::Kind>,
}

pub mod wire_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        BoolValue(bool),
        #[prost(int64, tag = "2")]
        IntValue(i64),
        #[prost(double, tag = "3")]
        FloatValue(f64),
        #[prost(string, tag = "4")]
        TextValue(String),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum WireState {
    #[default]
    Empty = 0,
    Valid = 1,
    Stale = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum WireHealth {
    #[default]
    Healthy = 0,
    Unhealthy = 1,
}

impl From<FlowUnitState> for WireState {
    fn from(state: FlowUnitState) -> Self {
        match state {
            FlowUnitState::Empty => WireState::Empty,
            FlowUnitState::Valid => WireState::Valid,
            FlowUnitState::Stale => WireState::Stale,
        }
    }
}

impl TryFrom<i32> for WireState {
    type Error = RcaError;

    fn try_from(value: i32) -> RcaResult<Self> {
        match value {
            0 => Ok(WireState::Empty),
            1 => Ok(WireState::Valid),
            2 => Ok(WireState::Stale),
            other => Err(RcaError::transport("", format!("unknown flow unit state {other}"))),
        }
    }
}

impl From<WireState> for FlowUnitState {
    fn from(state: WireState) -> Self {
        match state {
            WireState::Empty => FlowUnitState::Empty,
            WireState::Valid => FlowUnitState::Valid,
            WireState::Stale => FlowUnitState::Stale,
        }
    }
}

impl From<Health> for WireHealth {
    fn from(health: Health) -> Self {
        match health {
            Health::Healthy => WireHealth::Healthy,
            Health::Unhealthy => WireHealth::Unhealthy,
        }
    }
}

impl TryFrom<i32> for WireHealth {
    type Error = RcaError;

    fn try_from(value: i32) -> RcaResult<Self> {
        match value {
            0 => Ok(WireHealth::Healthy),
            1 => Ok(WireHealth::Unhealthy),
            other => Err(RcaError::transport("", format!("unknown health {other}"))),
        }
    }
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        use wire_value::Kind;
        let kind = match value {
            Value::Null => None,
            Value::Bool(v) => Some(Kind::BoolValue(*v)),
            Value::Int(v) => Some(Kind::IntValue(*v)),
            Value::Float(v) => Some(Kind::FloatValue(*v)),
            Value::Text(v) => Some(Kind::TextValue(v.clone())),
        };
        WireValue { kind }
    }
}

impl From<WireValue> for Value {
    fn from(value: WireValue) -> Self {
        use wire_value::Kind;
        match value.kind {
            None => Value::Null,
            Some(Kind::BoolValue(v)) => Value::Bool(v),
            Some(Kind::IntValue(v)) => Value::Int(v),
            Some(Kind::FloatValue(v)) => Value::Float(v),
            Some(Kind::TextValue(v)) => Value::Text(v),
        }
    }
}

impl From<&Payload> for WirePayload {
    fn from(payload: &Payload) -> Self {
        WirePayload {
            columns: payload.columns.clone(),
            rows: payload
                .rows
                .iter()
                .map(|row| WireRow {
                    values: row.iter().map(WireValue::from).collect(),
                })
                .collect(),
        }
    }
}

impl From<WirePayload> for Payload {
    fn from(payload: WirePayload) -> Self {
        Payload {
            columns: payload.columns,
            rows: payload
                .rows
                .into_iter()
                .map(|row| row.values.into_iter().map(Value::from).collect())
                .collect(),
        }
    }
}

impl From<&FlowUnit> for WireFlowUnit {
    fn from(unit: &FlowUnit) -> Self {
        WireFlowUnit {
            timestamp: unit.timestamp(),
            state: WireState::from(unit.state()) as i32,
            resource_context: unit.resource_context().map(|ctx| WireResourceContext {
                resource_type: ctx.resource_type.wire_name(),
                health: WireHealth::from(ctx.health) as i32,
            }),
            payload: (!unit.payload().columns.is_empty() || !unit.payload().is_empty())
                .then(|| WirePayload::from(unit.payload())),
            producing_vertex: unit.producing_vertex().map(str::to_string),
        }
    }
}

impl TryFrom<WireFlowUnit> for FlowUnit {
    type Error = RcaError;

    fn try_from(wire: WireFlowUnit) -> RcaResult<Self> {
        let state = WireState::try_from(wire.state)?;
        let resource_context = match wire.resource_context {
            Some(ctx) => Some(ResourceContext {
                resource_type: ResourceType::from_name(&ctx.resource_type),
                health: match WireHealth::try_from(ctx.health)? {
                    WireHealth::Healthy => Health::Healthy,
                    WireHealth::Unhealthy => Health::Unhealthy,
                },
            }),
            None => None,
        };

        Ok(FlowUnit::from_parts(
            wire.timestamp,
            state.into(),
            resource_context,
            wire.payload.map(Payload::from).unwrap_or_default(),
            wire.producing_vertex,
        ))
    }
}

/// Encode an envelope as one length-prefixed frame
pub fn encode_frame(envelope: &WireEnvelope) -> Vec<u8> {
    let body = envelope.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, envelope: &WireEnvelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(envelope)).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> anyhow::Result<Option<WireEnvelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        anyhow::bail!("frame of {len} bytes exceeds limit of {max_frame_bytes}");
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(WireEnvelope::decode(body.as_slice())?))
}
