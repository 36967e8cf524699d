//! Edge endpoints
//!
//! Every edge ends in a [`FlowUnitSink`]. In-process edges push into the
//! downstream vertex's input buffer; edges that cross a node boundary hand
//! the unit to the network layer (see `net::RemoteSink`).

use super::buffer::FlowUnitBuffer;
use crate::error::RcaResult;
use crate::models::{FlowUnit, VertexId};
use std::sync::Arc;

/// Receiving end of a graph edge
pub trait FlowUnitSink: Send + Sync {
    /// Human readable destination, for logs
    fn destination(&self) -> String;

    /// Label under which evictions are counted
    fn buffer_label(&self) -> &'static str;

    /// Accept a unit without blocking. Returns the number of older units
    /// evicted to make room.
    fn accept(&self, unit: Arc<FlowUnit>) -> RcaResult<usize>;
}

/// Edge into a vertex owned by this node
#[derive(Debug, Clone)]
pub struct LocalSink {
    target: VertexId,
    buffer: Arc<FlowUnitBuffer>,
}

impl LocalSink {
    pub fn new(target: impl Into<VertexId>, buffer: Arc<FlowUnitBuffer>) -> Self {
        Self {
            target: target.into(),
            buffer,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn buffer(&self) -> &Arc<FlowUnitBuffer> {
        &self.buffer
    }
}

impl FlowUnitSink for LocalSink {
    fn destination(&self) -> String {
        self.target.clone()
    }

    fn buffer_label(&self) -> &'static str {
        "vertex"
    }

    fn accept(&self, unit: Arc<FlowUnit>) -> RcaResult<usize> {
        Ok(self.buffer.push(unit).evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_sink_pushes_into_buffer() {
        let buffer = Arc::new(FlowUnitBuffer::new(1));
        let sink = LocalSink::new("young_gen", Arc::clone(&buffer));

        assert_eq!(sink.accept(Arc::new(FlowUnit::empty(1))).unwrap(), 0);
        assert_eq!(sink.accept(Arc::new(FlowUnit::empty(2))).unwrap(), 1);
        assert_eq!(buffer.snapshot()[0].timestamp(), 2);
        assert_eq!(sink.destination(), "young_gen");
    }
}
