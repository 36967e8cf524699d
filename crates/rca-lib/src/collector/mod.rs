//! Local metric collection
//!
//! A [`MetricsCollector`] reads one sample per metric-source vertex; the
//! [`CollectionLoop`] polls it periodically and ingests the samples into the
//! analysis graph, where the scheduler picks them up on its next tick.

mod file;
mod r#loop;


pub use file::FileMetricsCollector;
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder, CollectionResults};

use crate::models::{Payload, VertexId};
use anyhow::Result;

pub use async_trait::async_trait;

/// One reading destined for a metric-source vertex
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub vertex: VertexId,
    pub payload: Payload,
}

impl MetricSample {
    pub fn new(vertex: impl Into<VertexId>, payload: Payload) -> Self {
        Self {
            vertex: vertex.into(),
            payload,
        }
    }
}

/// Trait for metrics collection implementations
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Read the current samples for every metric source this collector
    /// knows about
    async fn collect(&self) -> Result<Vec<MetricSample>>;
}
