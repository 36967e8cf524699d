//! Metrics read from a JSON document on disk
//!
//! The document maps metric-source vertex ids to payload tables:
//!
//! ```json
//! {
//!   "heap_usage": { "columns": ["MemType", "max"], "rows": [["OldGen", 104857600]] },
//!   "young_gc_time": { "columns": ["MemType", "max"], "rows": [["totYoungGC", 35.0]] }
//! }
//! ```
//!
//! Whatever exports node metrics rewrites the file; every poll reads the
//! latest version.

use super::{async_trait, MetricSample, MetricsCollector};
use crate::models::Payload;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Collector backed by a JSON metrics file
#[derive(Debug, Clone)]
pub struct FileMetricsCollector {
    path: PathBuf,
}

impl FileMetricsCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a metrics document
    pub fn parse(text: &str) -> Result<Vec<MetricSample>> {
        let tables: BTreeMap<String, Payload> =
            serde_json::from_str(text).context("Failed to parse metrics document")?;

        Ok(tables
            .into_iter()
            .map(|(vertex, payload)| MetricSample { vertex, payload })
            .collect())
    }
}

#[async_trait]
impl MetricsCollector for FileMetricsCollector {
    fn name(&self) -> &str {
        "file"
    }

    async fn collect(&self) -> Result<Vec<MetricSample>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read metrics file {:?}", self.path))?;

        let samples = Self::parse(&text)?;
        debug!(path = %self.path.display(), samples = samples.len(), "Read metrics file");
        Ok(samples)
    }
}
