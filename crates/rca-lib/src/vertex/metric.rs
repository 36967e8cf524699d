//! Metric source vertex

use super::{Analysis, EvalContext, VertexKind, Verdict};
use crate::config::RcaConf;
use crate::error::RcaResult;
use crate::models::Timestamp;

/// Forwards the latest ingested sample downstream.
///
/// Each sample is emitted once; ticks with nothing new produce EMPTY so that
/// downstream windows are not filled with repeats of the same reading.
#[derive(Debug, Default)]
pub struct MetricSource {
    last_emitted: Option<Timestamp>,
}

impl MetricSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Analysis for MetricSource {
    fn name(&self) -> &'static str {
        "metric_source"
    }

    fn kind(&self) -> VertexKind {
        VertexKind::MetricSource
    }

    fn min_observations(&self, _conf: &RcaConf) -> usize {
        1
    }

    fn evaluate(&mut self, ctx: &EvalContext<'_>) -> RcaResult<Verdict> {
        let Some(latest) = ctx.inputs.latest(ctx.vertex) else {
            return Ok(Verdict::Empty);
        };

        if self.last_emitted == Some(latest.timestamp()) {
            return Ok(Verdict::Empty);
        }
        self.last_emitted = Some(latest.timestamp());

        Ok(Verdict::Metric(latest.payload().clone()))
    }
}
