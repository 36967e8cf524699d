//! Cluster-wide aggregation of per-node verdicts

use super::{Analysis, EvalContext, InputWindows, Verdict};
use crate::config::RcaConf;
use crate::error::RcaResult;
use crate::models::{Payload, ResourceType, Value};

/// Default number of unhealthy upstreams that make the cluster unhealthy
pub const DEFAULT_MIN_UNHEALTHY: usize = 1;

/// Unhealthy when enough upstream RCAs currently report unhealthy.
///
/// Only the latest non-empty verdict of each upstream counts. Upstreams that
/// have not reported yet are ignored, so a silent peer does not hold the
/// aggregate back.
#[derive(Debug, Clone)]
pub struct ClusterAggregateRca {
    min_unhealthy: usize,
}

impl ClusterAggregateRca {
    pub fn new(min_unhealthy: usize) -> Self {
        Self {
            min_unhealthy: min_unhealthy.max(1),
        }
    }

    pub fn min_unhealthy(&self) -> usize {
        self.min_unhealthy
    }
}

impl Default for ClusterAggregateRca {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_UNHEALTHY)
    }
}

impl Analysis for ClusterAggregateRca {
    fn name(&self) -> &'static str {
        "cluster_aggregate"
    }

    fn has_enough_data(&self, inputs: &InputWindows, _conf: &RcaConf) -> bool {
        inputs.keys().any(|k| inputs.latest(k).is_some())
    }

    fn evaluate(&mut self, ctx: &EvalContext<'_>) -> RcaResult<Verdict> {
        let mut payload = Payload::new(["vertex", "resource", "timestamp"]);
        let mut reporting = 0;

        for upstream in ctx.inputs.keys() {
            let Some(latest) = ctx.inputs.latest(upstream) else {
                continue;
            };
            reporting += 1;

            if latest.is_unhealthy() {
                let resource = latest
                    .resource_context()
                    .map(|c| c.resource_type.to_string())
                    .unwrap_or_default();
                let producer = latest.producing_vertex().unwrap_or(upstream.as_str());
                payload = payload.with_row([
                    Value::from(producer),
                    Value::from(resource),
                    Value::from(latest.timestamp()),
                ]);
            }
        }

        if reporting == 0 {
            return Ok(Verdict::Empty);
        }

        if payload.rows.len() >= self.min_unhealthy {
            Ok(Verdict::Unhealthy(ResourceType::Cluster, payload))
        } else {
            Ok(Verdict::Healthy(ResourceType::Cluster, payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlowUnit;
    use crate::vertex::{Outcome, Vertex};
    use std::sync::Arc;
    use std::time::Duration;

    fn aggregate(min_unhealthy: usize) -> Vertex {
        Vertex::new(
            "cluster",
            Box::new(ClusterAggregateRca::new(min_unhealthy)),
            vec!["node_a".to_string(), "node_b".to_string(), "node_c".to_string()],
            Duration::from_secs(5),
            3,
        )
    }

    fn unhealthy(ts: i64, producer: &str) -> Arc<FlowUnit> {
        Arc::new(
            FlowUnit::unhealthy(ts, ResourceType::HeapYoungGen, Payload::default())
                .produced_by(producer),
        )
    }

    fn healthy(ts: i64) -> Arc<FlowUnit> {
        Arc::new(FlowUnit::healthy_for(ts, ResourceType::HeapYoungGen, Payload::default()))
    }

    #[test]
    fn test_no_reports_is_empty() {
        let mut v = aggregate(1);
        v.consume("node_a", Arc::new(FlowUnit::empty(1)));
        assert_eq!(v.operate(2, &RcaConf::default()).outcome, Outcome::Insufficient);
    }

    #[test]
    fn test_partial_reports_are_enough() {
        let mut v = aggregate(1);
        v.consume("node_a", healthy(1));
        assert_eq!(v.operate(2, &RcaConf::default()).outcome, Outcome::Healthy);

        v.consume("node_b", unhealthy(3, "young_gen@b"));
        let emission = v.operate(4, &RcaConf::default());
        assert_eq!(emission.outcome, Outcome::Unhealthy);
        let rows = &emission.unit.payload().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_str(), Some("young_gen@b"));
        assert_eq!(rows[0][1].as_str(), Some("heap_young_gen"));
    }

    #[test]
    fn test_min_unhealthy_quorum() {
        let mut v = aggregate(2);
        v.consume("node_a", unhealthy(1, "a"));
        v.consume("node_b", healthy(1));
        assert_eq!(v.operate(2, &RcaConf::default()).outcome, Outcome::Healthy);

        v.consume("node_b", unhealthy(3, "b"));
        assert_eq!(v.operate(4, &RcaConf::default()).outcome, Outcome::Unhealthy);
    }

    #[test]
    fn test_latest_verdict_wins() {
        let mut v = aggregate(1);
        v.consume("node_a", unhealthy(1, "a"));
        v.consume("node_a", healthy(2));
        // A trailing empty tick does not hide the last real verdict
        v.consume("node_a", Arc::new(FlowUnit::empty(3)));
        assert_eq!(v.operate(4, &RcaConf::default()).outcome, Outcome::Healthy);
    }
}
