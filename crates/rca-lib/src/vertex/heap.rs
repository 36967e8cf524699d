//! Young generation heap pressure
//!
//! Flags the young generation as unhealthy when objects are promoted to the
//! old generation faster than a threshold while young collections are also
//! eating a large share of wall-clock time.
//!
//! Inputs:
//! - heap usage: row `MemType = OldGen`, column `max`, in bytes
//! - young GC time: row `MemType = totYoungGC`, column `max`, milliseconds
//!   spent collecting during the sample interval

use super::{Analysis, EvalContext, InputWindows, Verdict};
use crate::config::{RcaConf, ThresholdSettings, YOUNG_GEN_RCA_CONF_KEY};
use crate::error::{RcaError, RcaResult};
use crate::models::{FlowUnit, Payload, ResourceType, Timestamp, Value, VertexId};
use std::sync::Arc;

pub const MEM_TYPE_COLUMN: &str = "MemType";
pub const MAX_COLUMN: &str = "max";
pub const OLD_GEN_ROW: &str = "OldGen";
pub const YOUNG_GC_ROW: &str = "totYoungGC";

pub const PROMOTION_RATE_KEY: &str = "promotion-rate-threshold-mb-per-sec";
pub const YOUNG_GC_TIME_KEY: &str = "young-gc-time-threshold-ms-per-sec";
pub const WINDOW_SIZE_KEY: &str = "window-size";
pub const MIN_SAMPLES_KEY: &str = "min-samples";

pub const DEFAULT_PROMOTION_RATE_MB_PER_SEC: f64 = 500.0;
pub const DEFAULT_YOUNG_GC_TIME_MS_PER_SEC: f64 = 400.0;
pub const DEFAULT_WINDOW_SIZE: usize = 5;
pub const DEFAULT_MIN_SAMPLES: usize = 2;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Thresholds of the young-gen rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoungGenThresholds {
    pub promotion_rate_mb_per_sec: f64,
    pub young_gc_time_ms_per_sec: f64,
    pub window_size: usize,
    pub min_samples: usize,
}

impl Default for YoungGenThresholds {
    fn default() -> Self {
        Self {
            promotion_rate_mb_per_sec: DEFAULT_PROMOTION_RATE_MB_PER_SEC,
            young_gc_time_ms_per_sec: DEFAULT_YOUNG_GC_TIME_MS_PER_SEC,
            window_size: DEFAULT_WINDOW_SIZE,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl YoungGenThresholds {
    pub fn from_settings(settings: &ThresholdSettings) -> Self {
        let defaults = Self::default();
        Self {
            promotion_rate_mb_per_sec: settings
                .f64_or(PROMOTION_RATE_KEY, defaults.promotion_rate_mb_per_sec),
            young_gc_time_ms_per_sec: settings
                .f64_or(YOUNG_GC_TIME_KEY, defaults.young_gc_time_ms_per_sec),
            window_size: settings.usize_or(WINDOW_SIZE_KEY, defaults.window_size).max(1),
            min_samples: settings.usize_or(MIN_SAMPLES_KEY, defaults.min_samples).max(2),
        }
    }

    pub fn from_conf(conf: &RcaConf) -> Self {
        Self::from_settings(&conf.thresholds_for(YOUNG_GEN_RCA_CONF_KEY))
    }
}

/// Derived rates over one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoungGenRates {
    pub promotion_rate_mb_per_sec: f64,
    pub young_gc_time_ms_per_sec: f64,
}

/// Young generation RCA over a heap-usage and a GC-time stream
#[derive(Debug, Clone)]
pub struct HighHeapUsageYoungGenRca {
    heap_source: VertexId,
    gc_source: VertexId,
}

impl HighHeapUsageYoungGenRca {
    pub fn new(heap_source: impl Into<VertexId>, gc_source: impl Into<VertexId>) -> Self {
        Self {
            heap_source: heap_source.into(),
            gc_source: gc_source.into(),
        }
    }

    pub fn heap_source(&self) -> &str {
        &self.heap_source
    }

    pub fn gc_source(&self) -> &str {
        &self.gc_source
    }

    /// Promotion and GC rates over the current windows.
    /// `None` when either window spans zero elapsed time.
    pub fn rates(&self, vertex: &str, inputs: &InputWindows) -> RcaResult<Option<YoungGenRates>> {
        let heap = samples(vertex, inputs, &self.heap_source, OLD_GEN_ROW)?;
        let gc = samples(vertex, inputs, &self.gc_source, YOUNG_GC_ROW)?;

        let (Some(heap_span), Some(gc_span)) = (elapsed_secs(&heap), elapsed_secs(&gc)) else {
            return Ok(None);
        };

        let (oldest, newest) = match (heap.first(), heap.last()) {
            (Some((_, oldest)), Some((_, newest))) => (*oldest, *newest),
            _ => return Ok(None),
        };
        let promoted_mb = (newest - oldest) / BYTES_PER_MB;
        let gc_ms: f64 = gc.iter().map(|(_, ms)| ms).sum();

        Ok(Some(YoungGenRates {
            promotion_rate_mb_per_sec: promoted_mb / heap_span,
            young_gc_time_ms_per_sec: gc_ms / gc_span,
        }))
    }
}

/// (timestamp, value) pairs of one input, oldest first
fn samples(
    vertex: &str,
    inputs: &InputWindows,
    upstream: &str,
    row: &str,
) -> RcaResult<Vec<(Timestamp, f64)>> {
    inputs
        .observations(upstream)
        .map(|unit| read_value(vertex, unit, row).map(|value| (unit.timestamp(), value)))
        .collect()
}

fn read_value(vertex: &str, unit: &Arc<FlowUnit>, row: &str) -> RcaResult<f64> {
    let value = unit
        .payload()
        .lookup(MEM_TYPE_COLUMN, row, MAX_COLUMN)
        .ok_or_else(|| RcaError::evaluation(vertex, format!("missing {row} row")))?;

    value.as_f64().ok_or_else(|| {
        RcaError::evaluation(vertex, format!("non-numeric {row} value: {value:?}"))
    })
}

fn elapsed_secs(samples: &[(Timestamp, f64)]) -> Option<f64> {
    let (first, last) = (samples.first()?.0, samples.last()?.0);
    let elapsed = (last - first) as f64 / 1000.0;
    (elapsed > 0.0).then_some(elapsed)
}

impl Analysis for HighHeapUsageYoungGenRca {
    fn name(&self) -> &'static str {
        "high_heap_usage_young_gen"
    }

    fn min_observations(&self, conf: &RcaConf) -> usize {
        YoungGenThresholds::from_conf(conf).min_samples
    }

    fn evaluate(&mut self, ctx: &EvalContext<'_>) -> RcaResult<Verdict> {
        let thresholds = YoungGenThresholds::from_conf(ctx.conf);
        let Some(rates) = self.rates(ctx.vertex, ctx.inputs)? else {
            return Ok(Verdict::Empty);
        };

        let payload = Payload::new([
            "promotion_rate_mb_per_sec",
            "young_gc_time_ms_per_sec",
            "promotion_rate_threshold",
            "young_gc_time_threshold",
        ])
        .with_row([
            Value::from(rates.promotion_rate_mb_per_sec),
            Value::from(rates.young_gc_time_ms_per_sec),
            Value::from(thresholds.promotion_rate_mb_per_sec),
            Value::from(thresholds.young_gc_time_ms_per_sec),
        ]);

        if rates.promotion_rate_mb_per_sec > thresholds.promotion_rate_mb_per_sec
            && rates.young_gc_time_ms_per_sec > thresholds.young_gc_time_ms_per_sec
        {
            Ok(Verdict::Unhealthy(ResourceType::HeapYoungGen, payload))
        } else {
            Ok(Verdict::Healthy(ResourceType::HeapYoungGen, payload))
        }
    }
}

/// Heap usage sample in the shape the rule reads
pub fn heap_payload(old_gen_bytes: f64) -> Payload {
    Payload::new([MEM_TYPE_COLUMN, MAX_COLUMN])
        .with_row([Value::from(OLD_GEN_ROW), Value::from(old_gen_bytes)])
}

/// Young GC time sample in the shape the rule reads
pub fn gc_payload(young_gc_ms: f64) -> Payload {
    Payload::new([MEM_TYPE_COLUMN, MAX_COLUMN])
        .with_row([Value::from(YOUNG_GC_ROW), Value::from(young_gc_ms)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{Outcome, Vertex};
    use std::time::Duration;

    const HEAP: &str = "heap";
    const GC: &str = "gc";

    fn young_gen_vertex() -> Vertex {
        Vertex::new(
            "young_gen",
            Box::new(HighHeapUsageYoungGenRca::new(HEAP, GC)),
            vec![HEAP.to_string(), GC.to_string()],
            Duration::from_secs(1),
            DEFAULT_WINDOW_SIZE,
        )
    }

    fn feed(v: &mut Vertex, secs: i64, heap_mb: f64, gc_ms: f64) {
        let ts = secs * 1000;
        v.consume(HEAP, Arc::new(FlowUnit::metric(ts, heap_payload(heap_mb * BYTES_PER_MB))));
        v.consume(GC, Arc::new(FlowUnit::metric(ts, gc_payload(gc_ms))));
    }

    fn run_scenario() -> Vec<Outcome> {
        let conf = RcaConf::default();
        let mut v = young_gen_vertex();
        [(0, 0.0, 0.0), (1, 450.0, 200.0), (2, 1050.0, 400.0), (3, 1550.0, 650.0)]
            .into_iter()
            .map(|(t, heap, gc)| {
                feed(&mut v, t, heap, gc);
                v.operate(t * 1000, &conf).outcome
            })
            .collect()
    }

    #[test]
    fn test_young_gen_scenario() {
        assert_eq!(
            run_scenario(),
            vec![
                Outcome::Insufficient,
                Outcome::Healthy,
                Outcome::Healthy,
                Outcome::Unhealthy
            ]
        );
    }

    #[test]
    fn test_identical_inputs_identical_verdicts() {
        assert_eq!(run_scenario(), run_scenario());
    }

    #[test]
    fn test_unhealthy_payload_carries_rates() {
        let conf = RcaConf::default();
        let mut v = young_gen_vertex();
        for (t, heap, gc) in [(0, 0.0, 0.0), (1, 450.0, 200.0), (2, 1050.0, 400.0), (3, 1550.0, 650.0)] {
            feed(&mut v, t, heap, gc);
        }

        let emission = v.operate(3000, &conf);
        let ctx = emission.unit.resource_context().unwrap();
        assert_eq!(ctx.resource_type, ResourceType::HeapYoungGen);

        let payload = emission.unit.payload();
        let promotion = payload.rows[0][0].as_f64().unwrap();
        let gc = payload.rows[0][1].as_f64().unwrap();
        assert!((promotion - 1550.0 / 3.0).abs() < 1e-9);
        assert!((gc - 1250.0 / 3.0).abs() < 1e-9);
        assert_eq!(payload.rows[0][2].as_f64(), Some(DEFAULT_PROMOTION_RATE_MB_PER_SEC));
    }

    #[test]
    fn test_only_one_condition_is_healthy() {
        let conf = RcaConf::default();
        let mut v = young_gen_vertex();
        // Fast promotion, negligible GC time
        feed(&mut v, 0, 0.0, 0.0);
        feed(&mut v, 1, 5000.0, 1.0);
        assert_eq!(v.operate(1000, &conf).outcome, Outcome::Healthy);
    }

    #[test]
    fn test_zero_elapsed_is_empty() {
        let conf = RcaConf::default();
        let mut v = young_gen_vertex();
        feed(&mut v, 7, 100.0, 10.0);
        feed(&mut v, 7, 9000.0, 9000.0);
        assert_eq!(v.operate(7000, &conf).outcome, Outcome::Insufficient);
    }

    #[test]
    fn test_missing_row_is_evaluation_failure() {
        let conf = RcaConf::default();
        let mut v = young_gen_vertex();
        feed(&mut v, 0, 0.0, 0.0);
        v.consume(HEAP, Arc::new(FlowUnit::metric(1000, gc_payload(1.0))));
        v.consume(GC, Arc::new(FlowUnit::metric(1000, gc_payload(1.0))));

        let emission = v.operate(1000, &conf);
        assert_eq!(emission.outcome, Outcome::Failed);
        assert!(emission.unit.is_empty());
    }

    #[test]
    fn test_non_numeric_value_is_evaluation_failure() {
        let inputs_vertex = {
            let mut v = young_gen_vertex();
            feed(&mut v, 0, 0.0, 0.0);
            let bad = Payload::new([MEM_TYPE_COLUMN, MAX_COLUMN]).with_row([OLD_GEN_ROW, "lots"]);
            v.consume(HEAP, Arc::new(FlowUnit::metric(1000, bad)));
            v.consume(GC, Arc::new(FlowUnit::metric(1000, gc_payload(1.0))));
            v
        };

        let rca = HighHeapUsageYoungGenRca::new(HEAP, GC);
        let err = rca.rates("young_gen", inputs_vertex.inputs()).unwrap_err();
        assert!(matches!(err, RcaError::Evaluation { .. }));
    }

    #[test]
    fn test_thresholds_from_conf() {
        let conf = RcaConf::from_json_str(
            r#"{"high-heap-usage-young-gen-rca": {
                "promotion-rate-threshold-mb-per-sec": "100",
                "young-gc-time-threshold-ms-per-sec": 50,
                "window-size": 8,
                "min-samples": 3
            }}"#,
        )
        .unwrap();

        let thresholds = YoungGenThresholds::from_conf(&conf);
        assert_eq!(thresholds.promotion_rate_mb_per_sec, 100.0);
        assert_eq!(thresholds.young_gc_time_ms_per_sec, 50.0);
        assert_eq!(thresholds.window_size, 8);
        assert_eq!(thresholds.min_samples, 3);
    }

    #[test]
    fn test_lower_thresholds_flip_verdict() {
        let conf = RcaConf::from_json_str(
            r#"{"high-heap-usage-young-gen-rca": {
                "promotion-rate-threshold-mb-per-sec": 100,
                "young-gc-time-threshold-ms-per-sec": 100
            }}"#,
        )
        .unwrap();
        let mut v = young_gen_vertex();
        feed(&mut v, 0, 0.0, 0.0);
        feed(&mut v, 1, 450.0, 200.0);
        assert_eq!(v.operate(1000, &conf).outcome, Outcome::Unhealthy);
    }
}
