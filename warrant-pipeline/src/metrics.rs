//! Prometheus Metrics Definitions
//!
//! Registered once into the default registry. Recording helpers are no-ops
//! if registration failed (e.g. a name clash with another registry user),
//! so metrics never fail pipeline work.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};
use warrant_core::{ConfigError, WarrantResult};

/// Lock wait buckets (seconds), up to the default acquire deadline.
const LOCK_WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 15.0, 60.0, 180.0,
];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<WarrantResult<PipelineMetrics>> = Lazy::new(PipelineMetrics::new);

/// Container for all pipeline metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Change events written - labels: kind (publish, members, grants, refresh)
    pub events_published_total: CounterVec,

    /// Batches created by transfer
    pub batches_created_total: Counter,

    /// Batch deliveries - labels: outcome
    pub batches_handled_total: CounterVec,

    /// Per-pair recomputes - labels: result (persisted, deleted)
    pub recompute_total: CounterVec,

    /// Time spent acquiring per-pair locks
    pub lock_wait_seconds: Histogram,

    /// Cache invalidations - labels: result (ok, error)
    pub cache_invalidations_total: CounterVec,
}

fn register_err(name: &str, e: prometheus::Error) -> ConfigError {
    ConfigError::InvalidValue {
        field: name.to_string(),
        value: "metric registration".to_string(),
        reason: e.to_string(),
    }
}

impl PipelineMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> WarrantResult<Self> {
        Ok(Self {
            events_published_total: register_counter_vec!(
                "warrant_events_published_total",
                "Total change events written",
                &["kind"]
            )
            .map_err(|e| register_err("warrant_events_published_total", e))?,

            batches_created_total: register_counter!(
                "warrant_batches_created_total",
                "Total batches created by transfer"
            )
            .map_err(|e| register_err("warrant_batches_created_total", e))?,

            batches_handled_total: register_counter_vec!(
                "warrant_batches_handled_total",
                "Total batch deliveries by outcome",
                &["outcome"]
            )
            .map_err(|e| register_err("warrant_batches_handled_total", e))?,

            recompute_total: register_counter_vec!(
                "warrant_recompute_total",
                "Total subject-action recomputes by result",
                &["result"]
            )
            .map_err(|e| register_err("warrant_recompute_total", e))?,

            lock_wait_seconds: register_histogram!(
                "warrant_lock_wait_seconds",
                "Time spent acquiring subject-action locks",
                LOCK_WAIT_BUCKETS.to_vec()
            )
            .map_err(|e| register_err("warrant_lock_wait_seconds", e))?,

            cache_invalidations_total: register_counter_vec!(
                "warrant_cache_invalidations_total",
                "Total cache invalidations by result",
                &["result"]
            )
            .map_err(|e| register_err("warrant_cache_invalidations_total", e))?,
        })
    }
}

pub fn record_events_published(kind: &str, count: usize) {
    if let Ok(m) = METRICS.as_ref() {
        m.events_published_total
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }
}

pub fn record_batches_created(count: usize) {
    if let Ok(m) = METRICS.as_ref() {
        m.batches_created_total.inc_by(count as f64);
    }
}

pub fn record_batch_handled(outcome: &str) {
    if let Ok(m) = METRICS.as_ref() {
        m.batches_handled_total.with_label_values(&[outcome]).inc();
    }
}

pub fn record_recompute(result: &str) {
    if let Ok(m) = METRICS.as_ref() {
        m.recompute_total.with_label_values(&[result]).inc();
    }
}

pub fn record_lock_wait(seconds: f64) {
    if let Ok(m) = METRICS.as_ref() {
        m.lock_wait_seconds.observe(seconds);
    }
}

pub fn record_cache_invalidation(success: bool) {
    if let Ok(m) = METRICS.as_ref() {
        let result = if success { "ok" } else { "error" };
        m.cache_invalidations_total.with_label_values(&[result]).inc();
    }
}

/// Render the default registry in Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once_and_render() {
        assert!(METRICS.is_ok());
        record_batches_created(2);
        record_batch_handled("completed");
        let text = gather_text();
        assert!(text.contains("warrant_batches_created_total"));
        assert!(text.contains("warrant_batches_handled_total"));
    }

    #[test]
    fn test_render_includes_cache_invalidations() {
        record_cache_invalidation(false);
        let text = gather_text();
        assert!(text.contains("warrant_cache_invalidations_total"));
        assert!(text.contains("result=\"error\""));
    }
}
