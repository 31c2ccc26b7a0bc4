//! Prometheus metrics for session analytics
//!
//! Counters are process-wide; per-session numbers live in `SessionCounters`
//! and are published with each session snapshot.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Samples or events rejected before reaching a window
pub static INVALID_SAMPLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "collab_invalid_samples_total",
        "Samples and raw events dropped as invalid",
        &["source", "kind"],
        REGISTRY.clone()
    )
    .expect("Failed to register INVALID_SAMPLES")
});

/// Raw events displaced from a full ingest queue
pub static INGEST_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "collab_ingest_dropped_total",
        "Raw events dropped because a session ingest queue was full",
        &["kind"],
        REGISTRY.clone()
    )
    .expect("Failed to register INGEST_DROPPED")
});

/// Degraded network samples emitted because telemetry stopped arriving
pub static TELEMETRY_GAPS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        "collab_telemetry_gaps_total",
        "Degraded network samples emitted during telemetry gaps",
        REGISTRY.clone()
    )
    .expect("Failed to register TELEMETRY_GAPS")
});

/// Quality tier transitions
pub static TIER_CHANGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "collab_tier_changes_total",
        "Quality tier transitions",
        &["from", "to", "reason"],
        REGISTRY.clone()
    )
    .expect("Failed to register TIER_CHANGES")
});

/// Full subscriber channels
pub static SUBSCRIBER_BACKPRESSURE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "collab_subscriber_backpressure_total",
        "Deliveries that hit a full subscriber channel",
        &["stream"],
        REGISTRY.clone()
    )
    .expect("Failed to register SUBSCRIBER_BACKPRESSURE")
});

/// Subscribers dropped after exhausting directive retries
pub static STALE_SUBSCRIBERS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        "collab_stale_subscribers_total",
        "Subscribers removed after directive delivery kept timing out",
        REGISTRY.clone()
    )
    .expect("Failed to register STALE_SUBSCRIBERS")
});

/// Sessions currently running
pub static ACTIVE_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "collab_active_sessions",
        "Sessions currently owned by the coordinator",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_SESSIONS")
});

/// Wall time of one evaluation cycle
pub static EVALUATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram_with_registry!(
        "collab_evaluation_duration_seconds",
        "Duration of one quality/engagement evaluation cycle",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
        REGISTRY.clone()
    )
    .expect("Failed to register EVALUATION_DURATION")
});

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}
