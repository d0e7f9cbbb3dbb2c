//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CORRUPT_SESSIONS_TOTAL, PERSIST_FAILURES_TOTAL, POOL_ACQUIRED_TOTAL, POOL_CREATED_TOTAL,
    POOL_DESTROYED_TOTAL, POOL_EXHAUSTED_TOTAL, POOL_IDLE, SAVES_SKIPPED_TOTAL,
    SAVES_WRITTEN_TOTAL, SESSIONS_CREATED_TOTAL, SESSIONS_LOADED_TOTAL, SESSIONS_REMOVED_TOTAL,
    TTL_REFRESHES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording session store metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn record_created() {
        SESSIONS_CREATED_TOTAL.inc();
    }

    pub fn record_loaded() {
        SESSIONS_LOADED_TOTAL.inc();
    }

    pub fn record_written() {
        SAVES_WRITTEN_TOTAL.inc();
    }

    pub fn record_skipped() {
        SAVES_SKIPPED_TOTAL.inc();
    }

    pub fn record_ttl_refresh() {
        TTL_REFRESHES_TOTAL.inc();
    }

    pub fn record_removed() {
        SESSIONS_REMOVED_TOTAL.inc();
    }

    pub fn record_persist_failure() {
        PERSIST_FAILURES_TOTAL.inc();
    }

    pub fn record_corrupt() {
        CORRUPT_SESSIONS_TOTAL.inc();
    }
}

/// Helper struct for recording connection pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    pub fn record_acquired() {
        POOL_ACQUIRED_TOTAL.inc();
    }

    pub fn record_exhausted() {
        POOL_EXHAUSTED_TOTAL.inc();
    }

    pub fn record_created() {
        POOL_CREATED_TOTAL.inc();
    }

    pub fn record_destroyed() {
        POOL_DESTROYED_TOTAL.inc();
    }

    /// Gauge of the most recently observed idle set size
    pub fn set_idle(count: usize) {
        POOL_IDLE.set(count as i64);
    }
}
