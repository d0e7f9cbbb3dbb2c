//! Prometheus metrics for the session store.
//!
//! - Session metrics (created, loaded, written, skipped, removed, failures)
//! - Connection pool metrics (acquisitions, exhaustion, churn, idle size)

mod helpers;

pub use helpers::{encode_metrics, PoolMetrics, SessionMetrics};

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "session_store";

lazy_static! {
    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Sessions created with a reserved id
    pub static ref SESSIONS_CREATED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_created_total", METRIC_PREFIX),
        "Total sessions created"
    ).unwrap();

    /// Sessions loaded from the cluster (cache misses of the request context)
    pub static ref SESSIONS_LOADED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_loaded_total", METRIC_PREFIX),
        "Total sessions loaded from the cluster"
    ).unwrap();

    /// Saves that wrote the serialized session
    pub static ref SAVES_WRITTEN_TOTAL: IntCounter = register_int_counter!(
        format!("{}_saves_written_total", METRIC_PREFIX),
        "Total saves that wrote session data"
    ).unwrap();

    /// Saves skipped because nothing changed
    pub static ref SAVES_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_saves_skipped_total", METRIC_PREFIX),
        "Total saves skipped by dirty tracking"
    ).unwrap();

    /// TTL refreshes issued on save
    pub static ref TTL_REFRESHES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ttl_refreshes_total", METRIC_PREFIX),
        "Total session TTL refreshes"
    ).unwrap();

    /// Sessions removed
    pub static ref SESSIONS_REMOVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_removed_total", METRIC_PREFIX),
        "Total sessions removed"
    ).unwrap();

    /// Failed writes or TTL refreshes
    pub static ref PERSIST_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_persist_failures_total", METRIC_PREFIX),
        "Total failed session writes"
    ).unwrap();

    /// Loads rejected as corrupt
    pub static ref CORRUPT_SESSIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_corrupt_sessions_total", METRIC_PREFIX),
        "Total session loads rejected as corrupt"
    ).unwrap();

    // ============================================================================
    // Pool Metrics
    // ============================================================================

    /// Successful acquisitions
    pub static ref POOL_ACQUIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_acquired_total", METRIC_PREFIX),
        "Total connections leased from the pool"
    ).unwrap();

    /// Acquisitions that gave up on an exhausted pool
    pub static ref POOL_EXHAUSTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_exhausted_total", METRIC_PREFIX),
        "Total acquisitions failed on an exhausted pool"
    ).unwrap();

    pub static ref POOL_CREATED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_connections_created_total", METRIC_PREFIX),
        "Total cluster connections created"
    ).unwrap();

    pub static ref POOL_DESTROYED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_connections_destroyed_total", METRIC_PREFIX),
        "Total cluster connections destroyed"
    ).unwrap();

    /// Idle connections currently pooled
    pub static ref POOL_IDLE: IntGauge = register_int_gauge!(
        format!("{}_pool_idle_connections", METRIC_PREFIX),
        "Idle connections in the pool"
    ).unwrap();
}
