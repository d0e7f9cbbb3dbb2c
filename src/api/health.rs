//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::redis::{ConnectionFactory, PoolStats};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct StoreHealthResponse {
    pub serializer: String,
    pub max_inactive_interval_seconds: i64,
    pub pool: PoolStats,
}

pub async fn health<F: ConnectionFactory>(State(state): State<AppState<F>>) -> Json<HealthResponse> {
    let store = state.hook.store().map(|store| StoreHealthResponse {
        serializer: store.serializer_name().to_string(),
        max_inactive_interval_seconds: store.max_inactive_interval(),
        pool: store.pool().stats(),
    });

    let status = match &store {
        Some(store) if store.pool.leased >= store.pool.max_total => "saturated",
        Some(_) => "healthy",
        None => "stopped",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store,
    })
}
