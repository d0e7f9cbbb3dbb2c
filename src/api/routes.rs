use axum::{
    middleware::from_fn_with_state,
    routing::{get, put},
    Router,
};

use crate::redis::ConnectionFactory;
use crate::server::{session_middleware, AppState};

use super::health::health;
use super::metrics::prometheus_metrics;
use super::session::{get_session, invalidate_session, set_attribute};

pub fn api_routes<F: ConnectionFactory>(state: AppState<F>) -> Router<AppState<F>> {
    // Only session routes go through the after-request hook
    let session_routes = Router::new()
        .route("/session", get(get_session::<F>).delete(invalidate_session::<F>))
        .route("/session/attributes/{name}", put(set_attribute::<F>))
        .route_layer(from_fn_with_state(state, session_middleware::<F>));

    Router::new()
        // Health & Metrics
        .route("/health", get(health::<F>))
        .route("/metrics", get(prometheus_metrics::<F>))
        .merge(session_routes)
}
