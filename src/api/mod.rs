//! API layer - HTTP endpoint handlers organized by domain.

mod health;
mod metrics;
mod routes;
mod session;

// Re-export all handlers for use in server/app.rs
pub use health::{health, HealthResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use session::{get_session, invalidate_session, set_attribute, SessionResponse};
