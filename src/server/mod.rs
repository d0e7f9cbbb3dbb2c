//! Host side of the session store: lifecycle, per-request middleware and
//! the HTTP application.

mod app;
mod lifecycle;
mod middleware;
mod state;

pub use app::create_app;
pub use lifecycle::{RequestHook, SessionManager};
pub use middleware::{session_middleware, SessionHandle, SESSION_HEADER};
pub use state::AppState;
