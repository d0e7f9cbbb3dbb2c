use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use crate::redis::ConnectionFactory;
use crate::session::{RequestContext, SessionStore};

use super::AppState;

/// Header carrying the session id in both directions.
pub const SESSION_HEADER: &str = "x-session-id";

/// The request's session context, shared with handlers as an extension.
#[derive(Clone, Default)]
pub struct SessionHandle(Arc<Mutex<RequestContext>>);

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RequestContext> {
        self.0.lock().await
    }

    /// Move the context out, leaving an empty one behind.
    pub async fn take(&self) -> RequestContext {
        std::mem::take(&mut *self.0.lock().await)
    }
}

/// Runs the after-request hook once, even if the request future is dropped
/// before completion.
struct Completion<F: ConnectionFactory> {
    store: Option<Arc<SessionStore<F>>>,
    handle: SessionHandle,
}

impl<F: ConnectionFactory> Completion<F> {
    async fn finish(mut self) {
        if let Some(store) = self.store.take() {
            store.after_request(self.handle.take().await).await;
        }
    }
}

impl<F: ConnectionFactory> Drop for Completion<F> {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let handle = self.handle.clone();
        tracing::debug!("Request aborted, finishing session in background");
        tokio::spawn(async move {
            store.after_request(handle.take().await).await;
        });
    }
}

/// Session middleware.
///
/// Gives each request a fresh [`RequestContext`] (as a [`SessionHandle`]
/// extension) and hands it to the store's after-request hook once the inner
/// service has produced a response, error responses included.
pub async fn session_middleware<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(store) = state.hook.store() else {
        tracing::error!("Session store is not running, rejecting request");
        let body = json!({
            "error": {
                "code": "STORE_UNAVAILABLE",
                "message": "Session store is not running"
            }
        });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    };

    let handle = SessionHandle::new();
    req.extensions_mut().insert(handle.clone());

    let completion = Completion {
        store: Some(store),
        handle,
    };
    let response = next.run(req).await;
    completion.finish().await;

    response
}
