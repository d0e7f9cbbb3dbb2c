//! Demo session endpoints. The session id travels in `X-Session-Id`.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;

use crate::error::{AppError, SessionError};
use crate::redis::ConnectionFactory;
use crate::server::{AppState, SessionHandle, SESSION_HEADER};
use crate::session::{RequestContext, Session, SessionStore};

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub is_new: bool,
    pub creation_time: i64,
    pub last_accessed_time: i64,
    pub max_inactive_interval: i64,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            is_new: session.is_new(),
            creation_time: session.creation_time(),
            last_accessed_time: session.last_accessed_time(),
            max_inactive_interval: session.max_inactive_interval(),
            attributes: session.attributes().clone(),
        }
    }
}

fn requested_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Load the session named by the request header into `ctx`.
async fn load<F: ConnectionFactory>(
    store: &SessionStore<F>,
    ctx: &mut RequestContext,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    let id = requested_id(headers)
        .ok_or_else(|| AppError::Validation(format!("missing {} header", SESSION_HEADER)))?;

    match store.find_session(ctx, id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) | Err(SessionError::CorruptSession { .. }) => {
            Err(AppError::NotFound(format!("Session {} not found", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /session - Find the caller's session or start a new one
pub async fn get_session<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Extension(handle): Extension<SessionHandle>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let store = state.store()?;
    let mut ctx = handle.lock().await;

    let found = match requested_id(&headers) {
        Some(id) => match store.find_session(&mut ctx, id).await {
            Ok(found) => found.is_some(),
            // Unreadable data is treated as no session
            Err(SessionError::CorruptSession { .. }) => false,
            Err(e) => return Err(e.into()),
        },
        None => false,
    };

    if !found && store.create_session(&mut ctx, None).await?.is_none() {
        return Err(AppError::Internal("no session id could be reserved".to_string()));
    }

    let session = ctx
        .session()
        .ok_or_else(|| AppError::Internal("session missing from request context".to_string()))?;
    let body = SessionResponse::from(session);

    let mut response = Json(body).into_response();
    if let Ok(v) = HeaderValue::from_str(session.id()) {
        response.headers_mut().insert(SESSION_HEADER, v);
    }
    Ok(response)
}

/// PUT /session/attributes/{name} - Set one attribute from a JSON body
pub async fn set_attribute<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Extension(handle): Extension<SessionHandle>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(value): Json<serde_json::Value>,
) -> Result<StatusCode, AppError> {
    if name.is_empty() {
        return Err(AppError::Validation("attribute name must not be empty".to_string()));
    }

    let store = state.store()?;
    let mut ctx = handle.lock().await;
    load(&store, &mut ctx, &headers).await?;

    store.set_attribute(&mut ctx, &name, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /session - Invalidate the session; it is removed after the request
pub async fn invalidate_session<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Extension(handle): Extension<SessionHandle>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let store = state.store()?;
    let mut ctx = handle.lock().await;
    load(&store, &mut ctx, &headers).await?;

    if let Some(session) = ctx.session_mut() {
        session.invalidate();
    }
    Ok(StatusCode::NO_CONTENT)
}
