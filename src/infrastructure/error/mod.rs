use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::redis::{CommandError, PoolError};

/// Failures surfaced by the session store operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The pool wait timeout elapsed with no idle connection
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Failed to connect to cluster: {0}")]
    ConnectFailed(String),

    /// The cluster client used up its retry budget
    #[error("Cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// Stored bytes were a reservation or could not be decoded
    #[error("Corrupt session {id}: {reason}")]
    CorruptSession { id: String, reason: String },

    /// A write or expire call failed
    #[error("Failed to persist session {id}: {reason}")]
    PersistFailed { id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<PoolError> for SessionError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted => SessionError::PoolExhausted,
            PoolError::ConnectFailed(msg) => SessionError::ConnectFailed(msg),
            PoolError::Closed => SessionError::Store("connection pool is closed".to_string()),
        }
    }
}

impl From<CommandError> for SessionError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Unavailable(msg) => SessionError::ClusterUnavailable(msg),
            CommandError::Failed(msg) => SessionError::Store(msg),
        }
    }
}

impl SessionError {
    /// Wrap a failure of the write path for session `id`.
    pub(crate) fn persist(id: &str, err: impl std::fmt::Display) -> Self {
        SessionError::PersistFailed {
            id: id.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn corrupt(id: &str, reason: impl Into<String>) -> Self {
        SessionError::CorruptSession {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures raised while starting or stopping the session manager.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Without the request-completion hook sessions would never be persisted
    #[error("Unable to attach to the request completion hook: {0}")]
    HookUnavailable(String),

    #[error("Session manager already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Session(SessionError::PoolExhausted)
            | AppError::Session(SessionError::ClusterUnavailable(_))
            | AppError::Session(SessionError::ConnectFailed(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
            }
            AppError::Session(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SESSION_ERROR"),
        };

        let log_message = self.to_string();
        let client_message = match (&self, is_production()) {
            (AppError::Validation(_) | AppError::NotFound(_), _) | (_, false) => log_message.clone(),
            (_, true) => "Service temporarily unavailable".to_string(),
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}
