//! Core error type for the Durow engine.
//!
//! `EngineError` is used throughout the core domain (stores, orchestrator,
//! scheduler, sandbox). When the `axum` feature is enabled, it also
//! implements `IntoResponse` so it can be used directly as an axum handler
//! error type.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Idempotent schedule create was re-issued with a differing definition.
    #[error("Schedule '{0}' already exists with a different definition")]
    ScheduleConflict(String),

    /// A non-terminal run with the same (workflow, dedupe key) already
    /// exists. Carries the existing run id so callers can adopt it.
    #[error("A run with this dedupe key is already active: {0}")]
    AlreadyActive(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Capability token expired")]
    Expired,

    #[error("Internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            EngineError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            EngineError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            EngineError::ScheduleConflict(_) => (StatusCode::CONFLICT, self.to_string()),
            EngineError::AlreadyActive(_) => (StatusCode::CONFLICT, self.to_string()),
            EngineError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            EngineError::Expired => (StatusCode::UNAUTHORIZED, self.to_string()),
            EngineError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
