use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced by the repositories, the decision engine and the HTTP API.
///
/// Store failures inside the play-log retry loop never reach this type; they
/// are absorbed by `history::record_play_safe`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A queue operation referenced an entry owned by another client.
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            EngineError::OwnershipViolation(msg) => {
                (StatusCode::FORBIDDEN, "OWNERSHIP_VIOLATION", msg.clone())
            }
            EngineError::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", msg.clone())
            }
            EngineError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            EngineError::Store(e) => {
                tracing::error!(error = %e, "store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            EngineError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}
