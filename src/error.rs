use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// AppError
///
/// The error taxonomy surfaced by every handler. Each variant maps to exactly one
/// HTTP status; `Internal` never echoes its detail to the client.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("missing permission {0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    /// A write referenced a role or permission row that does not exist.
    #[error("{0}")]
    ReferentialIntegrity(String),

    #[error("{0}")]
    NotFound(String),

    /// A catalog mutation would orphan edges or children, or reuse a code.
    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ReferentialIntegrity(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for the "field is required" validation failure.
    pub fn missing_field(field: &str) -> Self {
        AppError::Validation(format!("{field} is required"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            // Lost a race against a concurrent writer after the up-front checks passed.
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                tracing::warn!("unique constraint rejected write: {}", db.message());
                AppError::Conflict(match db.constraint() {
                    Some(constraint) => format!("duplicate value violates {constraint}"),
                    None => "duplicate value".to_string(),
                })
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                tracing::warn!("foreign key rejected write: {}", db.message());
                AppError::ReferentialIntegrity("referenced row does not exist".to_string())
            }
            _ => {
                tracing::error!("storage error: {:?}", e);
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(detail) => {
                // Logged here, never returned to the caller.
                tracing::error!("request failed: {}", detail);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}
