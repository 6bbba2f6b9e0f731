use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code, also used for bulk per-item errors.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Forbidden(_) => "forbidden",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized => "unauthorized",
            AppError::Database(_) | AppError::Internal(_) => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a caller. Storage faults never leak details.
    pub fn public_message(&self) -> String {
        match self {
            AppError::NotFound(m)
            | AppError::Conflict(m)
            | AppError::Forbidden(m)
            | AppError::InvalidInput(m) => m.clone(),
            AppError::Unauthorized => "invalid or missing admin key".to_string(),
            AppError::Database(_) | AppError::Internal(_) => "internal server error".to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        AppError::InvalidInput(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_type = match &self {
            AppError::NotFound(_) => "not_found_error",
            AppError::Conflict(_) => "conflict_error",
            AppError::Forbidden(_) => "permission_error",
            AppError::InvalidInput(_) => "invalid_request_error",
            AppError::Unauthorized => "authentication_error",
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "internal_error"
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "internal_error"
            }
        };

        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": error_type,
                "code": self.code(),
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<axum::extract::rejection::PathRejection> for AppError {
    fn from(rejection: axum::extract::rejection::PathRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AppError::not_found("token").code(), "not_found");
        assert_eq!(AppError::conflict("x").code(), "conflict");
        assert_eq!(AppError::forbidden("x").code(), "forbidden");
        assert_eq!(AppError::invalid("x").code(), "invalid_input");
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = AppError::Internal(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("10.0.0.3"));
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let resp = AppError::conflict("token already revoked").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
