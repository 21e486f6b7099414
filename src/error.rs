use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// One offending field in a validation failure.
///
/// Validation runs in a single pass and reports every violation, so callers
/// can fix all issues before resubmitting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>, kind: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            kind: kind.to_string(),
        }
    }
}

/// Error surface of the router HTTP API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Malformed input: every offending field is listed.
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    /// Missing or mismatched API key.
    #[error("Unauthorized")]
    Unauthorized,

    /// Anything that should surface as a 500 without leaking internals.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::Validation(errors)
    }

    /// Single-field validation shortcut.
    pub fn invalid_field(field: &str, message: impl Into<String>, kind: &str) -> Self {
        Self::Validation(vec![FieldError::new(field, message, kind)])
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<FieldError>,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let (status, message, errors) = match self {
            RouterError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, "Validation failed".to_string(), errors)
            }
            RouterError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), Vec::new())
            }
            RouterError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Vec::new(),
                )
            }
        };

        let body = ErrorBody {
            status: "error",
            message,
            errors,
        };

        (status, Json(body)).into_response()
    }
}
