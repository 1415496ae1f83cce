//! Error response formatting
//!
//! Every failed request gets the same JSON body so clients can branch on
//! `error` without parsing messages.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    pub message: String,

    pub request_id: Option<String>,

    /// RFC 3339
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details: None,
            retryable: Some(error.is_retryable()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation_error(request_id: Option<String>, field: &str, message: &str) -> Self {
        Self {
            error: ErrorCode::ValidationError,
            message: format!("Validation failed for field '{}'", field),
            request_id,
            timestamp: Utc::now().to_rfc3339(),
            details: Some(serde_json::json!({
                "field": field,
                "error": message,
            })),
            retryable: Some(false),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppErrorKind, DomainError, ValidationError};

    #[test]
    fn error_response_carries_code_and_request_id() {
        let app_error = AppError::new(AppErrorKind::Domain(DomainError::NotFound {
            entity: "transaction",
            id: "T1".to_string(),
        }))
        .with_request_id("req_123");

        let body = ErrorResponse::from_app_error(&app_error);
        assert_eq!(body.error, ErrorCode::NotFound);
        assert_eq!(body.request_id.as_deref(), Some("req_123"));
        assert_eq!(body.retryable, Some(false));
    }

    #[test]
    fn validation_errors_render_as_bad_request() {
        let app_error = AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: "amount".to_string(),
        }));
        assert_eq!(app_error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn validation_helper_includes_field_details() {
        let body = ErrorResponse::validation_error(None, "amount", "must be positive");
        assert_eq!(body.error, ErrorCode::ValidationError);
        assert_eq!(
            body.details.as_ref().and_then(|d| d.get("field")),
            Some(&serde_json::json!("amount"))
        );
    }
}
