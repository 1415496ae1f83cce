//! Application error type shared by the HTTP layer
//!
//! Every service error converts into [`AppError`], which knows its HTTP
//! status, a stable machine-readable code and a message safe to show clients.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "INVALID_TRANSITION")]
    InvalidTransition,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "PAYMENT_NOT_STARTED")]
    PaymentNotStarted,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    NotFound { entity: &'static str, id: String },
    /// Status change not reachable from the current status
    InvalidTransition { from: String, to: String },
    InvalidSignature { provider: String },
    /// Operation needs a provider reference that doesn't exist yet
    PaymentNotStarted { transaction_id: String },
}

#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// Payment provider failures
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    Timeout { service: String, timeout_secs: u64 },
}

#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidValue { field: String, reason: String },
    MissingField { field: String },
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotFound { .. } => 404,
                DomainError::InvalidTransition { .. } => 409,
                DomainError::InvalidSignature { .. } => 401,
                DomainError::PaymentNotStarted { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotFound { .. } => ErrorCode::NotFound,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                DomainError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                DomainError::PaymentNotStarted { .. } => ErrorCode::PaymentNotStarted,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Message safe to return to API clients
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
                DomainError::InvalidTransition { from, to } => {
                    format!("Transaction cannot move from {} to {}", from, to)
                }
                DomainError::InvalidSignature { .. } => "Invalid webhook signature".to_string(),
                DomainError::PaymentNotStarted { transaction_id } => format!(
                    "No payment has been created for transaction '{}'",
                    transaction_id
                ),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidValue { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::OutOfRange {
                    field,
                    min,
                    max,
                    value,
                } => match (min, max) {
                    (Some(min), Some(max)) => format!(
                        "Field '{}' must be between {} and {} (got {})",
                        field, min, max, value
                    ),
                    (Some(min), None) => {
                        format!("Field '{}' must be at least {} (got {})", field, min, value)
                    }
                    (None, Some(max)) => {
                        format!("Field '{}' must be at most {} (got {})", field, max, value)
                    }
                    (None, None) => format!("Field '{}' is out of range", field),
                },
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) | AppErrorKind::Validation(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } | ExternalError::Timeout { .. } => true,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let message = err.to_string();
        let is_retryable = err.is_retryable();
        let kind = match err.kind {
            DatabaseErrorKind::NotFound { entity, id } => AppErrorKind::Domain(DomainError::NotFound {
                entity: match entity.as_str() {
                    "transaction" => "transaction",
                    "subscription" => "subscription",
                    "invoice" => "invoice",
                    _ => "record",
                },
                id,
            }),
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message,
                is_retryable,
            }),
        };
        AppError::new(kind)
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let kind = match err {
            PaymentError::ValidationError { message, field } => match field {
                Some(field) => AppErrorKind::Validation(ValidationError::InvalidValue {
                    field,
                    reason: message,
                }),
                None => AppErrorKind::Validation(ValidationError::InvalidValue {
                    field: "request".to_string(),
                    reason: message,
                }),
            },
            PaymentError::NotConfigured { provider } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: format!("payment provider {} is not configured", provider),
                })
            }
            PaymentError::Timeout { timeout_secs } => AppErrorKind::External(ExternalError::Timeout {
                service: "payment provider".to_string(),
                timeout_secs,
            }),
            PaymentError::RateLimitError { .. } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment provider".to_string(),
                retry_after: None,
            }),
            other => {
                let is_retryable = other.is_retryable();
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: match &other {
                        PaymentError::ProviderError { provider, .. } => provider.clone(),
                        _ => "unknown".to_string(),
                    },
                    message: other.to_string(),
                    is_retryable,
                })
            }
        };
        AppError::new(kind)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_is_a_conflict() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::InvalidTransition {
            from: "refunded".to_string(),
            to: "cancelled".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::InvalidTransition);
        assert!(error.user_message().contains("refunded"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn provider_timeout_maps_to_gateway_timeout() {
        let error = AppError::from(PaymentError::Timeout { timeout_secs: 20 });
        assert_eq!(error.status_code(), 504);
        assert_eq!(error.error_code(), ErrorCode::ExternalServiceTimeout);
        assert!(error.is_retryable());
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        let error = AppError::from(DatabaseError::not_found("transaction", "abc"));
        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code(), ErrorCode::NotFound);
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let json = serde_json::to_string(&ErrorCode::PaymentProviderError).unwrap();
        assert_eq!(json, "\"PAYMENT_PROVIDER_ERROR\"");
    }
}
