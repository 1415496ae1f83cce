use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Provider not configured: {provider}")]
    NotConfigured { provider: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Provider call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError { message: String },

    #[error("Webhook payload rejected: {message}")]
    WebhookPayloadError { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn provider(provider: &str, message: impl Into<String>, code: Option<String>) -> Self {
        PaymentError::ProviderError {
            provider: provider.to_string(),
            message: message.into(),
            provider_code: code,
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NotConfigured { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::WebhookPayloadError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::NotConfigured { .. } => 503,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::Timeout { .. } => 504,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::WebhookPayloadError { .. } => 400,
            PaymentError::ProviderError { .. } => 502,
        }
    }
}
