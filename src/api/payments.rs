//! Payment endpoints driven by the billing flow: open a payment for an
//! existing transaction, poll it, cancel it, refund it.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::database::models::Transaction;
use crate::error::{AppError, AppErrorKind, AppResult, ValidationError};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::{PaymentOutcome, PaymentState, ProviderName, VirtualAccount};

#[derive(Debug, Default, Deserialize)]
pub struct CreatePaymentBody {
    pub provider: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    pub transaction_id: Uuid,
    pub status: PaymentState,
    pub provider_reference: Option<String>,
    pub payment_url: Option<String>,
    pub virtual_account: Option<VirtualAccount>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CreatePaymentResponse {
    fn from_outcome(transaction_id: Uuid, outcome: PaymentOutcome) -> Self {
        Self {
            transaction_id,
            status: outcome.status,
            provider_reference: outcome.provider_reference,
            payment_url: outcome.payment_url,
            virtual_account: outcome.virtual_account,
            expires_at: outcome.expires_at,
        }
    }
}

/// POST /payments/{transaction_id}
pub async fn create_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<CreatePaymentResponse>> {
    let request_id = get_request_id_from_headers(&headers);
    let transaction_id = parse_transaction_id(&transaction_id)?;
    let body: CreatePaymentBody = parse_optional_body(&body)?;
    let provider = body
        .provider
        .as_deref()
        .map(ProviderName::from_str)
        .transpose()
        .map_err(AppError::from)?;

    info!(
        transaction_id = %transaction_id,
        provider = ?provider,
        request_id = ?request_id,
        "Payment creation requested"
    );

    let outcome = state
        .orchestrator
        .create_payment_for_transaction(transaction_id, provider)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id))?;

    Ok(Json(CreatePaymentResponse::from_outcome(
        transaction_id,
        outcome,
    )))
}

/// GET /payments/{transaction_id}/status
pub async fn payment_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Transaction>> {
    let request_id = get_request_id_from_headers(&headers);
    let transaction_id = parse_transaction_id(&transaction_id)?;
    let transaction = state
        .orchestrator
        .check_payment_status(transaction_id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id))?;
    Ok(Json(transaction))
}

/// POST /payments/{transaction_id}/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Transaction>> {
    let request_id = get_request_id_from_headers(&headers);
    let transaction_id = parse_transaction_id(&transaction_id)?;
    let transaction = state
        .orchestrator
        .cancel_payment(transaction_id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id))?;
    Ok(Json(transaction))
}

/// POST /payments/{transaction_id}/refund
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Transaction>> {
    let request_id = get_request_id_from_headers(&headers);
    let transaction_id = parse_transaction_id(&transaction_id)?;
    let body: RefundBody = parse_optional_body(&body)?;
    let transaction = state
        .orchestrator
        .refund_payment(transaction_id, body.amount, body.reason)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id))?;
    Ok(Json(transaction))
}

fn parse_transaction_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        AppError::new(AppErrorKind::Validation(ValidationError::InvalidValue {
            field: "transaction_id".to_string(),
            reason: e.to_string(),
        }))
    })
}

/// Empty bodies fall back to defaults so callers may POST without JSON.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> AppResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        AppError::new(AppErrorKind::Validation(ValidationError::InvalidValue {
            field: "body".to_string(),
            reason: e.to_string(),
        }))
    })
}

fn attach(error: AppError, request_id: &Option<String>) -> AppError {
    match request_id {
        Some(id) => error.with_request_id(id.clone()),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_uses_defaults() {
        let body: RefundBody = parse_optional_body(b"").expect("empty body");
        assert!(body.amount.is_none());
        let body: RefundBody =
            parse_optional_body(br#"{"amount": 5000, "reason": "duplicate"}"#).expect("json");
        assert_eq!(body.amount, Some(5000));
        assert_eq!(body.reason.as_deref(), Some("duplicate"));
    }

    #[test]
    fn bad_transaction_id_is_a_validation_error() {
        let err = parse_transaction_id("T1").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
