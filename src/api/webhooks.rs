use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info};

use crate::api::AppState;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::middleware::error::{get_request_id_from_headers, ErrorResponse};
use crate::services::payment_orchestrator::{OrchestratorError, WebhookOutcome};

/// Header each provider uses for its out-of-band signature. Midtrans signs
/// inside the body, so its header is optional.
fn signature_header(provider: &str) -> &'static str {
    match provider {
        "xendit" => "x-callback-token",
        _ => "x-signature",
    }
}

/// POST /webhooks/{provider}
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = provider.to_lowercase();
    let request_id = get_request_id_from_headers(&headers);
    info!(provider = %provider, bytes = body.len(), "Received webhook");

    let signature = headers
        .get(signature_header(&provider))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let outcome = match state
        .orchestrator
        .process_webhook(&provider, &body, signature)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(provider = %provider, error = %e, "Webhook processing failed");
            return with_request_id(AppError::from(e), request_id).into_response();
        }
    };

    match outcome {
        WebhookOutcome::Applied { status, .. } => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "transaction_status": status })),
        )
            .into_response(),
        WebhookOutcome::Duplicate { .. } => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response()
        }
        WebhookOutcome::Ignored { .. } => {
            (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response()
        }
        // Acknowledge so the provider stops redelivering; the anomaly is already logged.
        WebhookOutcome::Orphan => (
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": "orphan" })),
        )
            .into_response(),
        WebhookOutcome::Rejected { from, to } => (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "reason": "invalid_transition",
                "from": from,
                "to": to,
            })),
        )
            .into_response(),
        WebhookOutcome::InvalidSignature => with_request_id(
            AppError::from(OrchestratorError::InvalidWebhookSignature { provider }),
            request_id,
        )
        .into_response(),
        WebhookOutcome::Malformed { reason } => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::validation_error(request_id, "body", &reason)),
        )
            .into_response(),
        WebhookOutcome::UnknownProvider { provider } => with_request_id(
            AppError::new(AppErrorKind::Domain(DomainError::NotFound {
                entity: "payment provider",
                id: provider,
            })),
            request_id,
        )
        .into_response(),
    }
}

fn with_request_id(error: AppError, request_id: Option<String>) -> AppError {
    match request_id {
        Some(id) => error.with_request_id(id),
        None => error,
    }
}
