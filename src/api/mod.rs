pub mod payments;
pub mod webhooks;

use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::services::payment_orchestrator::PaymentOrchestrator;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub health_checker: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhooks::handle_webhook))
        .route("/payments/{transaction_id}", post(payments::create_payment))
        .route(
            "/payments/{transaction_id}/status",
            get(payments::payment_status),
        )
        .route(
            "/payments/{transaction_id}/cancel",
            post(payments::cancel_payment),
        )
        .route(
            "/payments/{transaction_id}/refund",
            post(payments::refund_payment),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let status = state.health_checker.check_health().await;
    if status.status == HealthState::Unhealthy {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)))
    } else {
        Ok(Json(status))
    }
}
