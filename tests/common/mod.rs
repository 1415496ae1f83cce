#![allow(dead_code)]

use async_trait::async_trait;
use billing_gateway::database::models::{
    BillingCycle, Package, Subscription, SubscriptionStatus, Transaction, TransactionType,
};
use billing_gateway::database::InMemoryBillingRepository;
use billing_gateway::payments::error::{PaymentError, PaymentResult};
use billing_gateway::payments::provider::PaymentProvider;
use billing_gateway::payments::registry::AdapterRegistry;
use billing_gateway::payments::types::{
    Money, PaymentOutcome, PaymentRequest, PaymentState, ProviderName, WebhookEvent,
};
use billing_gateway::services::{OrchestratorConfig, PaymentOrchestrator};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const FAKE_SIGNATURE: &str = "fake-valid-signature";

/// Provider double whose answers are set by the test.
///
/// Webhooks are JSON `{"id", "order_id", "status", "amount"}` where `status`
/// is a canonical status name; anything else maps to pending. Refund
/// notifications may add `refund_amount` and `reason`.
pub struct FakeProvider {
    status: Mutex<PaymentState>,
    refund_status: Mutex<PaymentState>,
    fail_calls: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(PaymentState::Pending),
            refund_status: Mutex::new(PaymentState::Refunded),
            fail_calls: AtomicBool::new(false),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, status: PaymentState) {
        *self.status.lock().unwrap() = status;
    }

    /// Status reported by `refund_transaction`; `Processing` models a refund
    /// the provider accepted but has not settled.
    pub fn set_refund_status(&self, status: PaymentState) {
        *self.refund_status.lock().unwrap() = status;
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self) -> PaymentResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(PaymentError::ProviderError {
                provider: "midtrans".to_string(),
                message: "HTTP 500: upstream unavailable".to_string(),
                provider_code: Some("500".to_string()),
                retryable: true,
            });
        }
        Ok(())
    }

    fn outcome(status: PaymentState, reference: &str) -> PaymentOutcome {
        let mut outcome = PaymentOutcome::new(
            status,
            json!({ "id": reference, "status": status.as_str() }),
        );
        outcome.provider_reference = Some(reference.to_string());
        outcome
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentOutcome> {
        self.enter().await?;
        let reference = format!("FAKE-{}", request.transaction_reference);
        let mut outcome = Self::outcome(PaymentState::Pending, &reference);
        outcome.transaction_reference = Some(request.transaction_reference);
        outcome.payment_url = Some(format!("https://pay.example.test/{}", reference));
        outcome.expires_at = Some(Utc::now() + chrono::Duration::hours(24));
        outcome.amount = Some(request.amount);
        Ok(outcome)
    }

    async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        self.enter().await?;
        let status = *self.status.lock().unwrap();
        Ok(Self::outcome(status, provider_reference))
    }

    async fn cancel_transaction(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        self.enter().await?;
        Ok(Self::outcome(PaymentState::Cancelled, provider_reference))
    }

    async fn refund_transaction(
        &self,
        provider_reference: &str,
        _amount: Option<i64>,
        _reason: Option<&str>,
    ) -> PaymentResult<PaymentOutcome> {
        self.enter().await?;
        let status = *self.refund_status.lock().unwrap();
        Ok(Self::outcome(status, provider_reference))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Midtrans
    }

    fn verify_webhook(&self, _payload: &[u8], signature: &str) -> bool {
        signature == FAKE_SIGNATURE
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookPayloadError {
                message: e.to_string(),
            })?;
        let provider_status = parsed["status"].as_str().unwrap_or_default().to_string();
        Ok(WebhookEvent {
            provider: ProviderName::Midtrans,
            provider_reference: parsed["id"].as_str().map(str::to_string),
            transaction_reference: parsed["order_id"].as_str().map(str::to_string),
            status: PaymentState::from_str(&provider_status).unwrap_or(PaymentState::Pending),
            provider_status,
            amount: parsed["amount"].as_i64().map(|a| Money::new(a, "IDR")),
            payment_method: None,
            paid_at: None,
            failure_reason: None,
            refund_amount: parsed["refund_amount"].as_i64(),
            refund_reason: parsed["reason"].as_str().map(str::to_string),
            payload: parsed,
            received_at: Utc::now(),
        })
    }
}

pub fn fake_webhook(order_id: Uuid, reference: &str, status: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": reference,
        "order_id": order_id.to_string(),
        "status": status,
        "amount": amount,
    }))
    .unwrap()
}

pub struct Harness {
    pub repo: Arc<InMemoryBillingRepository>,
    pub provider: Arc<FakeProvider>,
    pub orchestrator: Arc<PaymentOrchestrator>,
}

pub fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let repo = Arc::new(InMemoryBillingRepository::new());
    let provider = Arc::new(FakeProvider::new());
    let adapter: Arc<dyn PaymentProvider> = provider.clone();
    let registry = AdapterRegistry::with_providers(vec![adapter]).unwrap();
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        repo.clone(),
        Arc::new(registry),
        config,
    ));
    Harness {
        repo,
        provider,
        orchestrator,
    }
}

/// Package, subscription and a pending transaction of `transaction_type`.
pub async fn seed_subscription_payment(
    repo: &InMemoryBillingRepository,
    cycle: BillingCycle,
    transaction_type: TransactionType,
    subscription_status: SubscriptionStatus,
) -> (Package, Subscription, Transaction) {
    let user_id = Uuid::new_v4();
    let package = Package {
        id: Uuid::new_v4(),
        name: "Pro".to_string(),
        price: 990_000,
        currency: "IDR".to_string(),
        billing_cycle: cycle,
    };
    let mut subscription = Subscription::new_inactive(user_id, package.id);
    subscription.status = subscription_status;

    let mut transaction = Transaction::new_pending(
        user_id,
        transaction_type,
        990_000,
        "IDR",
        "Pro plan",
    );
    transaction.subscription_id = Some(subscription.id);

    repo.insert_package(package.clone()).await;
    repo.insert_subscription(subscription.clone()).await;
    repo.insert_transaction(transaction.clone()).await;
    (package, subscription, transaction)
}

/// A transaction already handed to the fake provider under `external_id`.
pub async fn seed_processing(
    repo: &InMemoryBillingRepository,
    external_id: &str,
) -> Transaction {
    let mut transaction = Transaction::new_pending(
        Uuid::new_v4(),
        TransactionType::OneTime,
        150_000,
        "IDR",
        "Top-up",
    );
    transaction.status = PaymentState::Processing;
    transaction.provider = Some("midtrans".to_string());
    transaction.external_id = Some(external_id.to_string());
    repo.insert_transaction(transaction.clone()).await;
    transaction
}
