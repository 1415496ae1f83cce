use crate::payments::error::PaymentResult;
use crate::payments::types::{PaymentOutcome, PaymentRequest, ProviderName, WebhookEvent};
use async_trait::async_trait;

/// Capability every payment provider adapter offers.
///
/// Adapters never retry; a failed call comes back as `Err` and the caller decides.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentOutcome>;

    async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome>;

    async fn cancel_transaction(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome>;

    /// Full refund when `amount` is `None`.
    async fn refund_transaction(
        &self,
        provider_reference: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> PaymentResult<PaymentOutcome>;

    fn name(&self) -> ProviderName;

    /// `signature` is whatever the provider delivered out of band (usually a header);
    /// adapters that sign inside the body may ignore it when empty.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool;

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{CustomerContact, Money, PaymentMethod, PaymentState};

    struct MockProvider;

    #[async_trait]
    impl PaymentProvider for MockProvider {
        async fn create_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentOutcome> {
            let mut outcome = PaymentOutcome::new(PaymentState::Pending, serde_json::json!({}));
            outcome.provider_reference = Some("mock_ref".to_string());
            outcome.transaction_reference = Some(request.transaction_reference);
            outcome.payment_url = Some("https://example.com/pay".to_string());
            outcome.amount = Some(request.amount);
            Ok(outcome)
        }

        async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
            let mut outcome = PaymentOutcome::new(PaymentState::Completed, serde_json::json!({}));
            outcome.provider_reference = Some(provider_reference.to_string());
            Ok(outcome)
        }

        async fn cancel_transaction(
            &self,
            provider_reference: &str,
        ) -> PaymentResult<PaymentOutcome> {
            let mut outcome = PaymentOutcome::new(PaymentState::Cancelled, serde_json::json!({}));
            outcome.provider_reference = Some(provider_reference.to_string());
            Ok(outcome)
        }

        async fn refund_transaction(
            &self,
            provider_reference: &str,
            _amount: Option<i64>,
            _reason: Option<&str>,
        ) -> PaymentResult<PaymentOutcome> {
            let mut outcome = PaymentOutcome::new(PaymentState::Refunded, serde_json::json!({}));
            outcome.provider_reference = Some(provider_reference.to_string());
            Ok(outcome)
        }

        fn name(&self) -> ProviderName {
            ProviderName::Midtrans
        }

        fn verify_webhook(&self, _payload: &[u8], _signature: &str) -> bool {
            true
        }

        fn parse_webhook(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Ok(WebhookEvent {
                provider: ProviderName::Midtrans,
                provider_reference: None,
                transaction_reference: None,
                status: PaymentState::Pending,
                provider_status: "pending".to_string(),
                amount: None,
                payment_method: None,
                paid_at: None,
                failure_reason: None,
                refund_amount: None,
                refund_reason: None,
                payload: serde_json::json!({}),
                received_at: chrono::Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_provider() {
        let provider: Box<dyn PaymentProvider> = Box::new(MockProvider);
        let outcome = provider
            .create_payment(PaymentRequest {
                transaction_reference: "txn_1".to_string(),
                amount: Money::new(1000, "IDR"),
                description: "test".to_string(),
                customer: CustomerContact::default(),
                payment_method: PaymentMethod::Qris,
                metadata: None,
            })
            .await
            .expect("payment creation should succeed");
        assert_eq!(outcome.status, PaymentState::Pending);
        assert_eq!(outcome.provider_reference.as_deref(), Some("mock_ref"));

        let refunded = provider
            .refund_transaction("mock_ref", None, None)
            .await
            .expect("refund should succeed");
        assert_eq!(refunded.status, PaymentState::Refunded);
    }
}
