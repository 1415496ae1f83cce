use crate::database::repository::BillingRepository;
use crate::payments::types::PaymentState;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often the worker wakes up to ask providers about open payments.
    pub poll_interval: Duration,
    /// Maximum number of `processing` transactions checked per cycle.
    pub batch_size: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            std::env::var("PAYMENT_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.batch_size = std::env::var("PAYMENT_POLL_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

/// Counts from a single poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub advanced: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Catches payments whose webhook never arrived by polling the provider.
///
/// Status changes go through the same guarded update as webhooks, so a poll
/// racing a webhook still settles the transaction exactly once.
pub struct PaymentStatusPoller {
    repository: Arc<dyn BillingRepository>,
    orchestrator: Arc<PaymentOrchestrator>,
    config: PollerConfig,
}

impl PaymentStatusPoller {
    pub fn new(
        repository: Arc<dyn BillingRepository>,
        orchestrator: Arc<PaymentOrchestrator>,
        config: PollerConfig,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "payment status poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment status poller stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.poll_once().await {
                        Ok(summary) if summary.checked > 0 => info!(
                            checked = summary.checked,
                            advanced = summary.advanced,
                            failed = summary.failed,
                            "payment status poll cycle finished"
                        ),
                        Ok(_) => debug!("no open payments to poll"),
                        Err(e) => warn!(error = %e, "payment status poll cycle failed"),
                    }
                }
            }
        }

        info!("payment status poller stopped");
    }

    /// One pass over open payments. A failing transaction is logged and
    /// skipped; only a failure to list the batch aborts the cycle.
    pub async fn poll_once(&self) -> anyhow::Result<PollSummary> {
        let open = self
            .repository
            .list_transactions_by_status(PaymentState::Processing, self.config.batch_size)
            .await?;

        let mut summary = PollSummary::default();
        for transaction in open {
            if transaction.external_id.is_none() {
                continue;
            }
            summary.checked += 1;

            match self.orchestrator.check_payment_status(transaction.id).await {
                Ok(updated) if updated.status != transaction.status => {
                    summary.advanced += 1;
                    info!(
                        transaction_id = %updated.id,
                        from = %transaction.status,
                        to = %updated.status,
                        "poll advanced payment status"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        transaction_id = %transaction.id,
                        provider = ?transaction.provider,
                        error = %e,
                        "payment status poll failed"
                    );
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryBillingRepository;
    use crate::database::models::{Transaction, TransactionType};
    use crate::payments::error::{PaymentError, PaymentResult};
    use crate::payments::provider::PaymentProvider;
    use crate::payments::registry::AdapterRegistry;
    use crate::payments::types::{PaymentOutcome, PaymentRequest, ProviderName, WebhookEvent};
    use crate::services::payment_orchestrator::OrchestratorConfig;
    use async_trait::async_trait;
    use uuid::Uuid;

    /// Reports every reference as settled except `"MTX-DOWN"`, which errors.
    struct SettledProvider;

    #[async_trait]
    impl PaymentProvider for SettledProvider {
        async fn create_payment(&self, _request: PaymentRequest) -> PaymentResult<PaymentOutcome> {
            unimplemented!("not used by the poller")
        }

        async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
            if provider_reference == "MTX-DOWN" {
                return Err(PaymentError::NetworkError {
                    message: "connection reset".to_string(),
                });
            }
            let mut outcome =
                PaymentOutcome::new(PaymentState::Completed, serde_json::json!({"ok": true}));
            outcome.provider_reference = Some(provider_reference.to_string());
            Ok(outcome)
        }

        async fn cancel_transaction(&self, _reference: &str) -> PaymentResult<PaymentOutcome> {
            unimplemented!("not used by the poller")
        }

        async fn refund_transaction(
            &self,
            _reference: &str,
            _amount: Option<i64>,
            _reason: Option<&str>,
        ) -> PaymentResult<PaymentOutcome> {
            unimplemented!("not used by the poller")
        }

        fn name(&self) -> ProviderName {
            ProviderName::Midtrans
        }

        fn verify_webhook(&self, _payload: &[u8], _signature: &str) -> bool {
            false
        }

        fn parse_webhook(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            unimplemented!("not used by the poller")
        }
    }

    fn processing(external_id: Option<&str>) -> Transaction {
        let mut tx = Transaction::new_pending(
            Uuid::new_v4(),
            TransactionType::OneTime,
            150_000,
            "IDR",
            "Top-up",
        );
        tx.status = PaymentState::Processing;
        tx.provider = Some("midtrans".to_string());
        tx.external_id = external_id.map(str::to_string);
        tx
    }

    async fn poller_with(
        transactions: Vec<Transaction>,
    ) -> (PaymentStatusPoller, Arc<InMemoryBillingRepository>) {
        let repo = Arc::new(InMemoryBillingRepository::new());
        for tx in transactions {
            repo.insert_transaction(tx).await;
        }
        let adapter: Arc<dyn PaymentProvider> = Arc::new(SettledProvider);
        let registry = AdapterRegistry::with_providers(vec![adapter]).expect("registry");
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            repo.clone(),
            Arc::new(registry),
            OrchestratorConfig::default(),
        ));
        let poller = PaymentStatusPoller::new(repo.clone(), orchestrator, PollerConfig::default());
        (poller, repo)
    }

    #[tokio::test]
    async fn poll_settles_processing_payments() {
        let tx = processing(Some("MTX-1"));
        let id = tx.id;
        let (poller, repo) = poller_with(vec![tx]).await;

        let summary = poller.poll_once().await.expect("poll");
        assert_eq!(
            summary,
            PollSummary {
                checked: 1,
                advanced: 1,
                failed: 0
            }
        );

        let stored = repo.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentState::Completed);
        assert!(stored.paid_at.is_some());
        assert_eq!(repo.invoices().await.len(), 1);

        // Settled payments drop out of the next cycle.
        let summary = poller.poll_once().await.expect("second poll");
        assert_eq!(summary.checked, 0);
    }

    #[tokio::test]
    async fn provider_errors_are_counted_and_skipped() {
        let broken = processing(Some("MTX-DOWN"));
        let unsent = processing(None);
        let healthy = processing(Some("MTX-2"));
        let broken_id = broken.id;
        let (poller, repo) = poller_with(vec![broken, unsent, healthy]).await;

        let summary = poller.poll_once().await.expect("poll");
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.advanced, 1);
        assert_eq!(summary.failed, 1);

        let stored = repo.get_transaction(broken_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentState::Processing);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (poller, _repo) = poller_with(vec![]).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(rx));
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller stopped")
            .expect("join");
    }
}
