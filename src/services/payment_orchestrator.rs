//! Payment Orchestrator Service
//!
//! Drives transactions through the canonical status machine. Every status
//! write is a compare-and-update against the status that was read, so
//! polling, webhook delivery and webhook redelivery can race freely: exactly
//! one writer wins each transition and only the winner of the move into
//! `completed` runs the billing effects.

use crate::database::error::DatabaseError;
use crate::database::models::{RefundDetails, Transaction, TransactionPatch};
use crate::database::repository::BillingRepository;
use crate::error::{
    AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError, ValidationError,
};
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentProvider;
use crate::payments::registry::AdapterRegistry;
use crate::payments::types::{
    CustomerContact, Money, PaymentMethod, PaymentOutcome, PaymentRequest, PaymentState,
    ProviderName,
};
use crate::services::billing_effects::BillingEffects;
use crate::services::invoice_numbering::{InvoiceNumbering, DEFAULT_MAX_ATTEMPTS};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on every adapter call
    pub adapter_timeout: Duration,
    /// Attempts at claiming an invoice number before giving up
    pub invoice_max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(20),
            invoice_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            adapter_timeout: std::env::var("PAYMENT_ADAPTER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter_timeout),
            invoice_max_attempts: std::env::var("INVOICE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.invoice_max_attempts),
        }
    }
}

// ============================================================================
// Errors & Outcomes
// ============================================================================

#[derive(Debug)]
pub enum OrchestratorError {
    NotFound { entity: &'static str, id: String },
    GatewayError { provider: String, message: String },
    InvalidWebhookSignature { provider: String },
    OrphanWebhook {
        provider: String,
        external_id: Option<String>,
        internal_id: Option<String>,
    },
    InvalidTransition { from: PaymentState, to: PaymentState },
    SequenceConflict { prefix: String, attempts: u32 },
    MissingExternalId { transaction_id: Uuid },
    InvalidRefundAmount { requested: i64, available: i64 },
    ProviderNotConfigured { provider: String },
    Repository(DatabaseError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            Self::GatewayError { provider, message } => {
                write!(f, "Payment gateway {} failed: {}", provider, message)
            }
            Self::InvalidWebhookSignature { provider } => {
                write!(f, "Invalid webhook signature from {}", provider)
            }
            Self::OrphanWebhook {
                provider,
                external_id,
                internal_id,
            } => write!(
                f,
                "No transaction matches {} webhook (external: {:?}, internal: {:?})",
                provider, external_id, internal_id
            ),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition from {} to {}", from, to)
            }
            Self::SequenceConflict { prefix, attempts } => write!(
                f,
                "Could not allocate invoice number under {} after {} attempts",
                prefix, attempts
            ),
            Self::MissingExternalId { transaction_id } => write!(
                f,
                "Transaction {} has no provider reference yet",
                transaction_id
            ),
            Self::InvalidRefundAmount {
                requested,
                available,
            } => write!(
                f,
                "Refund amount {} must be between 1 and {}",
                requested, available
            ),
            Self::ProviderNotConfigured { provider } => {
                write!(f, "Payment provider {} is not configured", provider)
            }
            Self::Repository(e) => write!(f, "Repository error: {}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<DatabaseError> for OrchestratorError {
    fn from(err: DatabaseError) -> Self {
        OrchestratorError::Repository(err)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::NotFound { entity, id } => {
                AppErrorKind::Domain(DomainError::NotFound { entity, id })
            }
            OrchestratorError::GatewayError { provider, message } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider,
                    message,
                    is_retryable: true,
                })
            }
            OrchestratorError::InvalidWebhookSignature { provider } => {
                AppErrorKind::Domain(DomainError::InvalidSignature { provider })
            }
            OrchestratorError::OrphanWebhook { provider, .. } => {
                AppErrorKind::Domain(DomainError::NotFound {
                    entity: "transaction",
                    id: format!("{} webhook reference", provider),
                })
            }
            OrchestratorError::InvalidTransition { from, to } => {
                AppErrorKind::Domain(DomainError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            OrchestratorError::MissingExternalId { transaction_id } => {
                AppErrorKind::Domain(DomainError::PaymentNotStarted {
                    transaction_id: transaction_id.to_string(),
                })
            }
            OrchestratorError::InvalidRefundAmount {
                requested,
                available,
            } => AppErrorKind::Validation(ValidationError::OutOfRange {
                field: "amount".to_string(),
                min: Some("1".to_string()),
                max: Some(available.to_string()),
                value: requested.to_string(),
            }),
            OrchestratorError::ProviderNotConfigured { provider } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: format!("payment provider {} is not configured", provider),
                })
            }
            err @ OrchestratorError::SequenceConflict { .. } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: err.to_string(),
                    is_retryable: true,
                })
            }
            OrchestratorError::Repository(e) => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: e.to_string(),
                    is_retryable: e.is_retryable(),
                })
            }
        };
        AppError::new(kind)
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Result of one pass through the completion protocol.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// This call moved the transaction; `first_completion` is true only for
    /// the write that took it into `completed`.
    Applied {
        transaction: Transaction,
        first_completion: bool,
    },
    /// Already in the incoming terminal status.
    Unchanged(Transaction),
    /// Incoming status carries no new information (`pending`, or a repeat of
    /// a non-terminal status).
    Ignored(Transaction),
    /// Another writer changed the row between our read and our write.
    LostRace,
}

/// What happened to an inbound webhook. Only repository failures escape as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { transaction_id: Uuid, status: PaymentState },
    Duplicate { transaction_id: Uuid },
    Ignored { transaction_id: Uuid },
    InvalidSignature,
    Orphan,
    Rejected { from: PaymentState, to: PaymentState },
    Malformed { reason: String },
    UnknownProvider { provider: String },
}

impl WebhookOutcome {
    /// Whether the provider should consider the delivery handled.
    pub fn acknowledged(&self) -> bool {
        matches!(
            self,
            WebhookOutcome::Applied { .. }
                | WebhookOutcome::Duplicate { .. }
                | WebhookOutcome::Ignored { .. }
        )
    }
}

/// A provider-reported status change, however it reached us.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: PaymentState,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Refunded amount as the provider reports it; `None` means the full amount.
    pub refund_amount: Option<i64>,
    pub refund_reason: Option<String>,
    pub raw: JsonValue,
}

impl StatusUpdate {
    pub fn new(status: PaymentState, raw: JsonValue) -> Self {
        Self {
            status,
            paid_at: None,
            failure_reason: None,
            refund_amount: None,
            refund_reason: None,
            raw,
        }
    }
}

impl From<&PaymentOutcome> for StatusUpdate {
    fn from(outcome: &PaymentOutcome) -> Self {
        Self {
            status: outcome.status,
            paid_at: outcome.paid_at,
            failure_reason: outcome.failure_reason.clone(),
            refund_amount: outcome.refund_amount,
            refund_reason: outcome.refund_reason.clone(),
            raw: outcome.raw.clone(),
        }
    }
}

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

/// Upper bound on read-retry loops after a lost compare-and-update.
const MAX_TRANSITION_HOPS: usize = 4;

pub struct PaymentOrchestrator {
    repository: Arc<dyn BillingRepository>,
    registry: Arc<AdapterRegistry>,
    effects: BillingEffects,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        repository: Arc<dyn BillingRepository>,
        registry: Arc<AdapterRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let numbering = InvoiceNumbering::new(repository.clone(), config.invoice_max_attempts);
        let effects = BillingEffects::new(repository.clone(), numbering);
        Self {
            repository,
            registry,
            effects,
            config,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Money-moving operations
    // ------------------------------------------------------------------------

    /// Opens a payment at the provider for a `pending` transaction.
    ///
    /// On adapter failure the stored transaction is untouched, so retrying is safe.
    pub async fn create_payment_for_transaction(
        &self,
        transaction_id: Uuid,
        provider: Option<ProviderName>,
    ) -> OrchestratorResult<PaymentOutcome> {
        let transaction = self.load_transaction(transaction_id).await?;
        if transaction.status != PaymentState::Pending {
            return Err(OrchestratorError::InvalidTransition {
                from: transaction.status,
                to: PaymentState::Processing,
            });
        }

        let adapter = self.resolve_for_create(&transaction, provider)?;
        let provider_name = adapter.name();
        let request = build_payment_request(&transaction);

        info!(
            transaction_id = %transaction.id,
            provider = %provider_name,
            amount = transaction.amount,
            currency = %transaction.currency,
            "creating payment"
        );

        let outcome = self
            .call_adapter(&provider_name, adapter.create_payment(request))
            .await?;

        let patch = TransactionPatch {
            status: Some(PaymentState::Processing),
            provider: Some(provider_name.to_string()),
            external_id: outcome.provider_reference.clone(),
            payment_url: outcome.payment_url.clone(),
            expires_at: outcome.expires_at,
            gateway_response: Some(outcome.raw.clone()),
            ..Default::default()
        };

        let updated = self
            .repository
            .update_transaction_if_status(transaction.id, PaymentState::Pending, patch)
            .await?;

        let Some(updated) = updated else {
            warn!(
                transaction_id = %transaction.id,
                provider = %provider_name,
                provider_reference = ?outcome.provider_reference,
                "transaction changed while payment was being created"
            );
            return Ok(outcome);
        };

        info!(
            transaction_id = %updated.id,
            provider = %provider_name,
            provider_reference = ?updated.external_id,
            "payment created, transaction processing"
        );

        // Some methods settle synchronously (e.g. card charges).
        if outcome.status.is_terminal() {
            self.apply_status_update(updated, StatusUpdate::from(&outcome))
                .await?;
        }

        Ok(outcome)
    }

    /// Polls the provider and applies whatever it reports.
    pub async fn check_payment_status(&self, transaction_id: Uuid) -> OrchestratorResult<Transaction> {
        let transaction = self.load_transaction(transaction_id).await?;
        let external_id = require_external_id(&transaction)?;
        let adapter = self.resolve_recorded(&transaction)?;
        let provider_name = adapter.name();

        let outcome = self
            .call_adapter(&provider_name, adapter.get_status(&external_id))
            .await?;

        if outcome.status == PaymentState::Pending {
            return Ok(transaction);
        }

        match self
            .apply_status_update(transaction, StatusUpdate::from(&outcome))
            .await?
        {
            TransitionOutcome::Applied { transaction, .. }
            | TransitionOutcome::Unchanged(transaction)
            | TransitionOutcome::Ignored(transaction) => Ok(transaction),
            TransitionOutcome::LostRace => self.load_transaction(transaction_id).await,
        }
    }

    pub async fn cancel_payment(&self, transaction_id: Uuid) -> OrchestratorResult<Transaction> {
        let transaction = self.load_transaction(transaction_id).await?;
        if !transaction.status.can_transition_to(PaymentState::Cancelled) {
            error!(
                transaction_id = %transaction.id,
                from = %transaction.status,
                to = %PaymentState::Cancelled,
                "rejected cancellation of settled transaction"
            );
            return Err(OrchestratorError::InvalidTransition {
                from: transaction.status,
                to: PaymentState::Cancelled,
            });
        }
        let external_id = require_external_id(&transaction)?;
        let adapter = self.resolve_recorded(&transaction)?;
        let provider_name = adapter.name();

        let outcome = self
            .call_adapter(&provider_name, adapter.cancel_transaction(&external_id))
            .await?;

        let patch = TransactionPatch {
            failure_reason: outcome.failure_reason.clone(),
            ..TransactionPatch::status(PaymentState::Cancelled)
        }
        .with_gateway_response(outcome.raw.clone());

        self.finish_manual_transition(transaction, PaymentState::Cancelled, patch)
            .await
    }

    /// Full refund when `amount` is `None`.
    ///
    /// Only a refund the provider reports as settled moves the transaction to
    /// `refunded`. An accepted but unsettled refund leaves it `completed` with
    /// the provider response recorded; the provider's refund notification
    /// finishes the transition.
    pub async fn refund_payment(
        &self,
        transaction_id: Uuid,
        amount: Option<i64>,
        reason: Option<String>,
    ) -> OrchestratorResult<Transaction> {
        let transaction = self.load_transaction(transaction_id).await?;
        if transaction.status != PaymentState::Completed {
            error!(
                transaction_id = %transaction.id,
                from = %transaction.status,
                to = %PaymentState::Refunded,
                "rejected refund of uncompleted transaction"
            );
            return Err(OrchestratorError::InvalidTransition {
                from: transaction.status,
                to: PaymentState::Refunded,
            });
        }
        if let Some(requested) = amount {
            if requested <= 0 || requested > transaction.amount {
                return Err(OrchestratorError::InvalidRefundAmount {
                    requested,
                    available: transaction.amount,
                });
            }
        }
        let external_id = require_external_id(&transaction)?;
        let adapter = self.resolve_recorded(&transaction)?;
        let provider_name = adapter.name();

        let outcome = self
            .call_adapter(
                &provider_name,
                adapter.refund_transaction(&external_id, amount, reason.as_deref()),
            )
            .await?;

        match outcome.status {
            PaymentState::Refunded => {}
            PaymentState::Failed => {
                return Err(OrchestratorError::GatewayError {
                    provider: provider_name.to_string(),
                    message: outcome
                        .failure_reason
                        .unwrap_or_else(|| "refund failed".to_string()),
                });
            }
            other => {
                info!(
                    transaction_id = %transaction.id,
                    provider = %provider_name,
                    provider_status = %other,
                    "refund accepted by provider, awaiting settlement"
                );
                return self.record_gateway_response(transaction, outcome.raw).await;
            }
        }

        let patch = TransactionPatch {
            refund: Some(RefundDetails {
                amount: outcome
                    .refund_amount
                    .or(amount)
                    .unwrap_or(transaction.amount),
                reason: outcome.refund_reason.or(reason),
                refunded_at: Utc::now(),
            }),
            ..TransactionPatch::status(PaymentState::Refunded)
        }
        .with_gateway_response(outcome.raw);

        self.finish_manual_transition(transaction, PaymentState::Refunded, patch)
            .await
    }

    /// Stores a provider response without touching the status. A concurrent
    /// status change wins; the fresh row is returned instead.
    async fn record_gateway_response(
        &self,
        transaction: Transaction,
        raw: JsonValue,
    ) -> OrchestratorResult<Transaction> {
        let patch = TransactionPatch::default().with_gateway_response(raw);
        match self
            .repository
            .update_transaction_if_status(transaction.id, transaction.status, patch)
            .await?
        {
            Some(updated) => Ok(updated),
            None => self.load_transaction(transaction.id).await,
        }
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Verifies, parses and applies one webhook delivery.
    ///
    /// Signature, lookup and transition problems come back as outcomes so the
    /// HTTP layer can pick a status code; a provider that sees an error tends
    /// to redeliver forever.
    pub async fn process_webhook(
        &self,
        provider: &str,
        raw: &[u8],
        signature: &str,
    ) -> OrchestratorResult<WebhookOutcome> {
        let adapter = match self.registry.get_by_name(provider) {
            Ok(adapter) => adapter,
            Err(_) => {
                warn!(provider = %provider, "webhook for unconfigured provider");
                return Ok(WebhookOutcome::UnknownProvider {
                    provider: provider.to_string(),
                });
            }
        };

        if !adapter.verify_webhook(raw, signature) {
            warn!(
                security_event = true,
                provider = %provider,
                payload_bytes = raw.len(),
                "webhook signature verification failed, payload discarded"
            );
            return Ok(WebhookOutcome::InvalidSignature);
        }

        let event = match adapter.parse_webhook(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(provider = %provider, error = %e, "malformed webhook payload");
                return Ok(WebhookOutcome::Malformed {
                    reason: e.to_string(),
                });
            }
        };

        let found = self
            .repository
            .find_transaction_by_external_or_internal_id(
                event.provider_reference.as_deref(),
                event.transaction_reference.as_deref(),
            )
            .await?;

        let Some(transaction) = found else {
            warn!(
                provider = %provider,
                provider_reference = ?event.provider_reference,
                transaction_reference = ?event.transaction_reference,
                provider_status = %event.provider_status,
                "orphan webhook, no matching transaction"
            );
            return Ok(WebhookOutcome::Orphan);
        };

        if let Some(amount) = &event.amount {
            if amount.amount != transaction.amount {
                warn!(
                    transaction_id = %transaction.id,
                    expected = transaction.amount,
                    reported = amount.amount,
                    anomaly = "amount_mismatch",
                    "webhook amount differs from transaction amount"
                );
            }
        }

        let transaction_id = transaction.id;
        let update = StatusUpdate {
            status: event.status,
            paid_at: event.paid_at,
            failure_reason: event.failure_reason.clone(),
            refund_amount: event.refund_amount,
            refund_reason: event.refund_reason.clone(),
            raw: event.payload.clone(),
        };

        match self.apply_status_update(transaction, update).await {
            Ok(TransitionOutcome::Applied { transaction, .. }) => Ok(WebhookOutcome::Applied {
                transaction_id,
                status: transaction.status,
            }),
            Ok(TransitionOutcome::Unchanged(_)) | Ok(TransitionOutcome::LostRace) => {
                Ok(WebhookOutcome::Duplicate { transaction_id })
            }
            Ok(TransitionOutcome::Ignored(_)) => Ok(WebhookOutcome::Ignored { transaction_id }),
            Err(OrchestratorError::InvalidTransition { from, to }) => {
                Ok(WebhookOutcome::Rejected { from, to })
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Completion protocol
    // ------------------------------------------------------------------------

    /// Moves `transaction` toward `update.status` using compare-and-update.
    ///
    /// `pending → completed` is walked as two hops through `processing`.
    /// A lost write re-reads the row and re-plans; if the other writer already
    /// reached the target the call reports `LostRace` and runs no effects.
    pub async fn apply_status_update(
        &self,
        mut transaction: Transaction,
        update: StatusUpdate,
    ) -> OrchestratorResult<TransitionOutcome> {
        let target = update.status;

        for _ in 0..MAX_TRANSITION_HOPS {
            let current = transaction.status;

            if target == PaymentState::Pending {
                return Ok(TransitionOutcome::Ignored(transaction));
            }
            if current == target {
                if target.is_terminal() {
                    if target == PaymentState::Completed && transaction.invoice_id.is_none() {
                        self.effects.ensure_invoice(&transaction, Utc::now()).await;
                    }
                    return Ok(TransitionOutcome::Unchanged(transaction));
                }
                return Ok(TransitionOutcome::Ignored(transaction));
            }

            let hop = if current.can_transition_to(target) {
                target
            } else if current == PaymentState::Pending
                && PaymentState::Processing.can_transition_to(target)
            {
                PaymentState::Processing
            } else {
                error!(
                    transaction_id = %transaction.id,
                    from = %current,
                    to = %target,
                    "invalid status transition rejected"
                );
                return Err(OrchestratorError::InvalidTransition {
                    from: current,
                    to: target,
                });
            };

            let mut patch = TransactionPatch::status(hop).with_gateway_response(update.raw.clone());
            if hop == PaymentState::Completed {
                patch.paid_at = Some(update.paid_at.unwrap_or_else(Utc::now));
            }
            if matches!(hop, PaymentState::Failed | PaymentState::Cancelled) {
                patch.failure_reason = update.failure_reason.clone();
            }
            if hop == PaymentState::Refunded {
                patch.refund = Some(RefundDetails {
                    amount: update.refund_amount.unwrap_or(transaction.amount),
                    reason: update.refund_reason.clone(),
                    refunded_at: Utc::now(),
                });
            }

            match self
                .repository
                .update_transaction_if_status(transaction.id, current, patch)
                .await?
            {
                Some(updated) => {
                    info!(
                        transaction_id = %updated.id,
                        from = %current,
                        to = %hop,
                        "transaction status updated"
                    );
                    if hop != target {
                        transaction = updated;
                        continue;
                    }

                    let first_completion = hop == PaymentState::Completed;
                    if first_completion {
                        self.effects.on_first_completion(&updated, Utc::now()).await;
                    }
                    return Ok(TransitionOutcome::Applied {
                        transaction: updated,
                        first_completion,
                    });
                }
                None => {
                    let reread = self.load_transaction(transaction.id).await?;
                    info!(
                        transaction_id = %reread.id,
                        expected = %current,
                        found = %reread.status,
                        "lost status update race"
                    );
                    if reread.status == target {
                        return Ok(TransitionOutcome::LostRace);
                    }
                    transaction = reread;
                }
            }
        }

        Ok(TransitionOutcome::LostRace)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn load_transaction(&self, id: Uuid) -> OrchestratorResult<Transaction> {
        self.repository
            .get_transaction(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "transaction",
                id: id.to_string(),
            })
    }

    /// Cancel and refund: single hop, no effects.
    async fn finish_manual_transition(
        &self,
        transaction: Transaction,
        target: PaymentState,
        patch: TransactionPatch,
    ) -> OrchestratorResult<Transaction> {
        match self
            .repository
            .update_transaction_if_status(transaction.id, transaction.status, patch)
            .await?
        {
            Some(updated) => {
                info!(
                    transaction_id = %updated.id,
                    from = %transaction.status,
                    to = %target,
                    "transaction status updated"
                );
                Ok(updated)
            }
            None => {
                let reread = self.load_transaction(transaction.id).await?;
                if reread.status == target {
                    return Ok(reread);
                }
                error!(
                    transaction_id = %reread.id,
                    from = %reread.status,
                    to = %target,
                    "provider accepted the request but the transaction moved underneath it"
                );
                Err(OrchestratorError::InvalidTransition {
                    from: reread.status,
                    to: target,
                })
            }
        }
    }

    fn resolve_for_create(
        &self,
        transaction: &Transaction,
        requested: Option<ProviderName>,
    ) -> OrchestratorResult<Arc<dyn PaymentProvider>> {
        if let Some(recorded) = transaction.provider.as_deref() {
            return self.lookup(recorded);
        }
        match requested {
            Some(name) => self.lookup(name.as_str()),
            None => self
                .registry
                .default_provider()
                .map_err(|_| OrchestratorError::ProviderNotConfigured {
                    provider: "default".to_string(),
                }),
        }
    }

    fn resolve_recorded(
        &self,
        transaction: &Transaction,
    ) -> OrchestratorResult<Arc<dyn PaymentProvider>> {
        let recorded = transaction.provider.as_deref().ok_or_else(|| {
            OrchestratorError::ProviderNotConfigured {
                provider: "unrecorded".to_string(),
            }
        })?;
        self.lookup(recorded)
    }

    fn lookup(&self, provider: &str) -> OrchestratorResult<Arc<dyn PaymentProvider>> {
        self.registry
            .get_by_name(provider)
            .map_err(|_| OrchestratorError::ProviderNotConfigured {
                provider: provider.to_string(),
            })
    }

    async fn call_adapter<T>(
        &self,
        provider: &ProviderName,
        call: impl Future<Output = Result<T, PaymentError>>,
    ) -> OrchestratorResult<T> {
        match tokio::time::timeout(self.config.adapter_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(provider = %provider, error = %e, "payment gateway call failed");
                Err(gateway_error(provider, e))
            }
            Err(_) => {
                warn!(
                    provider = %provider,
                    timeout_secs = self.config.adapter_timeout.as_secs(),
                    "payment gateway call timed out"
                );
                Err(OrchestratorError::GatewayError {
                    provider: provider.to_string(),
                    message: format!(
                        "timed out after {}s",
                        self.config.adapter_timeout.as_secs()
                    ),
                })
            }
        }
    }
}

fn gateway_error(provider: &ProviderName, err: PaymentError) -> OrchestratorError {
    OrchestratorError::GatewayError {
        provider: provider.to_string(),
        message: err.to_string(),
    }
}

fn require_external_id(transaction: &Transaction) -> OrchestratorResult<String> {
    transaction
        .external_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or(OrchestratorError::MissingExternalId {
            transaction_id: transaction.id,
        })
}

fn build_payment_request(transaction: &Transaction) -> PaymentRequest {
    let mut metadata = match &transaction.metadata {
        JsonValue::Object(map) => map.clone(),
        _ => Default::default(),
    };
    metadata.insert(
        "transaction_type".to_string(),
        JsonValue::String(transaction.transaction_type.as_str().to_string()),
    );
    if let Some(subscription_id) = transaction.subscription_id {
        metadata.insert(
            "subscription_id".to_string(),
            JsonValue::String(subscription_id.to_string()),
        );
    }

    PaymentRequest {
        transaction_reference: transaction.id.to_string(),
        amount: Money::new(transaction.amount, transaction.currency.clone()),
        description: transaction.description.clone(),
        customer: CustomerContact {
            name: transaction.customer_name.clone(),
            email: transaction.customer_email.clone(),
            phone: transaction.customer_phone.clone(),
        },
        payment_method: PaymentMethod::from_tag(&transaction.payment_method),
        metadata: Some(JsonValue::Object(metadata)),
    }
}
