//! One-time consequences of a transaction's first move into `completed`.
//!
//! Failures here are logged and swallowed: the money has moved, so the
//! completed status stays. A missing invoice is picked up again the next
//! time a completion signal arrives for the same transaction.

use crate::database::models::{
    BillingCycle, NewInvoice, Package, Subscription, SubscriptionPatch, SubscriptionStatus,
    Transaction, TransactionPatch, TransactionType,
};
use crate::database::repository::BillingRepository;
use crate::payments::types::PaymentState;
use crate::services::invoice_numbering::InvoiceNumbering;
use crate::services::payment_orchestrator::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct BillingEffects {
    repository: Arc<dyn BillingRepository>,
    numbering: InvoiceNumbering,
}

impl BillingEffects {
    pub fn new(repository: Arc<dyn BillingRepository>, numbering: InvoiceNumbering) -> Self {
        Self {
            repository,
            numbering,
        }
    }

    /// Runs every effect for a freshly completed transaction. Callers must
    /// only invoke this from the write that won the transition.
    pub async fn on_first_completion(&self, transaction: &Transaction, now: DateTime<Utc>) {
        let subscription_result = match transaction.transaction_type {
            TransactionType::Subscription => self.activate_subscription(transaction, now).await,
            TransactionType::Renewal => self.renew_subscription(transaction, now).await,
            TransactionType::OneTime | TransactionType::Refund => Ok(None),
        };

        if let Err(e) = subscription_result {
            error!(
                transaction_id = %transaction.id,
                subscription_id = ?transaction.subscription_id,
                error = %e,
                "subscription update after payment failed"
            );
        }

        self.ensure_invoice(transaction, now).await;
    }

    pub async fn activate_subscription(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<Subscription>> {
        let Some((subscription, package)) = self.load_subscription(transaction).await? else {
            return Ok(None);
        };

        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Active),
            start_date: subscription.start_date.or(Some(now)),
            end_date: package.map(|p| now + p.billing_cycle.period()),
            ..Default::default()
        };
        let updated = self
            .repository
            .update_subscription(subscription.id, patch)
            .await
            .map_err(OrchestratorError::Repository)?;

        info!(
            subscription_id = %updated.id,
            transaction_id = %transaction.id,
            end_date = ?updated.end_date,
            "subscription activated"
        );
        Ok(Some(updated))
    }

    pub async fn renew_subscription(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<Subscription>> {
        let Some((subscription, package)) = self.load_subscription(transaction).await? else {
            return Ok(None);
        };
        let Some(package) = package else {
            return Err(OrchestratorError::NotFound {
                entity: "package",
                id: subscription.package_id.to_string(),
            });
        };

        let next_billing_date = now + package.billing_cycle.period();
        let usage_reset_at = match package.billing_cycle {
            BillingCycle::Monthly => Some(next_billing_date),
            BillingCycle::Yearly => None,
        };
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Active),
            end_date: Some(next_billing_date),
            next_billing_date: Some(next_billing_date),
            renewal_attempts: Some(0),
            usage_reset_at,
            ..Default::default()
        };
        let updated = self
            .repository
            .update_subscription(subscription.id, patch)
            .await
            .map_err(OrchestratorError::Repository)?;

        info!(
            subscription_id = %updated.id,
            transaction_id = %transaction.id,
            billing_cycle = package.billing_cycle.as_str(),
            next_billing_date = %next_billing_date,
            "subscription renewed"
        );
        Ok(Some(updated))
    }

    /// Creates and links the invoice unless the transaction already has one.
    pub async fn ensure_invoice(&self, transaction: &Transaction, now: DateTime<Utc>) {
        if transaction.invoice_id.is_some() {
            return;
        }

        let invoice = match self
            .numbering
            .create_invoice(NewInvoice::from_transaction(transaction), now)
            .await
        {
            Ok(invoice) => invoice,
            Err(OrchestratorError::Repository(e)) if e.is_unique_violation() => {
                info!(
                    transaction_id = %transaction.id,
                    "invoice already exists for transaction"
                );
                return;
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "invoice creation failed"
                );
                return;
            }
        };

        self.link_invoice(transaction.id, invoice.id).await;
    }

    async fn link_invoice(&self, transaction_id: Uuid, invoice_id: Uuid) {
        let patch = TransactionPatch {
            invoice_id: Some(invoice_id),
            ..Default::default()
        };
        match self
            .repository
            .update_transaction_if_status(transaction_id, PaymentState::Completed, patch)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                transaction_id = %transaction_id,
                invoice_id = %invoice_id,
                "transaction left completed before invoice could be linked"
            ),
            Err(e) => error!(
                transaction_id = %transaction_id,
                invoice_id = %invoice_id,
                error = %e,
                "failed to link invoice to transaction"
            ),
        }
    }

    async fn load_subscription(
        &self,
        transaction: &Transaction,
    ) -> OrchestratorResult<Option<(Subscription, Option<Package>)>> {
        let Some(subscription_id) = transaction.subscription_id else {
            warn!(
                transaction_id = %transaction.id,
                transaction_type = transaction.transaction_type.as_str(),
                "transaction has no subscription to update"
            );
            return Ok(None);
        };

        let subscription = self
            .repository
            .get_subscription(subscription_id)
            .await
            .map_err(OrchestratorError::Repository)?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "subscription",
                id: subscription_id.to_string(),
            })?;
        let package = self
            .repository
            .get_package(subscription.package_id)
            .await
            .map_err(OrchestratorError::Repository)?;

        Ok(Some((subscription, package)))
    }
}
