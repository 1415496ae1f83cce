use crate::database::error::DatabaseResult;
use crate::database::models::{
    Invoice, NewInvoice, Package, Subscription, SubscriptionPatch, Transaction, TransactionPatch,
};
use crate::payments::types::PaymentState;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence seam for the billing core.
///
/// Implementations must make `update_transaction_if_status` atomic: the patch lands
/// only if the stored status still equals `expected`, and `Ok(None)` reports that
/// another writer got there first. `create_invoice` must surface a duplicate invoice
/// number as a unique violation rather than overwriting.
#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn get_transaction(&self, id: Uuid) -> DatabaseResult<Option<Transaction>>;

    /// Looks up by provider reference first, then by our own id.
    async fn find_transaction_by_external_or_internal_id(
        &self,
        external_id: Option<&str>,
        internal_id: Option<&str>,
    ) -> DatabaseResult<Option<Transaction>>;

    async fn update_transaction_if_status(
        &self,
        id: Uuid,
        expected: PaymentState,
        patch: TransactionPatch,
    ) -> DatabaseResult<Option<Transaction>>;

    /// Oldest first.
    async fn list_transactions_by_status(
        &self,
        status: PaymentState,
        limit: i64,
    ) -> DatabaseResult<Vec<Transaction>>;

    async fn get_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>>;

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: SubscriptionPatch,
    ) -> DatabaseResult<Subscription>;

    async fn get_package(&self, id: Uuid) -> DatabaseResult<Option<Package>>;

    async fn create_invoice(&self, invoice: NewInvoice) -> DatabaseResult<Invoice>;

    async fn get_invoice(&self, id: Uuid) -> DatabaseResult<Option<Invoice>>;

    /// Invoice number with the highest sequence under `prefix`. Longer numbers win,
    /// so sequences past 9999 still order correctly.
    async fn find_latest_invoice_number(&self, prefix: &str) -> DatabaseResult<Option<String>>;
}

/// Parses an id handed to us by a provider; anything that isn't a UUID can't be ours.
pub(crate) fn parse_internal_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|value| Uuid::parse_str(value.trim()).ok())
}
