//! In-process repository used by tests and local runs without Postgres.

use crate::database::error::{DatabaseError, DatabaseResult};
use crate::database::models::{
    Invoice, NewInvoice, Package, Subscription, SubscriptionPatch, Transaction, TransactionPatch,
};
use crate::database::repository::{parse_internal_id, BillingRepository};
use crate::payments::types::PaymentState;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    transactions: HashMap<Uuid, Transaction>,
    subscriptions: HashMap<Uuid, Subscription>,
    packages: HashMap<Uuid, Package>,
    invoices: HashMap<Uuid, Invoice>,
}

/// Every write holds the single write lock, which gives the same
/// compare-and-update and unique-number guarantees Postgres gives.
#[derive(Default)]
pub struct InMemoryBillingRepository {
    tables: RwLock<Tables>,
}

impl InMemoryBillingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        self.tables
            .write()
            .await
            .transactions
            .insert(transaction.id, transaction);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.tables
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_package(&self, package: Package) {
        self.tables.write().await.packages.insert(package.id, package);
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> =
            self.tables.read().await.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| {
            (a.invoice_number.len(), &a.invoice_number)
                .cmp(&(b.invoice_number.len(), &b.invoice_number))
        });
        invoices
    }
}

#[async_trait]
impl BillingRepository for InMemoryBillingRepository {
    async fn get_transaction(&self, id: Uuid) -> DatabaseResult<Option<Transaction>> {
        Ok(self.tables.read().await.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_external_or_internal_id(
        &self,
        external_id: Option<&str>,
        internal_id: Option<&str>,
    ) -> DatabaseResult<Option<Transaction>> {
        let tables = self.tables.read().await;

        if let Some(external) = external_id.filter(|value| !value.is_empty()) {
            let found = tables
                .transactions
                .values()
                .find(|tx| tx.external_id.as_deref() == Some(external));
            if let Some(tx) = found {
                return Ok(Some(tx.clone()));
            }
        }

        Ok(parse_internal_id(internal_id).and_then(|id| tables.transactions.get(&id).cloned()))
    }

    async fn update_transaction_if_status(
        &self,
        id: Uuid,
        expected: PaymentState,
        patch: TransactionPatch,
    ) -> DatabaseResult<Option<Transaction>> {
        let mut tables = self.tables.write().await;
        match tables.transactions.get_mut(&id) {
            Some(tx) if tx.status == expected => {
                tx.apply(&patch);
                Ok(Some(tx.clone()))
            }
            Some(_) => Ok(None),
            None => Err(DatabaseError::not_found("transaction", id)),
        }
    }

    async fn list_transactions_by_status(
        &self,
        status: PaymentState,
        limit: i64,
    ) -> DatabaseResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut matching: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| tx.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|tx| tx.created_at);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn get_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>> {
        Ok(self.tables.read().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: SubscriptionPatch,
    ) -> DatabaseResult<Subscription> {
        let mut tables = self.tables.write().await;
        let subscription = tables
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("subscription", id))?;
        subscription.apply(&patch);
        Ok(subscription.clone())
    }

    async fn get_package(&self, id: Uuid) -> DatabaseResult<Option<Package>> {
        Ok(self.tables.read().await.packages.get(&id).cloned())
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> DatabaseResult<Invoice> {
        let mut tables = self.tables.write().await;
        if tables
            .invoices
            .values()
            .any(|existing| existing.invoice_number == invoice.invoice_number)
        {
            return Err(DatabaseError::unique_violation("invoices_invoice_number_key"));
        }
        if tables
            .invoices
            .values()
            .any(|existing| existing.transaction_id == invoice.transaction_id)
        {
            return Err(DatabaseError::unique_violation("invoices_transaction_id_key"));
        }

        let created = Invoice {
            id: Uuid::new_v4(),
            invoice_number: invoice.invoice_number,
            transaction_id: invoice.transaction_id,
            user_id: invoice.user_id,
            subscription_id: invoice.subscription_id,
            subtotal: invoice.subtotal,
            discount: invoice.discount,
            tax: invoice.tax,
            total: invoice.total,
            currency: invoice.currency,
            line_items: invoice.line_items,
            paid_at: invoice.paid_at,
            created_at: Utc::now(),
        };
        tables.invoices.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_invoice(&self, id: Uuid) -> DatabaseResult<Option<Invoice>> {
        Ok(self.tables.read().await.invoices.get(&id).cloned())
    }

    async fn find_latest_invoice_number(&self, prefix: &str) -> DatabaseResult<Option<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .invoices
            .values()
            .map(|invoice| &invoice.invoice_number)
            .filter(|number| number.starts_with(prefix))
            .max_by(|a, b| (a.len(), *a).cmp(&(b.len(), *b)))
            .cloned())
    }
}
