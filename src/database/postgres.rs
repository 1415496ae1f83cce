use crate::database::error::{DatabaseError, DatabaseResult};
use crate::database::models::{
    Invoice, InvoiceLineItem, NewInvoice, Package, RefundDetails, Subscription, SubscriptionPatch,
    Transaction, TransactionPatch,
};
use crate::database::repository::{parse_internal_id, BillingRepository};
use crate::payments::types::PaymentState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "id, user_id, subscription_id, type, status, amount, currency, \
     description, payment_method, customer_name, customer_email, customer_phone, provider, \
     external_id, payment_url, due_at, expires_at, paid_at, failure_reason, refund_amount, \
     refund_reason, refunded_at, gateway_response, invoice_id, metadata, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, package_id, status, start_date, end_date, \
     next_billing_date, renewal_attempts, usage_reset_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, invoice_number, transaction_id, user_id, subscription_id, \
     subtotal, discount, tax, total, currency, line_items, paid_at, created_at";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    transaction_type: String,
    status: String,
    amount: i64,
    currency: String,
    description: String,
    payment_method: String,
    customer_name: Option<String>,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    provider: Option<String>,
    external_id: Option<String>,
    payment_url: Option<String>,
    due_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    refund_amount: Option<i64>,
    refund_reason: Option<String>,
    refunded_at: Option<DateTime<Utc>>,
    gateway_response: Option<serde_json::Value>,
    invoice_id: Option<Uuid>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let status = PaymentState::from_str(&row.status)
            .map_err(|_| DatabaseError::decode(format!("unknown payment status: {}", row.status)))?;
        let refund = match (row.refund_amount, row.refunded_at) {
            (Some(amount), Some(refunded_at)) => Some(RefundDetails {
                amount,
                reason: row.refund_reason,
                refunded_at,
            }),
            _ => None,
        };

        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            transaction_type: row.transaction_type.parse()?,
            status,
            amount: row.amount,
            currency: row.currency,
            description: row.description,
            payment_method: row.payment_method,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            provider: row.provider,
            external_id: row.external_id,
            payment_url: row.payment_url,
            due_at: row.due_at,
            expires_at: row.expires_at,
            paid_at: row.paid_at,
            failure_reason: row.failure_reason,
            refund,
            gateway_response: row.gateway_response,
            invoice_id: row.invoice_id,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    package_id: Uuid,
    status: String,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    next_billing_date: Option<DateTime<Utc>>,
    renewal_attempts: i32,
    usage_reset_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DatabaseError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            package_id: row.package_id,
            status: row.status.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            next_billing_date: row.next_billing_date,
            renewal_attempts: row.renewal_attempts,
            usage_reset_at: row.usage_reset_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    price: i64,
    currency: String,
    billing_cycle: String,
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    transaction_id: Uuid,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    subtotal: i64,
    discount: i64,
    tax: i64,
    total: i64,
    currency: String,
    line_items: Json<Vec<InvoiceLineItem>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            invoice_number: row.invoice_number,
            transaction_id: row.transaction_id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            subtotal: row.subtotal,
            discount: row.discount,
            tax: row.tax,
            total: row.total,
            currency: row.currency,
            line_items: row.line_items.0,
            paid_at: row.paid_at,
            created_at: row.created_at,
        }
    }
}

/// Postgres-backed repository. Conditional updates rely on a single
/// `UPDATE ... WHERE status = $n` so the check and the write are one statement.
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_external_id(&self, external_id: &str) -> DatabaseResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE external_id = $1",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }
}

#[async_trait]
impl BillingRepository for PgBillingRepository {
    async fn get_transaction(&self, id: Uuid) -> DatabaseResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TRANSACTION_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_transaction_by_external_or_internal_id(
        &self,
        external_id: Option<&str>,
        internal_id: Option<&str>,
    ) -> DatabaseResult<Option<Transaction>> {
        if let Some(external) = external_id.filter(|value| !value.is_empty()) {
            if let Some(tx) = self.fetch_by_external_id(external).await? {
                return Ok(Some(tx));
            }
        }
        match parse_internal_id(internal_id) {
            Some(id) => self.get_transaction(id).await,
            None => Ok(None),
        }
    }

    async fn update_transaction_if_status(
        &self,
        id: Uuid,
        expected: PaymentState,
        patch: TransactionPatch,
    ) -> DatabaseResult<Option<Transaction>> {
        let refund = patch.refund.as_ref();
        let sql = format!(
            "UPDATE transactions
             SET status = COALESCE($3, status),
                 provider = COALESCE($4, provider),
                 external_id = COALESCE($5, external_id),
                 payment_url = COALESCE($6, payment_url),
                 expires_at = COALESCE($7, expires_at),
                 paid_at = COALESCE($8, paid_at),
                 failure_reason = COALESCE($9, failure_reason),
                 refund_amount = COALESCE($10, refund_amount),
                 refund_reason = COALESCE($11, refund_reason),
                 refunded_at = COALESCE($12, refunded_at),
                 gateway_response = COALESCE($13, gateway_response),
                 invoice_id = COALESCE(invoice_id, $14),
                 updated_at = NOW()
             WHERE id = $1 AND status = $2
             RETURNING {}",
            TRANSACTION_COLUMNS
        );

        let updated = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(patch.status.map(|status| status.as_str()))
            .bind(patch.provider.as_deref())
            .bind(patch.external_id.as_deref())
            .bind(patch.payment_url.as_deref())
            .bind(patch.expires_at)
            .bind(patch.paid_at)
            .bind(patch.failure_reason.as_deref())
            .bind(refund.map(|r| r.amount))
            .bind(refund.and_then(|r| r.reason.as_deref()))
            .bind(refund.map(|r| r.refunded_at))
            .bind(patch.gateway_response.clone())
            .bind(patch.invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        match updated {
            Some(row) => Transaction::try_from(row).map(Some),
            None => {
                // Distinguish "lost the race" from "no such row".
                if self.get_transaction(id).await?.is_none() {
                    return Err(DatabaseError::not_found("transaction", id));
                }
                Ok(None)
            }
        }
    }

    async fn list_transactions_by_status(
        &self,
        status: PaymentState,
        limit: i64,
    ) -> DatabaseResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    async fn get_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: SubscriptionPatch,
    ) -> DatabaseResult<Subscription> {
        let sql = format!(
            "UPDATE subscriptions
             SET status = COALESCE($2, status),
                 start_date = COALESCE($3, start_date),
                 end_date = COALESCE($4, end_date),
                 next_billing_date = COALESCE($5, next_billing_date),
                 renewal_attempts = COALESCE($6, renewal_attempts),
                 usage_reset_at = COALESCE($7, usage_reset_at),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .bind(patch.status.map(|status| status.as_str()))
            .bind(patch.start_date)
            .bind(patch.end_date)
            .bind(patch.next_billing_date)
            .bind(patch.renewal_attempts)
            .bind(patch.usage_reset_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("subscription", id))?;
        Subscription::try_from(row)
    }

    async fn get_package(&self, id: Uuid) -> DatabaseResult<Option<Package>> {
        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, price, currency, billing_cycle FROM packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => Ok(Some(Package {
                id: row.id,
                name: row.name,
                price: row.price,
                currency: row.currency,
                billing_cycle: row.billing_cycle.parse()?,
            })),
            None => Ok(None),
        }
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> DatabaseResult<Invoice> {
        let sql = format!(
            "INSERT INTO invoices
             (invoice_number, transaction_id, user_id, subscription_id, subtotal, discount,
              tax, total, currency, line_items, paid_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {}",
            INVOICE_COLUMNS
        );
        sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(&invoice.invoice_number)
            .bind(invoice.transaction_id)
            .bind(invoice.user_id)
            .bind(invoice.subscription_id)
            .bind(invoice.subtotal)
            .bind(invoice.discount)
            .bind(invoice.tax)
            .bind(invoice.total)
            .bind(&invoice.currency)
            .bind(Json(&invoice.line_items))
            .bind(invoice.paid_at)
            .fetch_one(&self.pool)
            .await
            .map(Invoice::from)
            .map_err(DatabaseError::from_sqlx)
    }

    async fn get_invoice(&self, id: Uuid) -> DatabaseResult<Option<Invoice>> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(Invoice::from))
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_latest_invoice_number(&self, prefix: &str) -> DatabaseResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT invoice_number FROM invoices
             WHERE starts_with(invoice_number, $1)
             ORDER BY length(invoice_number) DESC, invoice_number DESC
             LIMIT 1",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
