//! Records the orchestrator reads and writes through [`BillingRepository`].
//!
//! [`BillingRepository`]: crate::database::repository::BillingRepository

use crate::database::error::DatabaseError;
use crate::payments::types::PaymentState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    Renewal,
    OneTime,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Subscription => "subscription",
            TransactionType::Renewal => "renewal",
            TransactionType::OneTime => "one_time",
            TransactionType::Refund => "refund",
        }
    }
}

impl FromStr for TransactionType {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "subscription" => Ok(TransactionType::Subscription),
            "renewal" => Ok(TransactionType::Renewal),
            "one_time" => Ok(TransactionType::OneTime),
            "refund" => Ok(TransactionType::Refund),
            other => Err(DatabaseError::decode(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundDetails {
    pub amount: i64,
    pub reason: Option<String>,
    pub refunded_at: DateTime<Utc>,
}

/// A single payment attempt. Never deleted; retries create new rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub status: PaymentState,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub payment_method: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub payment_url: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund: Option<RefundDetails>,
    pub gateway_response: Option<JsonValue>,
    pub invoice_id: Option<Uuid>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A fresh `pending` transaction as the billing flow would create it.
    pub fn new_pending(
        user_id: Uuid,
        transaction_type: TransactionType,
        amount: i64,
        currency: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: None,
            transaction_type,
            status: PaymentState::Pending,
            amount,
            currency: currency.into(),
            description: description.into(),
            payment_method: "bank_transfer".to_string(),
            customer_name: None,
            customer_email: None,
            customer_phone: None,
            provider: None,
            external_id: None,
            payment_url: None,
            due_at: None,
            expires_at: None,
            paid_at: None,
            failure_reason: None,
            refund: None,
            gateway_response: None,
            invoice_id: None,
            metadata: JsonValue::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: &TransactionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(provider) = &patch.provider {
            self.provider = Some(provider.clone());
        }
        if let Some(external_id) = &patch.external_id {
            self.external_id = Some(external_id.clone());
        }
        if let Some(url) = &patch.payment_url {
            self.payment_url = Some(url.clone());
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = Some(expires_at);
        }
        if let Some(paid_at) = patch.paid_at {
            self.paid_at = Some(paid_at);
        }
        if let Some(reason) = &patch.failure_reason {
            self.failure_reason = Some(reason.clone());
        }
        if let Some(refund) = &patch.refund {
            self.refund = Some(refund.clone());
        }
        if let Some(response) = &patch.gateway_response {
            self.gateway_response = Some(response.clone());
        }
        // Write-once: a transaction links to at most one invoice.
        if self.invoice_id.is_none() {
            self.invoice_id = patch.invoice_id;
        }
        self.updated_at = Utc::now();
    }
}

/// Fields to stamp in a conditional transaction update; `None` leaves the column alone.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<PaymentState>,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub payment_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund: Option<RefundDetails>,
    pub gateway_response: Option<JsonValue>,
    pub invoice_id: Option<Uuid>,
}

impl TransactionPatch {
    pub fn status(status: PaymentState) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_gateway_response(mut self, response: JsonValue) -> Self {
        self.gateway_response = Some(response);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(DatabaseError::decode(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub status: SubscriptionStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub renewal_attempts: i32,
    pub usage_reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new_inactive(user_id: Uuid, package_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            package_id,
            status: SubscriptionStatus::Inactive,
            start_date: None,
            end_date: None,
            next_billing_date: None,
            renewal_attempts: 0,
            usage_reset_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: &SubscriptionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(start) = patch.start_date {
            self.start_date = Some(start);
        }
        if let Some(end) = patch.end_date {
            self.end_date = Some(end);
        }
        if let Some(next) = patch.next_billing_date {
            self.next_billing_date = Some(next);
        }
        if let Some(attempts) = patch.renewal_attempts {
            self.renewal_attempts = attempts;
        }
        if let Some(reset) = patch.usage_reset_at {
            self.usage_reset_at = Some(reset);
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub renewal_attempts: Option<i32>,
    pub usage_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Fixed-length period: 30 days per month, 365 per year. Not calendar arithmetic.
    pub fn period(&self) -> Duration {
        match self {
            BillingCycle::Monthly => Duration::days(30),
            BillingCycle::Yearly => Duration::days(365),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(DatabaseError::decode(format!(
                "unknown billing cycle: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: Uuid,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceLineItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub amount: i64,
}

/// Immutable billing record; at most one per completed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub currency: String,
    pub line_items: Vec<InvoiceLineItem>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub currency: String,
    pub line_items: Vec<InvoiceLineItem>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl NewInvoice {
    /// Snapshot of a completed transaction; the number is assigned by invoice numbering.
    pub fn from_transaction(transaction: &Transaction) -> Self {
        Self {
            invoice_number: String::new(),
            transaction_id: transaction.id,
            user_id: transaction.user_id,
            subscription_id: transaction.subscription_id,
            subtotal: transaction.amount,
            discount: 0,
            tax: 0,
            total: transaction.amount,
            currency: transaction.currency.clone(),
            line_items: vec![InvoiceLineItem {
                description: transaction.description.clone(),
                quantity: 1,
                unit_price: transaction.amount,
                amount: transaction.amount,
            }],
            paid_at: transaction.paid_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_cycles_use_fixed_day_counts() {
        assert_eq!(BillingCycle::Monthly.period(), Duration::days(30));
        assert_eq!(BillingCycle::Yearly.period(), Duration::days(365));
    }

    #[test]
    fn patch_only_touches_provided_fields() {
        let mut tx = Transaction::new_pending(Uuid::new_v4(), TransactionType::OneTime, 1000, "IDR", "x");
        tx.apply(&TransactionPatch {
            external_id: Some("EXT-1".to_string()),
            ..TransactionPatch::status(PaymentState::Processing)
        });
        assert_eq!(tx.status, PaymentState::Processing);
        assert_eq!(tx.external_id.as_deref(), Some("EXT-1"));
        assert!(tx.paid_at.is_none());
        assert!(tx.invoice_id.is_none());
    }

    #[test]
    fn invoice_snapshot_copies_transaction_amounts() {
        let mut tx = Transaction::new_pending(
            Uuid::new_v4(),
            TransactionType::Subscription,
            990000,
            "IDR",
            "Pro plan (monthly)",
        );
        tx.paid_at = Some(Utc::now());
        let invoice = NewInvoice::from_transaction(&tx);
        assert_eq!(invoice.total, 990000);
        assert_eq!(invoice.subtotal, 990000);
        assert_eq!(invoice.line_items.len(), 1);
        assert_eq!(invoice.line_items[0].description, "Pro plan (monthly)");
        assert_eq!(invoice.paid_at, tx.paid_at);
    }
}
