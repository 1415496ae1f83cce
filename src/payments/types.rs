use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Midtrans,
    Xendit,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Midtrans => "midtrans",
            ProviderName::Xendit => "xendit",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "midtrans" => Ok(ProviderName::Midtrans),
            "xendit" => Ok(ProviderName::Xendit),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Provider API environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl FromStr for Environment {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sandbox" | "development" | "test" => Ok(Environment::Sandbox),
            "production" | "live" => Ok(Environment::Production),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported environment: {}", value),
                field: Some("environment".to_string()),
            }),
        }
    }
}

/// An amount in the smallest undivided unit of its currency (whole Rupiah for IDR).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount: i64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        if self.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }
}

/// Parses a provider decimal string such as `"990000.00"` into whole units.
///
/// A non-zero fractional part is rejected: the currencies handled here have
/// no subdivision, so a fraction means the payload is not what we expect.
pub fn parse_whole_amount(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, fraction) = match raw.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (raw, ""),
    };
    if !fraction.chars().all(|c| c == '0') {
        return None;
    }
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    whole.parse::<i64>().ok()
}

/// Reads an amount that providers send either as a JSON number or a string.
pub fn json_whole_amount(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok()))
            .or_else(|| parse_whole_amount(&n.to_string())),
        JsonValue::String(s) => parse_whole_amount(s),
        _ => None,
    }
}

/// Requested payment method category; adapters translate it to their own channel names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer { bank: Option<String> },
    EWallet { channel: Option<String> },
    Qris,
    RetailOutlet,
    Other(String),
}

impl PaymentMethod {
    /// Parses the free-form payment method tag stored on a transaction.
    ///
    /// Accepts `"bank_transfer"`, `"bank_transfer:bca"`, `"ewallet:gopay"`, `"qris"`, ...
    pub fn from_tag(tag: &str) -> Self {
        let normalized = tag.trim().to_lowercase();
        let (kind, detail) = match normalized.split_once(':') {
            Some((kind, detail)) => (kind.to_string(), Some(detail.to_string())),
            None => (normalized.clone(), None),
        };
        match kind.as_str() {
            "card" | "credit_card" => PaymentMethod::Card,
            "bank_transfer" | "va" | "virtual_account" => PaymentMethod::BankTransfer { bank: detail },
            "ewallet" | "e_wallet" => PaymentMethod::EWallet { channel: detail },
            "gopay" | "shopeepay" | "ovo" | "dana" => PaymentMethod::EWallet {
                channel: Some(kind.clone()),
            },
            "qris" => PaymentMethod::Qris,
            "retail" | "retail_outlet" | "cstore" => PaymentMethod::RetailOutlet,
            _ => PaymentMethod::Other(normalized),
        }
    }

    pub fn tag(&self) -> String {
        match self {
            PaymentMethod::Card => "card".to_string(),
            PaymentMethod::BankTransfer { bank: Some(bank) } => format!("bank_transfer:{}", bank),
            PaymentMethod::BankTransfer { bank: None } => "bank_transfer".to_string(),
            PaymentMethod::EWallet { channel: Some(ch) } => format!("ewallet:{}", ch),
            PaymentMethod::EWallet { channel: None } => "ewallet".to_string(),
            PaymentMethod::Qris => "qris".to_string(),
            PaymentMethod::RetailOutlet => "retail_outlet".to_string(),
            PaymentMethod::Other(tag) => tag.clone(),
        }
    }
}

/// Canonical payment status every provider vocabulary is mapped onto.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Processing => "processing",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Cancelled => "cancelled",
            PaymentState::Refunded => "refunded",
        }
    }

    /// Statuses reachable in one step. `Completed` only leaves through an explicit refund.
    pub fn valid_transitions(&self) -> &'static [PaymentState] {
        match self {
            PaymentState::Pending => &[
                PaymentState::Processing,
                PaymentState::Failed,
                PaymentState::Cancelled,
            ],
            PaymentState::Processing => &[
                PaymentState::Completed,
                PaymentState::Failed,
                PaymentState::Cancelled,
            ],
            PaymentState::Completed => &[PaymentState::Refunded],
            PaymentState::Failed | PaymentState::Cancelled | PaymentState::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: PaymentState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Completed
                | PaymentState::Failed
                | PaymentState::Cancelled
                | PaymentState::Refunded
        )
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentState::Pending),
            "processing" => Ok(PaymentState::Processing),
            "completed" => Ok(PaymentState::Completed),
            "failed" => Ok(PaymentState::Failed),
            "cancelled" => Ok(PaymentState::Cancelled),
            "refunded" => Ok(PaymentState::Refunded),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown payment status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomerContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Internal transaction id, sent to the provider as the order reference.
    pub transaction_reference: String,
    pub amount: Money,
    pub description: String,
    pub customer: CustomerContact,
    pub payment_method: PaymentMethod,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualAccount {
    pub bank: String,
    pub number: String,
}

/// Canonical result of any adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub status: PaymentState,
    pub provider_reference: Option<String>,
    pub transaction_reference: Option<String>,
    pub payment_url: Option<String>,
    pub virtual_account: Option<VirtualAccount>,
    pub expires_at: Option<DateTime<Utc>>,
    pub amount: Option<Money>,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Amount the provider reports as refunded, when the response concerns a refund.
    pub refund_amount: Option<i64>,
    pub refund_reason: Option<String>,
    /// Provider response, kept verbatim for audit.
    pub raw: JsonValue,
}

impl PaymentOutcome {
    pub fn new(status: PaymentState, raw: JsonValue) -> Self {
        Self {
            status,
            provider_reference: None,
            transaction_reference: None,
            payment_url: None,
            virtual_account: None,
            expires_at: None,
            amount: None,
            payment_method: None,
            paid_at: None,
            failure_reason: None,
            refund_amount: None,
            refund_reason: None,
            raw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: ProviderName,
    pub provider_reference: Option<String>,
    pub transaction_reference: Option<String>,
    pub status: PaymentState,
    /// Native status string as delivered, for logs.
    pub provider_status: String,
    pub amount: Option<Money>,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund_amount: Option<i64>,
    pub refund_reason: Option<String>,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}
