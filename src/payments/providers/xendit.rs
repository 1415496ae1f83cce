use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    json_whole_amount, Environment, Money, PaymentMethod, PaymentOutcome, PaymentRequest,
    PaymentState, ProviderName, WebhookEvent,
};
use crate::payments::utils::{json_str, secure_eq, PaymentHttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_API_URL: &str = "https://api.xendit.co";
const INVOICE_DURATION_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct XenditConfig {
    pub secret_key: String,
    pub callback_token: Option<String>,
    pub environment: Environment,
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for XenditConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            callback_token: None,
            environment: Environment::Sandbox,
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl XenditConfig {
    pub fn from_credentials(
        environment: Environment,
        credentials: &HashMap<String, String>,
    ) -> PaymentResult<Self> {
        let secret_key = credentials
            .get("secret_key")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or(PaymentError::ValidationError {
                message: "xendit secret_key credential is required".to_string(),
                field: Some("XENDIT_SECRET_KEY".to_string()),
            })?;

        Ok(Self {
            secret_key,
            callback_token: credentials
                .get("callback_token")
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            environment,
            // Xendit selects sandbox vs live by key, not by host.
            api_url: credentials
                .get("api_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            timeout_secs: credentials
                .get("timeout_secs")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct XenditProvider {
    config: XenditConfig,
    http: PaymentHttpClient,
}

impl XenditProvider {
    pub fn new(config: XenditConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new("xendit", Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn payment_methods(method: &PaymentMethod) -> Option<Vec<String>> {
        match method {
            PaymentMethod::BankTransfer { bank: Some(bank) } => Some(vec![bank.to_uppercase()]),
            PaymentMethod::BankTransfer { bank: None } => Some(
                ["BCA", "BNI", "BRI", "MANDIRI", "PERMATA"]
                    .iter()
                    .map(|b| b.to_string())
                    .collect(),
            ),
            PaymentMethod::EWallet { channel: Some(ch) } => Some(vec![ch.to_uppercase()]),
            PaymentMethod::EWallet { channel: None } => Some(
                ["OVO", "DANA", "SHOPEEPAY", "LINKAJA"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
            PaymentMethod::Qris => Some(vec!["QRIS".to_string()]),
            PaymentMethod::RetailOutlet => Some(vec!["ALFAMART".to_string(), "INDOMARET".to_string()]),
            PaymentMethod::Card => Some(vec!["CREDIT_CARD".to_string()]),
            PaymentMethod::Other(_) => None,
        }
    }

    fn outcome_from_invoice(body: JsonValue) -> PaymentOutcome {
        let native = json_str(&body, "status").unwrap_or_default();
        let status = map_invoice_status(&native);

        let amount = body
            .get("paid_amount")
            .or_else(|| body.get("amount"))
            .and_then(json_whole_amount)
            .map(|amount| {
                Money::new(
                    amount,
                    json_str(&body, "currency").unwrap_or_else(|| "IDR".to_string()),
                )
            });

        let mut outcome = PaymentOutcome::new(status, JsonValue::Null);
        outcome.provider_reference = json_str(&body, "id");
        outcome.transaction_reference = json_str(&body, "external_id");
        outcome.payment_url = json_str(&body, "invoice_url");
        outcome.expires_at = json_str(&body, "expiry_date")
            .as_deref()
            .and_then(parse_rfc3339);
        outcome.amount = amount;
        outcome.payment_method = json_str(&body, "payment_channel")
            .or_else(|| json_str(&body, "payment_method"));
        outcome.paid_at = json_str(&body, "paid_at").as_deref().and_then(parse_rfc3339);
        outcome.failure_reason = json_str(&body, "failure_reason").or_else(|| {
            if status == PaymentState::Failed {
                Some(format!("invoice {}", native.to_lowercase()))
            } else {
                None
            }
        });
        outcome.raw = body;
        outcome
    }

    /// `refund.succeeded` / `refund.failed` callbacks wrap the refund in `data`.
    /// Only a settled refund moves the transaction; anything else is reported
    /// as pending so the completed payment stays as it is.
    fn parse_refund_callback(parsed: JsonValue) -> PaymentResult<WebhookEvent> {
        let data = parsed
            .get("data")
            .filter(|d| d.is_object())
            .ok_or(PaymentError::WebhookPayloadError {
                message: "refund callback has no data object".to_string(),
            })?;
        let provider_status = json_str(data, "status").ok_or(PaymentError::WebhookPayloadError {
            message: "refund status is missing".to_string(),
        })?;
        let refund_amount = whole_amount_field(data, "amount")?;

        let status = match map_refund_status(&provider_status) {
            PaymentState::Refunded => PaymentState::Refunded,
            other => {
                info!(
                    refund_id = ?json_str(data, "id"),
                    invoice_id = ?json_str(data, "invoice_id"),
                    provider_status = %provider_status,
                    mapped = %other,
                    failure_code = ?json_str(data, "failure_code"),
                    "xendit refund callback does not settle the refund"
                );
                PaymentState::Pending
            }
        };

        Ok(WebhookEvent {
            provider: ProviderName::Xendit,
            provider_reference: json_str(data, "invoice_id")
                .or_else(|| json_str(data, "payment_id")),
            transaction_reference: json_str(data, "reference_id"),
            status,
            provider_status,
            amount: None,
            payment_method: json_str(data, "channel_code"),
            paid_at: None,
            failure_reason: json_str(data, "failure_code"),
            refund_amount,
            refund_reason: json_str(data, "reason"),
            payload: parsed,
            received_at: Utc::now(),
        })
    }
}

/// Total mapping from Xendit invoice statuses onto the canonical vocabulary.
/// Unknown values fall back to `Pending`.
pub fn map_invoice_status(native: &str) -> PaymentState {
    match native.to_uppercase().as_str() {
        "PENDING" => PaymentState::Pending,
        "PAID" | "SETTLED" => PaymentState::Completed,
        "EXPIRED" => PaymentState::Failed,
        other => {
            warn!(
                provider = "xendit",
                provider_status = %other,
                anomaly = "unmapped_status",
                "unknown xendit invoice status, treating as pending"
            );
            PaymentState::Pending
        }
    }
}

/// Refunds are asynchronous at Xendit: `PENDING` means accepted but not yet
/// settled, and is reported as `Processing` so callers don't treat it as done.
pub fn map_refund_status(native: &str) -> PaymentState {
    match native.to_uppercase().as_str() {
        "SUCCEEDED" => PaymentState::Refunded,
        "FAILED" => PaymentState::Failed,
        "PENDING" => PaymentState::Processing,
        other => {
            warn!(
                provider = "xendit",
                provider_status = %other,
                anomaly = "unmapped_status",
                "unknown xendit refund status, treating as processing"
            );
            PaymentState::Processing
        }
    }
}

fn whole_amount_field(body: &JsonValue, field: &str) -> PaymentResult<Option<i64>> {
    match body.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(raw) => json_whole_amount(raw)
            .map(Some)
            .ok_or_else(|| PaymentError::WebhookPayloadError {
                message: format!("{} is not a whole amount: {}", field, raw),
            }),
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl PaymentProvider for XenditProvider {
    async fn create_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentOutcome> {
        request.amount.validate_positive("amount")?;

        let mut payload = serde_json::json!({
            "external_id": request.transaction_reference,
            "amount": request.amount.amount,
            "currency": request.amount.currency,
            "description": request.description,
            "invoice_duration": INVOICE_DURATION_SECS,
            "payer_email": request.customer.email,
            "customer": {
                "given_names": request.customer.name,
                "email": request.customer.email,
                "mobile_number": request.customer.phone,
            },
            "metadata": request.metadata,
        });
        if let Some(methods) = Self::payment_methods(&request.payment_method) {
            payload["payment_methods"] = serde_json::json!(methods);
        }

        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v2/invoices"),
                &self.config.secret_key,
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        let outcome = Self::outcome_from_invoice(body);
        if outcome.provider_reference.is_none() || outcome.payment_url.is_none() {
            return Err(PaymentError::provider(
                "xendit",
                "invoice response is missing id or invoice_url",
                None,
            ));
        }

        info!(
            transaction_reference = %request.transaction_reference,
            provider_reference = ?outcome.provider_reference,
            "xendit invoice created"
        );
        Ok(outcome)
    }

    async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        let body = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v2/invoices/{}", provider_reference)),
                &self.config.secret_key,
                None,
                &[],
            )
            .await?;
        Ok(Self::outcome_from_invoice(body))
    }

    async fn cancel_transaction(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/invoices/{}/expire!", provider_reference)),
                &self.config.secret_key,
                None,
                &[],
            )
            .await?;

        let mut outcome = Self::outcome_from_invoice(body);
        outcome.status = PaymentState::Cancelled;
        outcome.failure_reason = None;
        Ok(outcome)
    }

    async fn refund_transaction(
        &self,
        provider_reference: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> PaymentResult<PaymentOutcome> {
        let mut payload = serde_json::json!({
            "invoice_id": provider_reference,
            "reason": reason.unwrap_or("REQUESTED_BY_CUSTOMER"),
        });
        if let Some(amount) = amount {
            if amount <= 0 {
                return Err(PaymentError::ValidationError {
                    message: "refund amount must be greater than zero".to_string(),
                    field: Some("amount".to_string()),
                });
            }
            payload["amount"] = amount.into();
        }

        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/refunds"),
                &self.config.secret_key,
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        let native = json_str(&body, "status").unwrap_or_default();
        let status = map_refund_status(&native);
        if status == PaymentState::Failed {
            return Err(PaymentError::provider(
                "xendit",
                json_str(&body, "failure_code").unwrap_or_else(|| "refund failed".to_string()),
                json_str(&body, "failure_code"),
            ));
        }

        let mut outcome = PaymentOutcome::new(status, JsonValue::Null);
        outcome.provider_reference = Some(provider_reference.to_string());
        outcome.amount = body.get("amount").and_then(json_whole_amount).map(|amount| {
            Money::new(
                amount,
                json_str(&body, "currency").unwrap_or_else(|| "IDR".to_string()),
            )
        });
        outcome.refund_amount = outcome.amount.as_ref().map(|m| m.amount).or(amount);
        outcome.refund_reason =
            json_str(&body, "reason").or_else(|| reason.map(str::to_string));
        if status != PaymentState::Refunded {
            info!(
                provider_reference = %provider_reference,
                refund_id = ?json_str(&body, "id"),
                provider_status = %native,
                "xendit refund accepted, awaiting settlement"
            );
        }
        outcome.raw = body;
        Ok(outcome)
    }

    fn name(&self) -> ProviderName {
        ProviderName::Xendit
    }

    /// Xendit sends the account's callback verification token in `x-callback-token`.
    fn verify_webhook(&self, _payload: &[u8], signature: &str) -> bool {
        let expected = match self.config.callback_token.as_deref() {
            Some(token) => token,
            None => {
                warn!(
                    provider = "xendit",
                    "callback_token is not configured, rejecting webhook"
                );
                return false;
            }
        };
        secure_eq(expected.trim().as_bytes(), signature.trim().as_bytes())
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookPayloadError {
                message: format!("invalid webhook JSON payload: {}", e),
            })?;

        let is_refund_event = json_str(&parsed, "event")
            .map(|event| event.starts_with("refund."))
            .unwrap_or(false);
        if is_refund_event {
            return Self::parse_refund_callback(parsed);
        }

        let provider_status = json_str(&parsed, "status").ok_or(PaymentError::WebhookPayloadError {
            message: "status is missing".to_string(),
        })?;
        whole_amount_field(&parsed, "paid_amount")?;
        whole_amount_field(&parsed, "amount")?;

        let outcome = Self::outcome_from_invoice(parsed);
        Ok(WebhookEvent {
            provider: ProviderName::Xendit,
            provider_reference: outcome.provider_reference,
            transaction_reference: outcome.transaction_reference,
            status: outcome.status,
            provider_status,
            amount: outcome.amount,
            payment_method: outcome.payment_method,
            paid_at: outcome.paid_at,
            failure_reason: outcome.failure_reason,
            refund_amount: None,
            refund_reason: None,
            payload: outcome.raw,
            received_at: Utc::now(),
        })
    }
}
