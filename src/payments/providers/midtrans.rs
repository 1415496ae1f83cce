use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    json_whole_amount, Environment, Money, PaymentMethod, PaymentOutcome, PaymentRequest,
    PaymentState, ProviderName, VirtualAccount, WebhookEvent,
};
use crate::payments::utils::{json_str, secure_eq, sha512_hex, PaymentHttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const SANDBOX_API_URL: &str = "https://api.sandbox.midtrans.com";
const PRODUCTION_API_URL: &str = "https://api.midtrans.com";
const PAYMENT_EXPIRY_HOURS: i64 = 24;
const ITEM_NAME_MAX_LEN: usize = 50;

#[derive(Debug, Clone)]
pub struct MidtransConfig {
    pub server_key: String,
    pub client_key: Option<String>,
    pub environment: Environment,
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for MidtransConfig {
    fn default() -> Self {
        Self {
            server_key: String::new(),
            client_key: None,
            environment: Environment::Sandbox,
            api_url: SANDBOX_API_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl MidtransConfig {
    pub fn from_credentials(
        environment: Environment,
        credentials: &HashMap<String, String>,
    ) -> PaymentResult<Self> {
        let server_key = credentials
            .get("server_key")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or(PaymentError::ValidationError {
                message: "midtrans server_key credential is required".to_string(),
                field: Some("MIDTRANS_SERVER_KEY".to_string()),
            })?;

        let default_url = match environment {
            Environment::Sandbox => SANDBOX_API_URL,
            Environment::Production => PRODUCTION_API_URL,
        };

        Ok(Self {
            server_key,
            client_key: credentials.get("client_key").cloned(),
            environment,
            api_url: credentials
                .get("api_url")
                .cloned()
                .unwrap_or_else(|| default_url.to_string()),
            timeout_secs: credentials
                .get("timeout_secs")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct MidtransProvider {
    config: MidtransConfig,
    http: PaymentHttpClient,
}

impl MidtransProvider {
    pub fn new(config: MidtransConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new("midtrans", Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Expected `signature_key`: SHA-512 over `order_id + status_code + gross_amount + server_key`.
    pub fn notification_signature(
        &self,
        order_id: &str,
        status_code: &str,
        gross_amount: &str,
    ) -> String {
        sha512_hex(
            format!(
                "{}{}{}{}",
                order_id, status_code, gross_amount, self.config.server_key
            )
            .as_bytes(),
        )
    }

    /// Midtrans answers 200 on transport level even for business failures; the body's
    /// `status_code` is what tells us whether the call was accepted.
    fn ensure_accepted(body: &JsonValue, accepted: &[&str]) -> PaymentResult<()> {
        let code = json_str(body, "status_code").unwrap_or_default();
        if accepted.contains(&code.as_str()) {
            return Ok(());
        }
        let message = json_str(body, "status_message")
            .unwrap_or_else(|| "midtrans rejected the request".to_string());
        Err(PaymentError::provider("midtrans", message, Some(code)))
    }

    fn charge_payload(request: &PaymentRequest) -> PaymentResult<JsonValue> {
        let item_name: String = request.description.chars().take(ITEM_NAME_MAX_LEN).collect();
        let mut payload = serde_json::json!({
            "transaction_details": {
                "order_id": request.transaction_reference,
                "gross_amount": request.amount.amount,
            },
            "customer_details": {
                "first_name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone,
            },
            "item_details": [{
                "id": request.transaction_reference,
                "price": request.amount.amount,
                "quantity": 1,
                "name": item_name,
            }],
            "custom_expiry": {
                "expiry_duration": PAYMENT_EXPIRY_HOURS,
                "unit": "hour",
            },
            "metadata": request.metadata,
        });

        match &request.payment_method {
            PaymentMethod::BankTransfer { bank } => {
                let bank = bank.clone().unwrap_or_else(|| "bca".to_string());
                if bank == "mandiri" {
                    payload["payment_type"] = "echannel".into();
                    payload["echannel"] = serde_json::json!({
                        "bill_info1": "Payment:",
                        "bill_info2": item_name,
                    });
                } else {
                    payload["payment_type"] = "bank_transfer".into();
                    payload["bank_transfer"] = serde_json::json!({ "bank": bank });
                }
            }
            PaymentMethod::EWallet { channel } => {
                let channel = channel.clone().unwrap_or_else(|| "gopay".to_string());
                if channel != "gopay" && channel != "shopeepay" {
                    return Err(PaymentError::ValidationError {
                        message: format!("midtrans does not support e-wallet channel {}", channel),
                        field: Some("payment_method".to_string()),
                    });
                }
                payload["payment_type"] = channel.into();
            }
            PaymentMethod::Qris => {
                payload["payment_type"] = "qris".into();
            }
            PaymentMethod::RetailOutlet => {
                payload["payment_type"] = "cstore".into();
                payload["cstore"] = serde_json::json!({ "store": "indomaret" });
            }
            PaymentMethod::Card => {
                let token = request
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("card_token_id"))
                    .and_then(|v| v.as_str())
                    .ok_or(PaymentError::ValidationError {
                        message: "card payments require metadata.card_token_id".to_string(),
                        field: Some("metadata.card_token_id".to_string()),
                    })?;
                payload["payment_type"] = "credit_card".into();
                payload["credit_card"] = serde_json::json!({
                    "token_id": token,
                    "authentication": true,
                });
            }
            PaymentMethod::Other(tag) => {
                return Err(PaymentError::ValidationError {
                    message: format!("unsupported payment method for midtrans: {}", tag),
                    field: Some("payment_method".to_string()),
                });
            }
        }

        Ok(payload)
    }

    fn outcome_from_body(body: JsonValue) -> PaymentOutcome {
        let native = json_str(&body, "transaction_status").unwrap_or_default();
        let fraud = json_str(&body, "fraud_status");
        let status = map_transaction_status(&native, fraud.as_deref());

        let virtual_account = body
            .get("va_numbers")
            .and_then(|v| v.as_array())
            .and_then(|list| list.first())
            .and_then(|va| {
                Some(VirtualAccount {
                    bank: json_str(va, "bank")?,
                    number: json_str(va, "va_number")?,
                })
            })
            .or_else(|| {
                json_str(&body, "permata_va_number").map(|number| VirtualAccount {
                    bank: "permata".to_string(),
                    number,
                })
            })
            .or_else(|| {
                json_str(&body, "bill_key").map(|number| VirtualAccount {
                    bank: "mandiri".to_string(),
                    number,
                })
            })
            .or_else(|| {
                json_str(&body, "payment_code").map(|number| VirtualAccount {
                    bank: json_str(&body, "store").unwrap_or_else(|| "indomaret".to_string()),
                    number,
                })
            });

        let payment_url = json_str(&body, "redirect_url").or_else(|| {
            body.get("actions")
                .and_then(|v| v.as_array())
                .and_then(|actions| actions.first())
                .and_then(|action| json_str(action, "url"))
        });

        let amount = body
            .get("gross_amount")
            .and_then(json_whole_amount)
            .map(|amount| {
                Money::new(
                    amount,
                    json_str(&body, "currency").unwrap_or_else(|| "IDR".to_string()),
                )
            });

        let failure_reason = if matches!(status, PaymentState::Failed) {
            json_str(&body, "status_message")
        } else {
            None
        };

        let mut outcome = PaymentOutcome::new(status, JsonValue::Null);
        outcome.provider_reference = json_str(&body, "transaction_id");
        outcome.transaction_reference = json_str(&body, "order_id");
        outcome.payment_url = payment_url;
        outcome.virtual_account = virtual_account;
        outcome.expires_at = json_str(&body, "expiry_time")
            .as_deref()
            .and_then(parse_jakarta_time);
        outcome.amount = amount;
        outcome.payment_method = json_str(&body, "payment_type");
        outcome.paid_at = json_str(&body, "settlement_time")
            .as_deref()
            .and_then(parse_jakarta_time);
        outcome.failure_reason = failure_reason;
        let (refund_amount, refund_reason) = refund_details(&body);
        outcome.refund_amount = refund_amount;
        outcome.refund_reason = refund_reason;
        outcome.raw = body;
        outcome
    }
}

/// Refunded total and the latest reason. `refund_amount` is cumulative; older
/// notifications only carry the `refunds` history.
fn refund_details(body: &JsonValue) -> (Option<i64>, Option<String>) {
    let refunds = body
        .get("refunds")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let amount = body
        .get("refund_amount")
        .and_then(json_whole_amount)
        .or_else(|| {
            refunds
                .iter()
                .map(|r| r.get("refund_amount").and_then(json_whole_amount))
                .sum::<Option<i64>>()
                .filter(|_| !refunds.is_empty())
        });
    let reason = refunds
        .last()
        .and_then(|r| json_str(r, "reason"))
        .or_else(|| json_str(body, "reason"));

    (amount, reason)
}

/// Total mapping from Midtrans `transaction_status` (and `fraud_status`) onto the
/// canonical vocabulary. Unknown values fall back to `Pending`.
pub fn map_transaction_status(native: &str, fraud_status: Option<&str>) -> PaymentState {
    match native {
        "capture" => match fraud_status {
            Some("challenge") => PaymentState::Processing,
            Some("deny") => PaymentState::Failed,
            _ => PaymentState::Completed,
        },
        "settlement" => PaymentState::Completed,
        "pending" => PaymentState::Pending,
        "authorize" => PaymentState::Processing,
        "deny" | "failure" | "expire" => PaymentState::Failed,
        "cancel" => PaymentState::Cancelled,
        "refund" | "partial_refund" => PaymentState::Refunded,
        other => {
            warn!(
                provider = "midtrans",
                provider_status = %other,
                anomaly = "unmapped_status",
                "unknown midtrans transaction status, treating as pending"
            );
            PaymentState::Pending
        }
    }
}

/// Midtrans timestamps are local Jakarta time (UTC+7) without an offset.
fn parse_jakarta_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    let jakarta = FixedOffset::east_opt(7 * 3600)?;
    jakarta
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl PaymentProvider for MidtransProvider {
    async fn create_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentOutcome> {
        request.amount.validate_positive("amount")?;
        let payload = Self::charge_payload(&request)?;

        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v2/charge"),
                &self.config.server_key,
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;
        Self::ensure_accepted(&body, &["200", "201"])?;

        let mut outcome = Self::outcome_from_body(body);
        if outcome.provider_reference.is_none() {
            return Err(PaymentError::provider(
                "midtrans",
                "charge response is missing transaction_id",
                None,
            ));
        }
        // A freshly accepted charge is awaiting payment whatever the channel reports.
        if outcome.status != PaymentState::Completed {
            outcome.status = PaymentState::Pending;
        }
        if outcome.expires_at.is_none() {
            outcome.expires_at = Some(Utc::now() + ChronoDuration::hours(PAYMENT_EXPIRY_HOURS));
        }
        if outcome.amount.is_none() {
            outcome.amount = Some(request.amount.clone());
        }

        info!(
            transaction_reference = %request.transaction_reference,
            provider_reference = ?outcome.provider_reference,
            "midtrans charge created"
        );
        Ok(outcome)
    }

    async fn get_status(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        let body = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v2/{}/status", provider_reference)),
                &self.config.server_key,
                None,
                &[],
            )
            .await?;
        Self::ensure_accepted(&body, &["200", "201", "202", "407"])?;
        Ok(Self::outcome_from_body(body))
    }

    async fn cancel_transaction(&self, provider_reference: &str) -> PaymentResult<PaymentOutcome> {
        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/v2/{}/cancel", provider_reference)),
                &self.config.server_key,
                None,
                &[],
            )
            .await?;
        Self::ensure_accepted(&body, &["200"])?;

        let mut outcome = Self::outcome_from_body(body);
        outcome.status = PaymentState::Cancelled;
        Ok(outcome)
    }

    async fn refund_transaction(
        &self,
        provider_reference: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> PaymentResult<PaymentOutcome> {
        if let Some(amount) = amount {
            if amount <= 0 {
                return Err(PaymentError::ValidationError {
                    message: "refund amount must be greater than zero".to_string(),
                    field: Some("amount".to_string()),
                });
            }
        }

        let mut payload = serde_json::json!({
            "refund_key": format!("{}-refund-{}", provider_reference, Utc::now().timestamp_millis()),
            "reason": reason.unwrap_or("refund requested"),
        });
        if let Some(amount) = amount {
            payload["amount"] = amount.into();
        }

        let body = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/v2/{}/refund", provider_reference)),
                &self.config.server_key,
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;
        Self::ensure_accepted(&body, &["200"])?;

        // A 200 means the refund was approved; Midtrans answers 412/418 otherwise.
        let mut outcome = Self::outcome_from_body(body);
        outcome.status = PaymentState::Refunded;
        outcome.refund_amount = outcome.refund_amount.or(amount);
        if outcome.refund_reason.is_none() {
            outcome.refund_reason = reason.map(str::to_string);
        }
        Ok(outcome)
    }

    fn name(&self) -> ProviderName {
        ProviderName::Midtrans
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool {
        let parsed: JsonValue = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return false,
        };

        let (order_id, status_code, gross_amount) = match (
            json_str(&parsed, "order_id"),
            json_str(&parsed, "status_code"),
            json_str(&parsed, "gross_amount"),
        ) {
            (Some(o), Some(s), Some(g)) => (o, s, g),
            _ => return false,
        };

        let provided = if signature.trim().is_empty() {
            match json_str(&parsed, "signature_key") {
                Some(v) => v,
                None => return false,
            }
        } else {
            signature.trim().to_string()
        };

        let expected = self.notification_signature(&order_id, &status_code, &gross_amount);
        secure_eq(
            expected.as_bytes(),
            provided.trim().to_ascii_lowercase().as_bytes(),
        )
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookPayloadError {
                message: format!("invalid webhook JSON payload: {}", e),
            })?;

        let provider_status = json_str(&parsed, "transaction_status").ok_or(
            PaymentError::WebhookPayloadError {
                message: "transaction_status is missing".to_string(),
            },
        )?;

        for field in ["gross_amount", "refund_amount"] {
            if let Some(raw_amount) = parsed.get(field) {
                if json_whole_amount(raw_amount).is_none() {
                    return Err(PaymentError::WebhookPayloadError {
                        message: format!("{} is not a whole amount: {}", field, raw_amount),
                    });
                }
            }
        }

        let outcome = Self::outcome_from_body(parsed);
        Ok(WebhookEvent {
            provider: ProviderName::Midtrans,
            provider_reference: outcome.provider_reference,
            transaction_reference: outcome.transaction_reference,
            status: outcome.status,
            provider_status,
            amount: outcome.amount,
            payment_method: outcome.payment_method,
            paid_at: outcome.paid_at,
            failure_reason: outcome.failure_reason,
            refund_amount: outcome.refund_amount,
            refund_reason: outcome.refund_reason,
            payload: outcome.raw,
            received_at: Utc::now(),
        })
    }
}
