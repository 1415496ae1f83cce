use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::warn;

/// Thin JSON-over-HTTP client shared by the adapters.
///
/// Calls are never retried here; every request is bounded by `timeout`.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a request authenticated with HTTP Basic (`username:` with empty password)
    /// and returns the decoded JSON body of a 2xx response.
    pub async fn request_json(
        &self,
        method: reqwest::Method,
        url: &str,
        basic_username: &str,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<JsonValue> {
        let mut request = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .basic_auth(basic_username, Some(""))
            .header("Accept", "application/json");

        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PaymentError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                PaymentError::NetworkError {
                    message: format!("provider request failed: {}", e),
                }
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if status.is_success() {
            return serde_json::from_str::<JsonValue>(&text).map_err(|e| {
                PaymentError::provider(
                    self.provider,
                    format!("invalid provider JSON response: {}", e),
                    None,
                )
            });
        }

        if status.as_u16() == 429 {
            return Err(PaymentError::RateLimitError {
                message: format!("{} rate limit exceeded", self.provider),
            });
        }

        warn!(
            provider = self.provider,
            status = %status,
            "provider returned non-success response"
        );

        Err(PaymentError::ProviderError {
            provider: self.provider.to_string(),
            message: format!("HTTP {}: {}", status, text),
            provider_code: Some(status.as_u16().to_string()),
            retryable: status.is_server_error(),
        })
    }
}

pub fn sha512_hex(input: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Constant-time byte comparison; length mismatch returns early.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Reads a string field that providers sometimes encode as a number.
pub fn json_str(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn sha512_hex_matches_known_vector() {
        assert_eq!(
            sha512_hex(b"abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn json_str_reads_numbers_and_strings() {
        let v = serde_json::json!({"a": "x", "b": 201, "c": null});
        assert_eq!(json_str(&v, "a").as_deref(), Some("x"));
        assert_eq!(json_str(&v, "b").as_deref(), Some("201"));
        assert_eq!(json_str(&v, "c"), None);
    }
}
