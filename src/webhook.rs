//! Batch `task_status` webhook delivery (spec.md §4.F "Webhooks").
//!
//! Grounded on the axum-based HTTP-serving crates in the corpus
//! (`hi-youichi-loom/serve`, `sven-gateway`) for the outbound-POST +
//! HMAC-signature shape; `hmac`/`sha2`/`hex` are already part of the
//! dependency stack for exactly this purpose.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("webhook endpoint returned {0}")]
    NonSuccessStatus(reqwest::StatusCode),
}

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// POST `payload` to `url`. When `secret` is set, sign the raw body
    /// with HMAC-SHA256 and attach it as `X-Webhook-Signature: <hex>`
    /// so the receiver can verify the body wasn't tampered with in
    /// transit (spec.md §6 "Webhook payload": `hex(hmac_sha256(secret,
    /// rawBody))`). Delivery failure is the caller's to log-and-continue —
    /// it never affects task outcome (spec.md §4.F).
    pub async fn send(&self, url: &str, secret: Option<&str>, payload: &Value) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(payload).map_err(|e| WebhookError::Request(e.to_string()))?;

        let mut request = self.client.post(url).header("content-type", "application/json");
        if let Some(secret) = secret {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
            mac.update(&body);
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request.header("x-webhook-signature", signature);
        }

        let response = request.body(body).send().await.map_err(|e| WebhookError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WebhookError::NonSuccessStatus(response.status()));
        }
        Ok(())
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_same_body_and_secret() {
        let mut mac1 = HmacSha256::new_from_slice(b"secret").unwrap();
        mac1.update(b"{\"a\":1}");
        let sig1 = hex::encode(mac1.finalize().into_bytes());

        let mut mac2 = HmacSha256::new_from_slice(b"secret").unwrap();
        mac2.update(b"{\"a\":1}");
        let sig2 = hex::encode(mac2.finalize().into_bytes());

        assert_eq!(sig1, sig2);
    }
}
