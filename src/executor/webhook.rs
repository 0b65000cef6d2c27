use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::Executor;

const SIGNATURE_HEADER: &str = "x-hostgate-signature";
const DELIVERY_HEADER: &str = "x-hostgate-delivery-id";
const TIMESTAMP_HEADER: &str = "x-hostgate-timestamp";

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest prefixed with "sha256=".
fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Hands an approved payload to a command-wrapper endpoint over HTTP.
///
/// The payload is POSTed as JSON, optionally signed with HMAC-SHA256 in the
/// `X-Hostgate-Signature` header. Any non-2xx status is a failure. There is
/// exactly one attempt: a privileged action must not run twice because a
/// response got lost.
pub struct WebhookExecutor {
    client: reqwest::Client,
    url: String,
    secret: Option<Zeroizing<Vec<u8>>>,
}

impl WebhookExecutor {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url).with_context(|| format!("invalid executor url: {}", url))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("hostgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build executor HTTP client")?;
        Ok(Self {
            client,
            url,
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| Zeroizing::new(s.into_bytes())),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for WebhookExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookExecutor")
            .field("url", &self.url)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

#[async_trait]
impl Executor for WebhookExecutor {
    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(payload).context("executor payload serialize error")?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header(DELIVERY_HEADER, &delivery_id)
            .header(TIMESTAMP_HEADER, &timestamp);

        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, hmac_sha256_hex(secret, &body)?);
        }

        let resp = req.body(body).send().await.map_err(|e| {
            warn!(url = %self.url, delivery_id = %delivery_id, error = %e, "executor request error");
            anyhow::anyhow!("executor request failed: {}", e)
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(
                url = %self.url,
                delivery_id = %delivery_id,
                status = %status,
                body = %text,
                "executor returned non-2xx"
            );
            anyhow::bail!("executor returned {}: {}", status, text);
        }

        info!(url = %self.url, delivery_id = %delivery_id, status = %status, "executor completed");

        if text.trim().is_empty() {
            return Ok(serde_json::json!({ "status": status.as_u16() }));
        }
        Ok(serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({ "status": status.as_u16(), "body": text })))
    }
}
