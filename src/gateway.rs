// ABOUTME: Outbound IM gateway client posting to an HMAC-signed group webhook
// ABOUTME: Used to forward agent replies back to the external chat surface

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::GatewayConfig;

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Client for the external IM group webhook. Each request is signed with
/// a timestamped HMAC so the IM platform accepts it.
pub struct ImGateway {
    http: reqwest::Client,
    webhook_base: String,
    secret: String,
}

impl ImGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            webhook_base: config.webhook_base.clone(),
            secret: config.secret.clone(),
        })
    }

    /// Signature input is "{timestamp}\n{secret}", keyed with the secret
    /// itself, base64-encoded. The platform rejects stale timestamps.
    fn sign(&self, timestamp_ms: i64) -> Result<String> {
        let payload = format!("{}\n{}", timestamp_ms, self.secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .context("Failed to build webhook signer")?;
        mac.update(payload.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::STANDARD.encode(digest))
    }

    /// Post a text message to the group, tagged with its original sender.
    pub async fn send_text(
        &self,
        content: &str,
        sender: &str,
        at_targets: &[String],
    ) -> Result<()> {
        let body = serde_json::json!({
            "msgtype": "text",
            "text": { "content": format!("{} [{}]", content, sender) },
            "at": { "atMobiles": at_targets, "isAtAll": false },
        });
        self.post(body).await
    }

    /// Post a markdown message to the group.
    pub async fn send_markdown(&self, title: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "title": title, "text": text },
        });
        self.post(body).await
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let timestamp = crate::message::now_ms();
        let sign = self.sign(timestamp)?;

        let response = self
            .http
            .post(&self.webhook_base)
            .query(&[("timestamp", timestamp.to_string()), ("sign", sign)])
            .json(&body)
            .send()
            .await
            .context("Webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook returned HTTP {}", status);
        }
        let parsed: GatewayResponse = response
            .json()
            .await
            .context("Undecodable webhook response")?;
        if parsed.errcode != 0 {
            anyhow::bail!("Webhook rejected message: {} {}", parsed.errcode, parsed.errmsg);
        }
        tracing::debug!("Message forwarded to IM group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let gateway = ImGateway::new(&GatewayConfig {
            webhook_base: "https://example.com/hook".to_string(),
            secret: "s3cret".to_string(),
        })
        .unwrap();
        let a = gateway.sign(1_700_000_000_000).unwrap();
        let b = gateway.sign(1_700_000_000_000).unwrap();
        assert_eq!(a, b);
        // Different timestamps must not collide
        let c = gateway.sign(1_700_000_000_001).unwrap();
        assert_ne!(a, c);
        // Base64 of a SHA-256 digest
        assert_eq!(a.len(), 44);
    }
}
