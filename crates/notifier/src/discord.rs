//! Discord webhook delivery.
//!
//! The recipient of a `chat` notification is a Discord webhook URL. Messages
//! are posted as a single embed with `?wait=true` so Discord returns the
//! created message and its id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;

use herald_common::types::DeliveryReceipt;

use crate::provider::{DeliveryError, DeliveryProvider, DeliveryRequest};

/// Discord rejects embed descriptions longer than this.
const MAX_DESCRIPTION_LEN: usize = 4096;

const WEBHOOK_PREFIXES: &[&str] = &[
    "https://discord.com/api/webhooks/",
    "https://discordapp.com/api/webhooks/",
    "https://ptb.discord.com/api/webhooks/",
    "https://canary.discord.com/api/webhooks/",
];

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
}

pub struct DiscordWebhookProvider {
    client: reqwest::Client,
    username: Option<String>,
}

impl DiscordWebhookProvider {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            username: None,
        })
    }

    /// Override the webhook's display name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    fn is_webhook_url(recipient: &str) -> bool {
        WEBHOOK_PREFIXES
            .iter()
            .any(|prefix| recipient.starts_with(prefix) && recipient.len() > prefix.len())
    }

    fn build_body(&self, request: &DeliveryRequest) -> serde_json::Value {
        let title = request
            .metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Notification");
        let color = match request.metadata.get("severity").and_then(|v| v.as_str()) {
            Some("critical") => 0xE74C3C,
            Some("warning") => 0xF39C12,
            _ => 0x5865F2,
        };

        serde_json::json!({
            "username": self.username,
            "allowed_mentions": { "parse": ["users", "roles"] },
            "embeds": [{
                "title": title,
                "description": truncate(&request.content, MAX_DESCRIPTION_LEN),
                "color": color,
                "timestamp": Utc::now().to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl DeliveryProvider for DiscordWebhookProvider {
    fn name(&self) -> &'static str {
        "discord_webhook"
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        if !Self::is_webhook_url(&request.recipient) {
            return Err(DeliveryError::permanent(
                "invalid_recipient",
                format!("'{}' is not a Discord webhook URL", redact(&request.recipient)),
            ));
        }

        let separator = if request.recipient.contains('?') { '&' } else { '?' };
        let url = format!("{}{}wait=true", request.recipient, separator);

        let resp = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        // A 2xx without a parseable body still means Discord accepted the message.
        let message_id = resp.json::<WebhookMessage>().await.ok().map(|m| m.id);

        tracing::debug!(message_id = ?message_id, "Discord webhook message delivered");

        Ok(DeliveryReceipt {
            message_id,
            delivered_at: Utc::now(),
            provider: self.name().to_string(),
        })
    }
}

/// Map a non-success webhook status onto a delivery error.
///
/// Unknown/deleted webhooks and malformed payloads cannot succeed on retry;
/// rate limits and server errors can.
pub fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let detail = format!("Discord webhook error {}: {}", status, truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::transient("rate_limited", detail),
        StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::permanent("invalid_recipient", detail)
        }
        s if s.is_server_error() => DeliveryError::transient("provider_unavailable", detail),
        s if s.is_client_error() => DeliveryError::permanent("rejected", detail),
        _ => DeliveryError::transient("unexpected_status", detail),
    }
}

/// The request URL carries the webhook token, so it is stripped before the
/// error text reaches logs or `last_error`.
fn classify_transport_error(err: reqwest::Error) -> DeliveryError {
    let err = err.without_url();
    if err.is_builder() {
        DeliveryError::permanent("invalid_request", format!("Discord send failed: {err}"))
    } else if err.is_timeout() {
        DeliveryError::transient("timeout", format!("Discord send timed out: {err}"))
    } else {
        DeliveryError::transient("network", format!("Discord send failed: {err}"))
    }
}

/// Webhook URLs embed a secret token; keep it out of persisted errors.
fn redact(recipient: &str) -> String {
    match recipient.rsplit_once('/') {
        Some((head, _)) if recipient.contains("/webhooks/") => format!("{head}/***"),
        _ => recipient.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
