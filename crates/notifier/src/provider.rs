//! Delivery provider abstraction.
//!
//! A provider takes a rendered payload plus recipient and reports either a
//! receipt or a typed error. The `permanent` flag on [`DeliveryError`] is the
//! only thing the retry machinery looks at: permanent errors end the record,
//! everything else is retried.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use herald_common::types::{DeliveryChannel, DeliveryReceipt};

/// A rendered notification ready to hand to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRequest {
    pub channel: DeliveryChannel,
    pub recipient: String,
    pub content: String,
    /// Channel-specific extras (title, severity, notification id).
    pub metadata: serde_json::Value,
}

/// Failure reported by a delivery provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct DeliveryError {
    /// Short machine-readable code (e.g. `invalid_recipient`, `rate_limited`).
    pub code: String,
    /// Human-readable explanation, persisted on the record for terminal failures.
    pub message: String,
    /// `true` when retrying cannot help.
    pub permanent: bool,
}

impl DeliveryError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            permanent: true,
        }
    }
}

/// Trait every delivery channel implementation must provide.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Human-readable provider name, recorded in receipts and logs.
    fn name(&self) -> &'static str;

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Routes each request to the provider registered for its channel.
#[derive(Default)]
pub struct ChannelRouter {
    providers: HashMap<DeliveryChannel, Arc<dyn DeliveryProvider>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider for a channel.
    pub fn with_provider(mut self, channel: DeliveryChannel, provider: Arc<dyn DeliveryProvider>) -> Self {
        tracing::info!(%channel, provider = provider.name(), "Delivery provider registered");
        self.providers.insert(channel, provider);
        self
    }

    pub fn has_provider(&self, channel: DeliveryChannel) -> bool {
        self.providers.contains_key(&channel)
    }
}

#[async_trait]
impl DeliveryProvider for ChannelRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        match self.providers.get(&request.channel) {
            Some(provider) => provider.send(request).await,
            None => Err(DeliveryError::permanent(
                "no_provider",
                format!("No delivery provider configured for channel '{}'", request.channel),
            )),
        }
    }
}
