//! Batched delivery with a short-lived in-memory retry queue.
//!
//! `dispatch` retries transient failures a few times with a flat delay before
//! giving up. All of that happens inside a single persisted attempt: the
//! dispatcher only ever sees the final outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;

use herald_common::config::DispatchConfig;
use herald_common::types::DeliveryReceipt;

use crate::provider::{DeliveryError, DeliveryProvider, DeliveryRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl BatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay,
            retry_delay: config.inmem_retry_delay,
            max_retries: config.inmem_max_retries,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// A send that failed transiently and is waiting for its next in-memory retry.
#[derive(Debug, Clone)]
pub struct RetryQueueEntry {
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub request: DeliveryRequest,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Permanent delivery failure: {0}")]
    Permanent(DeliveryError),

    #[error("Delivery failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DeliveryError },
}

impl DispatchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DispatchError::Permanent(_))
    }

    /// The provider error behind this failure.
    pub fn delivery_error(&self) -> &DeliveryError {
        match self {
            DispatchError::Permanent(e) => e,
            DispatchError::RetriesExhausted { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub dispatch_id: String,
    pub request: DeliveryRequest,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub dispatch_id: String,
    pub result: Result<DeliveryReceipt, DispatchError>,
}

pub struct DispatchBatcher {
    provider: Arc<dyn DeliveryProvider>,
    settings: BatchSettings,
    retry_queue: DashMap<String, RetryQueueEntry>,
}

impl DispatchBatcher {
    pub fn new(provider: Arc<dyn DeliveryProvider>, settings: BatchSettings) -> Self {
        Self {
            provider,
            settings,
            retry_queue: DashMap::new(),
        }
    }

    /// Sends waiting for an in-memory retry.
    pub fn pending_retries(&self) -> usize {
        self.retry_queue.len()
    }

    /// Send one request, retrying transient failures in memory.
    pub async fn dispatch(
        &self,
        request: &DeliveryRequest,
        dispatch_id: &str,
    ) -> Result<DeliveryReceipt, DispatchError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.provider.send(request).await {
                Ok(receipt) => {
                    self.retry_queue.remove(dispatch_id);
                    if attempts > 1 {
                        tracing::info!(dispatch_id, attempts, "Delivery succeeded after in-memory retry");
                    }
                    return Ok(receipt);
                }
                Err(e) if e.permanent => {
                    self.retry_queue.remove(dispatch_id);
                    tracing::warn!(dispatch_id, code = %e.code, error = %e.message, "Permanent delivery failure");
                    return Err(DispatchError::Permanent(e));
                }
                Err(e) => {
                    let retries_used = attempts - 1;
                    if retries_used >= self.settings.max_retries {
                        self.retry_queue.remove(dispatch_id);
                        tracing::warn!(
                            dispatch_id,
                            attempts,
                            code = %e.code,
                            error = %e.message,
                            "In-memory retries exhausted"
                        );
                        return Err(DispatchError::RetriesExhausted { attempts, last: e });
                    }

                    tracing::debug!(
                        dispatch_id,
                        attempts,
                        code = %e.code,
                        delay_ms = self.settings.retry_delay.as_millis() as u64,
                        "Transient delivery failure, retrying in memory"
                    );
                    self.retry_queue.insert(
                        dispatch_id.to_string(),
                        RetryQueueEntry {
                            attempts,
                            last_attempt: Utc::now(),
                            request: request.clone(),
                        },
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
            }
        }
    }

    /// Send a set of requests in fixed-size concurrent chunks, pausing between
    /// chunks. One item's failure never affects its siblings.
    pub async fn dispatch_batch(&self, items: Vec<BatchItem>) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        let chunk_count = items.len().div_ceil(self.settings.batch_size);

        for (index, chunk) in items.chunks(self.settings.batch_size).enumerate() {
            tracing::debug!(batch = index + 1, of = chunk_count, size = chunk.len(), "Dispatching batch");

            let results = join_all(
                chunk
                    .iter()
                    .map(|item| self.dispatch(&item.request, &item.dispatch_id)),
            )
            .await;

            outcomes.extend(chunk.iter().zip(results).map(|(item, result)| BatchOutcome {
                dispatch_id: item.dispatch_id.clone(),
                result,
            }));

            if index + 1 < chunk_count && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use herald_common::types::DeliveryChannel;
    use tokio::time::Instant;

    /// Provider that replays a scripted sequence of results per recipient and
    /// records when each send happened.
    #[derive(Default)]
    struct ScriptedProvider {
        scripts: Mutex<HashMap<String, Vec<Result<(), DeliveryError>>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedProvider {
        fn script(self, recipient: &str, results: Vec<Result<(), DeliveryError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(recipient.to_string(), results);
            self
        }

        fn calls_for(&self, recipient: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _)| r == recipient)
                .count()
        }
    }

    #[async_trait]
    impl DeliveryProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.recipient.clone(), Instant::now()));

            let next = {
                let mut scripts = self.scripts.lock().unwrap();
                match scripts.get_mut(&request.recipient) {
                    Some(queue) if !queue.is_empty() => queue.remove(0),
                    _ => Ok(()),
                }
            };

            next.map(|()| DeliveryReceipt {
                message_id: Some(format!("msg-{}", request.recipient)),
                delivered_at: Utc::now(),
                provider: "scripted".to_string(),
            })
        }
    }

    fn request(recipient: &str) -> DeliveryRequest {
        DeliveryRequest {
            channel: DeliveryChannel::Chat,
            recipient: recipient.to_string(),
            content: "hello".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn item(n: usize) -> BatchItem {
        BatchItem {
            dispatch_id: format!("n{n}"),
            request: request(&format!("r{n}")),
        }
    }

    fn transient() -> Result<(), DeliveryError> {
        Err(DeliveryError::transient("rate_limited", "slow down"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_in_memory() {
        let provider = Arc::new(ScriptedProvider::default().script("r1", vec![transient(), transient()]));
        let batcher = DispatchBatcher::new(provider.clone(), BatchSettings::default());

        let started = Instant::now();
        let receipt = batcher.dispatch(&request("r1"), "n1").await.unwrap();

        assert_eq!(receipt.message_id.as_deref(), Some("msg-r1"));
        assert_eq!(provider.calls_for("r1"), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(batcher.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_three_retries() {
        let provider = Arc::new(
            ScriptedProvider::default().script("r1", vec![transient(), transient(), transient(), transient()]),
        );
        let batcher = DispatchBatcher::new(provider.clone(), BatchSettings::default());

        let err = batcher.dispatch(&request("r1"), "n1").await.unwrap_err();
        match err {
            DispatchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last.code, "rate_limited");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.calls_for("r1"), 4);
        assert_eq!(batcher.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::default().script("r1", vec![Err(DeliveryError::permanent("invalid_recipient", "gone"))]),
        );
        let batcher = DispatchBatcher::new(provider.clone(), BatchSettings::default());

        let err = batcher.dispatch(&request("r1"), "n1").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.delivery_error().code, "invalid_recipient");
        assert_eq!(provider.calls_for("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_retries_disabled() {
        let provider = Arc::new(ScriptedProvider::default().script("r1", vec![transient()]));
        let settings = BatchSettings {
            max_retries: 0,
            ..Default::default()
        };
        let batcher = DispatchBatcher::new(provider.clone(), settings);

        let err = batcher.dispatch(&request("r1"), "n1").await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(provider.calls_for("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_items_go_out_in_three_batches() {
        let provider = Arc::new(ScriptedProvider::default());
        let batcher = DispatchBatcher::new(provider.clone(), BatchSettings::default());

        let started = Instant::now();
        let outcomes = batcher.dispatch_batch((0..12).map(item).collect()).await;

        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        // No trailing delay after the last batch.
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        let calls = provider.calls.lock().unwrap();
        let offsets: Vec<u64> = calls
            .iter()
            .map(|(_, at)| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets.iter().filter(|&&s| s == 0).count(), 5);
        assert_eq!(offsets.iter().filter(|&&s| s == 1).count(), 5);
        assert_eq!(offsets.iter().filter(|&&s| s == 2).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_does_not_block_siblings() {
        let provider = Arc::new(
            ScriptedProvider::default().script("r3", vec![Err(DeliveryError::permanent("rejected", "bad payload"))]),
        );
        let batcher = DispatchBatcher::new(provider.clone(), BatchSettings::default());

        let outcomes = batcher.dispatch_batch((0..12).map(item).collect()).await;

        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.dispatch_id.as_str())
            .collect();
        assert_eq!(failed, vec!["n3"]);
        assert_eq!(outcomes.iter().filter(|o| o.result.is_ok()).count(), 11);
        // Outcomes come back in input order.
        assert_eq!(outcomes[3].dispatch_id, "n3");
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let batcher = DispatchBatcher::new(Arc::new(ScriptedProvider::default()), BatchSettings::default());
        assert!(batcher.dispatch_batch(Vec::new()).await.is_empty());
    }
}
