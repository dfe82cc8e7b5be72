//! Notification dispatcher: the persisted retry state machine.
//!
//! Each tick:
//! 1. Loads due `Pending` records and retryable `Failed` records
//! 2. Drops anything still inside its backoff window
//! 3. Claims each survivor (`Processing`), skipping records another attempt
//!    already owns or that changed since they were read
//! 4. Renders each claimed record, marking render failures as `Error`
//! 5. Sends the rendered set through the batcher
//! 6. Persists one transition per record, scheduling the next occurrence of
//!    recurring notifications after a successful send
//!
//! A failure on one record is logged and never aborts the rest of the tick.
//! Claims left behind by a crashed attempt are released back to `Failed`
//! once they are older than [`STALE_CLAIM_AFTER_MINUTES`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryReceipt, NewNotification, NotificationData, NotificationRecord, NotificationStatus,
};

use crate::backoff::RetryPolicy;
use crate::batcher::{BatchItem, DispatchBatcher, DispatchError};
use crate::provider::DeliveryRequest;
use crate::recurrence::RecurrencePattern;
use crate::renderer::TemplateRenderer;
use crate::store::NotificationStore;

pub const RENDER_FAILED_MESSAGE: &str = "Template rendering failed";
pub const MAX_RETRIES_MESSAGE: &str = "Max retry attempts reached";
pub const TEMPORARY_FAILURE_MESSAGE: &str = "Temporary delivery failure - will retry";
pub const INTERRUPTED_MESSAGE: &str = "Delivery interrupted - will retry";

/// Minutes a claim may be held before it is presumed lost. Well above the
/// longest attempt (HTTP timeout plus in-memory retries).
pub const STALE_CLAIM_AFTER_MINUTES: i64 = 10;

/// What happened to a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Transient failure; the record is `Failed` and will be retried.
    Retrying,
    PermanentlyFailed,
    /// Rendering failed; the record is `Error`.
    Errored,
    /// Terminal record, or another attempt owns it; nothing to do.
    Skipped,
}

/// Per-tick counts, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub candidates: usize,
    pub gated: usize,
    /// Candidates another attempt claimed first.
    pub skipped: usize,
    pub sent: usize,
    pub retrying: usize,
    pub permanently_failed: usize,
    pub errored: usize,
    pub store_errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Retrying => self.retrying += 1,
            Outcome::PermanentlyFailed => self.permanently_failed += 1,
            Outcome::Errored => self.errored += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    renderer: Arc<dyn TemplateRenderer>,
    batcher: Arc<DispatchBatcher>,
    policy: RetryPolicy,
    tick_interval: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        renderer: Arc<dyn TemplateRenderer>,
        batcher: Arc<DispatchBatcher>,
        policy: RetryPolicy,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            renderer,
            batcher,
            policy,
            tick_interval,
        }
    }

    pub fn should_process_notification(&self, record: &NotificationRecord, now: DateTime<Utc>) -> bool {
        self.policy.should_process(record, now)
    }

    /// Run one dispatch pass against the current time.
    pub async fn process_scheduled_notifications(&self) -> Result<TickSummary, AppError> {
        self.process_due(Utc::now()).await
    }

    /// Run one dispatch pass as of `now`.
    ///
    /// Only a failure to load candidates is returned as an error.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        if let Err(e) = self
            .store
            .release_stale_claims(now - TimeDelta::minutes(STALE_CLAIM_AFTER_MINUTES))
            .await {
            tracing::warn!(error = %e, "Failed to release stale claims");
        }

        let pending = self.store.find_pending_due(now).await?;
        let retryable = self.store.find_retryable(self.policy.max_retries).await?;

        let mut summary = TickSummary::default();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for record in pending.into_iter().chain(retryable) {
            if !seen.insert(record.id) {
                continue;
            }
            summary.candidates += 1;
            if self.should_process_notification(&record, now) {
                candidates.push(record);
            } else {
                tracing::debug!(
                    notification_id = %record.id,
                    status = %record.status,
                    retry_count = record.retry_count,
                    "Notification not yet eligible"
                );
                summary.gated += 1;
            }
        }

        if candidates.is_empty() {
            return Ok(summary);
        }

        let mut ready = Vec::with_capacity(candidates.len());
        for observed in candidates {
            let record = match self.store.claim(&observed).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::debug!(notification_id = %observed.id, "Notification claimed elsewhere, skipping");
                    summary.record(Outcome::Skipped);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(notification_id = %observed.id, error = %e, "Failed to claim notification");
                    summary.store_errors += 1;
                    continue;
                }
            };

            match self.render(&record).await {
                Some(request) => ready.push((record, request)),
                None => match self.mark_render_failed(&record).await {
                    Ok(outcome) => summary.record(outcome),
                    Err(e) => {
                        tracing::warn!(notification_id = %record.id, error = %e, "Failed to persist render failure");
                        summary.store_errors += 1;
                    }
                },
            }
        }

        let items = ready
            .iter()
            .map(|(record, request)| BatchItem {
                dispatch_id: record.id.to_string(),
                request: request.clone(),
            })
            .collect();
        let outcomes = self.batcher.dispatch_batch(items).await;

        for ((record, _), outcome) in ready.iter().zip(outcomes) {
            match self.apply_delivery(record, outcome.result).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    tracing::warn!(notification_id = %record.id, error = %e, "Failed to persist delivery outcome");
                    summary.store_errors += 1;
                }
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            skipped = summary.skipped,
            sent = summary.sent,
            retrying = summary.retrying,
            permanently_failed = summary.permanently_failed,
            errored = summary.errored,
            store_errors = summary.store_errors,
            "Dispatch tick complete"
        );

        Ok(summary)
    }

    /// Render, deliver and persist a single record, bypassing the due gate.
    ///
    /// `observed` is only acted on if the stored record still matches it; a
    /// stale or concurrently claimed copy yields [`Outcome::Skipped`].
    pub async fn process_notification(&self, observed: &NotificationRecord) -> Result<Outcome, AppError> {
        if observed.status.is_terminal() {
            tracing::debug!(notification_id = %observed.id, status = %observed.status, "Notification already terminal");
            return Ok(Outcome::Skipped);
        }

        let Some(record) = self.store.claim(observed).await? else {
            tracing::debug!(notification_id = %observed.id, "Notification changed or claimed elsewhere, skipping");
            return Ok(Outcome::Skipped);
        };

        if observed.status == NotificationStatus::Failed && self.policy.is_exhausted(record.retries()) {
            self.store
                .update_status(record.id, NotificationStatus::PermanentlyFailed, Some(MAX_RETRIES_MESSAGE))
                .await?;
            tracing::warn!(notification_id = %record.id, retry_count = record.retry_count, "Notification exhausted its retries");
            return Ok(Outcome::PermanentlyFailed);
        }

        let Some(request) = self.render(&record).await else {
            return self.mark_render_failed(&record).await;
        };

        let result = self.batcher.dispatch(&request, &record.id.to_string()).await;
        self.apply_delivery(&record, result).await
    }

    /// Persist the transition for one delivery result. `record` must be the
    /// claimed copy.
    pub async fn apply_delivery(
        &self,
        record: &NotificationRecord,
        result: Result<DeliveryReceipt, DispatchError>,
    ) -> Result<Outcome, AppError> {
        match result {
            Ok(receipt) => {
                self.store.mark_delivered(record.id, &receipt).await?;
                tracing::info!(
                    notification_id = %record.id,
                    provider = %receipt.provider,
                    message_id = ?receipt.message_id,
                    "Notification delivered"
                );

                if record.is_recurring {
                    if let Err(e) = self.schedule_next_occurrence(record, Utc::now()).await {
                        tracing::warn!(notification_id = %record.id, error = %e, "Failed to schedule next occurrence");
                    }
                }
                Ok(Outcome::Sent)
            }
            Err(DispatchError::Permanent(e)) => {
                self.store
                    .update_status(record.id, NotificationStatus::PermanentlyFailed, Some(&e.message))
                    .await?;
                tracing::warn!(notification_id = %record.id, code = %e.code, error = %e.message, "Notification permanently failed");
                Ok(Outcome::PermanentlyFailed)
            }
            Err(DispatchError::RetriesExhausted { attempts, last }) => {
                let updated = self
                    .store
                    .record_transient_failure(record.id, self.policy.max_retries)
                    .await?;
                let retry_count = updated.retries();

                if updated.status == NotificationStatus::PermanentlyFailed {
                    tracing::warn!(
                        notification_id = %record.id,
                        retry_count,
                        error = %last,
                        "Notification exhausted its retries"
                    );
                    return Ok(Outcome::PermanentlyFailed);
                }

                tracing::info!(
                    notification_id = %record.id,
                    retry_count,
                    attempts,
                    next_delay_secs = self.policy.delay_for(retry_count).as_secs(),
                    error = %last,
                    "Notification delivery failed, will retry"
                );
                Ok(Outcome::Retrying)
            }
        }
    }

    /// Insert the next occurrence of a delivered recurring notification.
    ///
    /// Returns `None` when the record does not recur, its pattern is invalid,
    /// or the next occurrence would fall after the end date.
    pub async fn schedule_next_occurrence(
        &self,
        record: &NotificationRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let Some(raw) = record.recurrence_pattern.as_deref().filter(|_| record.is_recurring) else {
            return Ok(None);
        };

        if record.recurrence_end_date.is_some_and(|end| end <= now) {
            tracing::debug!(notification_id = %record.id, "Recurrence ended");
            return Ok(None);
        }

        let pattern: RecurrencePattern = match raw.parse() {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::warn!(notification_id = %record.id, error = %e, "Invalid recurrence pattern, not rescheduling");
                return Ok(None);
            }
        };

        let next = match pattern.next_after_now(record.scheduled_for, now) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(notification_id = %record.id, error = %e, "No next occurrence");
                return Ok(None);
            }
        };

        if record.recurrence_end_date.is_some_and(|end| next > end) {
            tracing::debug!(notification_id = %record.id, next = %next, "Next occurrence falls after end date");
            return Ok(None);
        }

        let created = self
            .store
            .insert(NewNotification::next_occurrence(record, next))
            .await?;

        tracing::info!(
            notification_id = %record.id,
            next_notification_id = %created.id,
            pattern = %pattern,
            scheduled_for = %next,
            "Next occurrence scheduled"
        );

        Ok(Some(created))
    }

    /// Poll for due notifications until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            max_retries = self.policy.max_retries,
            "Notification dispatcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_scheduled_notifications().await {
                        tracing::error!(error = %e, "Dispatch tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Notification dispatcher stopped");
    }

    async fn render(&self, record: &NotificationRecord) -> Option<DeliveryRequest> {
        match self.renderer.render(&record.template, &record.data).await {
            Ok(content) => Some(build_request(record, content)),
            Err(e) => {
                tracing::warn!(notification_id = %record.id, template = %record.template, error = %e, "Template rendering failed");
                None
            }
        }
    }

    async fn mark_render_failed(&self, record: &NotificationRecord) -> Result<Outcome, AppError> {
        self.store
            .update_status(record.id, NotificationStatus::Error, Some(RENDER_FAILED_MESSAGE))
            .await?;
        Ok(Outcome::Errored)
    }
}

fn build_request(record: &NotificationRecord, content: String) -> DeliveryRequest {
    let data = &record.data.0;
    let (title, severity) = match data {
        NotificationData::TaskReminder { .. } => ("Task Reminder".to_string(), None),
        NotificationData::TaskAssigned { .. } => ("Task Assigned".to_string(), None),
        NotificationData::TaskUpdated { .. } => ("Task Updated".to_string(), None),
        NotificationData::SystemAlert { title, severity, .. } => (title.clone(), Some(severity.to_string())),
        NotificationData::Custom { fields } => (
            fields
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("Notification")
                .to_string(),
            None,
        ),
    };

    DeliveryRequest {
        channel: record.channel,
        recipient: record.recipient.clone(),
        content,
        metadata: serde_json::json!({
            "notification_id": record.id,
            "kind": data.kind(),
            "title": title,
            "severity": severity,
        }),
    }
}
