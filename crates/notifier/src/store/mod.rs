//! Persistence for notification records.

mod cached;
mod memory;
mod postgres;

pub use cached::CachedNotificationStore;
pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryReceipt, NewNotification, NotificationFilter, NotificationRecord, NotificationStatus,
};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new `Pending` record.
    async fn insert(&self, new: NewNotification) -> Result<NotificationRecord, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError>;

    /// `Pending` records with `scheduled_for <= now`, oldest first.
    async fn find_pending_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRecord>, AppError>;

    /// `Failed` records with `retry_count < max_retries`.
    async fn find_retryable(&self, max_retries: u32) -> Result<Vec<NotificationRecord>, AppError>;

    /// Set status and `last_error`. Errors with `NotFound` for unknown ids.
    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        message: Option<&str>,
    ) -> Result<(), AppError>;

    /// Bump `retry_count` and stamp `last_attempt`; returns the new count.
    async fn increment_retry_count(&self, id: Uuid) -> Result<u32, AppError>;

    /// Move `observed` to `Processing`, but only if the stored record is still
    /// `Pending` or `Failed` and unchanged since it was read (same status and
    /// `updated_at`). Returns the claimed record, or `None` if another attempt
    /// got there first or the record is gone.
    async fn claim(&self, observed: &NotificationRecord) -> Result<Option<NotificationRecord>, AppError>;

    /// Record one transient delivery failure in a single write: bump
    /// `retry_count`, stamp `last_attempt`, and set `PermanentlyFailed`
    /// ([`MAX_RETRIES_MESSAGE`]) once the count reaches `max_retries`, else
    /// `Failed` ([`TEMPORARY_FAILURE_MESSAGE`]).
    ///
    /// [`MAX_RETRIES_MESSAGE`]: crate::dispatcher::MAX_RETRIES_MESSAGE
    /// [`TEMPORARY_FAILURE_MESSAGE`]: crate::dispatcher::TEMPORARY_FAILURE_MESSAGE
    async fn record_transient_failure(&self, id: Uuid, max_retries: u32) -> Result<NotificationRecord, AppError>;

    /// Return `Processing` records last touched before `before` to `Failed`
    /// ([`INTERRUPTED_MESSAGE`]) so an attempt lost to a crash is retried
    /// after backoff. Returns how many were released.
    ///
    /// [`INTERRUPTED_MESSAGE`]: crate::dispatcher::INTERRUPTED_MESSAGE
    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, AppError>;

    /// Mark `Sent`, store the receipt, stamp `last_attempt`, clear `last_error`.
    async fn mark_delivered(&self, id: Uuid, receipt: &DeliveryReceipt) -> Result<(), AppError>;

    async fn find_by_filters(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, AppError>;

    /// Delete terminal records last updated before `before`; returns how many.
    async fn cleanup_before(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}
