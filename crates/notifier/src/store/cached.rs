//! Redis read-through cache in front of another record store.
//!
//! Only `find_by_id` is cached (`notification:{id}`, JSON, with a TTL). Every
//! write invalidates the key. Candidate queries bypass the cache entirely.
//! Redis errors are logged and the inner store answers instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryReceipt, NewNotification, NotificationFilter, NotificationRecord, NotificationStatus,
};

use super::NotificationStore;

pub struct CachedNotificationStore<S> {
    inner: S,
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl<S: NotificationStore> CachedNotificationStore<S> {
    pub fn new(inner: S, redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            inner,
            redis,
            ttl_secs: ttl_secs.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn key(id: Uuid) -> String {
        format!("notification:{}", id)
    }

    async fn cached(&self, id: Uuid) -> Option<NotificationRecord> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = match conn.get::<_, Option<String>>(Self::key(id)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Notification cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw?) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Discarding undecodable cache entry");
                self.invalidate(id).await;
                None
            }
        }
    }

    async fn store(&self, record: &NotificationRecord) {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(notification_id = %record.id, error = %e, "Notification cache encode failed");
                return;
            }
        };

        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::key(record.id), payload, self.ttl_secs)
            .await
        {
            tracing::warn!(notification_id = %record.id, error = %e, "Notification cache write failed");
        }
    }

    async fn invalidate(&self, id: Uuid) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, ()>(Self::key(id)).await {
            tracing::warn!(notification_id = %id, error = %e, "Notification cache invalidation failed");
        }
    }
}

#[async_trait]
impl<S: NotificationStore> NotificationStore for CachedNotificationStore<S> {
    async fn insert(&self, new: NewNotification) -> Result<NotificationRecord, AppError> {
        self.inner.insert(new).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        if let Some(record) = self.cached(id).await {
            tracing::debug!(notification_id = %id, "Notification cache hit");
            return Ok(Some(record));
        }

        let record = self.inner.find_by_id(id).await?;
        if let Some(record) = &record {
            self.store(record).await;
        }
        Ok(record)
    }

    async fn find_pending_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRecord>, AppError> {
        self.inner.find_pending_due(now).await
    }

    async fn find_retryable(&self, max_retries: u32) -> Result<Vec<NotificationRecord>, AppError> {
        self.inner.find_retryable(max_retries).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        message: Option<&str>,
    ) -> Result<(), AppError> {
        let result = self.inner.update_status(id, status, message).await;
        self.invalidate(id).await;
        result
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<u32, AppError> {
        let result = self.inner.increment_retry_count(id).await;
        self.invalidate(id).await;
        result
    }

    async fn claim(&self, observed: &NotificationRecord) -> Result<Option<NotificationRecord>, AppError> {
        let result = self.inner.claim(observed).await;
        self.invalidate(observed.id).await;
        result
    }

    async fn record_transient_failure(&self, id: Uuid, max_retries: u32) -> Result<NotificationRecord, AppError> {
        let result = self.inner.record_transient_failure(id, max_retries).await;
        self.invalidate(id).await;
        result
    }

    // Released records drop out of the cache by TTL, like cleanup.
    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        self.inner.release_stale_claims(before).await
    }

    async fn mark_delivered(&self, id: Uuid, receipt: &DeliveryReceipt) -> Result<(), AppError> {
        let result = self.inner.mark_delivered(id, receipt).await;
        self.invalidate(id).await;
        result
    }

    async fn find_by_filters(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, AppError> {
        self.inner.find_by_filters(filter).await
    }

    // Removed records simply age out of the cache.
    async fn cleanup_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        self.inner.cleanup_before(before).await
    }
}
