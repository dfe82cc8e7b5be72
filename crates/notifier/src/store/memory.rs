use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryReceipt, NewNotification, NotificationFilter, NotificationRecord, NotificationStatus,
};

use super::NotificationStore;
use crate::dispatcher::{INTERRUPTED_MESSAGE, MAX_RETRIES_MESSAGE, TEMPORARY_FAILURE_MESSAGE};

/// In-process record store for tests and local development.
#[derive(Default)]
pub struct MemoryNotificationStore {
    records: DashMap<Uuid, NotificationRecord>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed record, bypassing the `Pending` defaults.
    pub fn put(&self, record: NotificationRecord) {
        self.records.insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records sorted by `scheduled_for`.
    pub fn all(&self) -> Vec<NotificationRecord> {
        self.collect(|_| true)
    }

    fn collect(&self, keep: impl Fn(&NotificationRecord) -> bool) -> Vec<NotificationRecord> {
        let mut out: Vec<NotificationRecord> = self
            .records
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|r| r.scheduled_for);
        out
    }

    /// Apply `f` and stamp `updated_at`; returns the updated record.
    fn modify(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut NotificationRecord),
    ) -> Result<NotificationRecord, AppError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        f(record.value_mut());
        record.updated_at = Utc::now();
        Ok(record.value().clone())
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, new: NewNotification) -> Result<NotificationRecord, AppError> {
        let record = NotificationRecord::from_new(new, Utc::now());
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn find_pending_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRecord>, AppError> {
        Ok(self.collect(|r| r.status == NotificationStatus::Pending && r.scheduled_for <= now))
    }

    async fn find_retryable(&self, max_retries: u32) -> Result<Vec<NotificationRecord>, AppError> {
        Ok(self.collect(|r| r.status == NotificationStatus::Failed && r.retries() < max_retries))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        message: Option<&str>,
    ) -> Result<(), AppError> {
        self.modify(id, |r| {
            r.status = status;
            r.last_error = message.map(str::to_string);
        })?;
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<u32, AppError> {
        let record = self.modify(id, |r| {
            r.retry_count += 1;
            r.last_attempt = Some(Utc::now());
        })?;
        Ok(record.retries())
    }

    async fn claim(&self, observed: &NotificationRecord) -> Result<Option<NotificationRecord>, AppError> {
        let Some(mut record) = self.records.get_mut(&observed.id) else {
            return Ok(None);
        };

        let claimable = matches!(
            record.status,
            NotificationStatus::Pending | NotificationStatus::Failed
        );
        if !claimable || record.status != observed.status || record.updated_at != observed.updated_at {
            return Ok(None);
        }

        record.status = NotificationStatus::Processing;
        record.updated_at = Utc::now();
        Ok(Some(record.value().clone()))
    }

    async fn record_transient_failure(&self, id: Uuid, max_retries: u32) -> Result<NotificationRecord, AppError> {
        self.modify(id, |r| {
            r.retry_count += 1;
            r.last_attempt = Some(Utc::now());
            if r.retries() >= max_retries {
                r.status = NotificationStatus::PermanentlyFailed;
                r.last_error = Some(MAX_RETRIES_MESSAGE.to_string());
            } else {
                r.status = NotificationStatus::Failed;
                r.last_error = Some(TEMPORARY_FAILURE_MESSAGE.to_string());
            }
        })
    }

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut released = 0;
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.status == NotificationStatus::Processing && record.updated_at < before {
                record.status = NotificationStatus::Failed;
                record.last_error = Some(INTERRUPTED_MESSAGE.to_string());
                record.last_attempt = Some(now);
                record.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_delivered(&self, id: Uuid, receipt: &DeliveryReceipt) -> Result<(), AppError> {
        self.modify(id, |r| {
            r.status = NotificationStatus::Sent;
            r.delivery_result = Some(Json(receipt.clone()));
            r.last_attempt = Some(Utc::now());
            r.last_error = None;
        })?;
        Ok(())
    }

    async fn find_by_filters(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, AppError> {
        let mut out = self.collect(|r| filter.matches(r));
        out.reverse();
        out.truncate(filter.effective_limit() as usize);
        Ok(out)
    }

    async fn cleanup_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let len_before = self.records.len();
        self.records
            .retain(|_, r| !(r.status.is_terminal() && r.updated_at < before));
        Ok((len_before - self.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use herald_common::types::{DeliveryChannel, NotificationData};

    fn new_notification(offset_mins: i64) -> NewNotification {
        NewNotification {
            template: "task_reminder".to_string(),
            data: NotificationData::TaskReminder {
                task_id: "1".to_string(),
                task_title: "Triage".to_string(),
                due_date: None,
                server_id: None,
            },
            channel: DeliveryChannel::Chat,
            recipient: "https://discord.com/api/webhooks/1/x".to_string(),
            server_id: Some("guild-1".to_string()),
            scheduled_for: Utc::now() + Duration::minutes(offset_mins),
            is_recurring: false,
            recurrence_pattern: None,
            recurrence_end_date: None,
        }
    }

    #[tokio::test]
    async fn test_pending_due_excludes_future() {
        let store = MemoryNotificationStore::new();
        let due = store.insert(new_notification(-5)).await.unwrap();
        store.insert(new_notification(30)).await.unwrap();

        let found = store.find_pending_due(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_retryable_respects_ceiling() {
        let store = MemoryNotificationStore::new();
        let a = store.insert(new_notification(-5)).await.unwrap();
        let b = store.insert(new_notification(-5)).await.unwrap();
        store.update_status(a.id, NotificationStatus::Failed, Some("x")).await.unwrap();
        store.update_status(b.id, NotificationStatus::Failed, Some("x")).await.unwrap();
        for _ in 0..5 {
            store.increment_retry_count(b.id).await.unwrap();
        }

        let found = store.find_retryable(5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn test_mark_delivered_clears_error() {
        let store = MemoryNotificationStore::new();
        let record = store.insert(new_notification(-1)).await.unwrap();
        store
            .update_status(record.id, NotificationStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let receipt = DeliveryReceipt {
            message_id: Some("m1".to_string()),
            delivered_at: Utc::now(),
            provider: "test".to_string(),
        };
        store.mark_delivered(record.id, &receipt).await.unwrap();

        let stored = store.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.last_error.is_none());
        assert!(stored.last_attempt.is_some());
        assert_eq!(stored.delivery_result.unwrap().0, receipt);
    }

    #[tokio::test]
    async fn test_claim_only_matches_unchanged_record() {
        let store = MemoryNotificationStore::new();
        let record = store.insert(new_notification(-1)).await.unwrap();

        let claimed = store.claim(&record).await.unwrap().unwrap();
        assert_eq!(claimed.status, NotificationStatus::Processing);
        assert!(store.claim(&record).await.unwrap().is_none());
        assert!(store.claim(&claimed).await.unwrap().is_none());

        let mut missing = record.clone();
        missing.id = Uuid::new_v4();
        assert!(store.claim(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_is_one_write() {
        let store = MemoryNotificationStore::new();
        let record = store.insert(new_notification(-1)).await.unwrap();

        let first = store.record_transient_failure(record.id, 2).await.unwrap();
        assert_eq!(first.status, NotificationStatus::Failed);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.last_error.as_deref(), Some(TEMPORARY_FAILURE_MESSAGE));

        let second = store.record_transient_failure(record.id, 2).await.unwrap();
        assert_eq!(second.status, NotificationStatus::PermanentlyFailed);
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.last_error.as_deref(), Some(MAX_RETRIES_MESSAGE));
        assert_eq!(store.find_by_id(record.id).await.unwrap().unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let store = MemoryNotificationStore::new();
        let err = store
            .update_status(Uuid::new_v4(), NotificationStatus::Sent, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_terminal_records() {
        let store = MemoryNotificationStore::new();
        let sent = store.insert(new_notification(-60)).await.unwrap();
        let pending = store.insert(new_notification(-60)).await.unwrap();
        store.update_status(sent.id, NotificationStatus::Sent, None).await.unwrap();

        let removed = store.cleanup_before(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_by_id(sent.id).await.unwrap().is_none());
        assert!(store.find_by_id(pending.id).await.unwrap().is_some());
    }
}
