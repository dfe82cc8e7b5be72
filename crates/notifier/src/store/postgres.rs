use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryReceipt, NewNotification, NotificationFilter, NotificationRecord, NotificationStatus,
};

use super::NotificationStore;
use crate::dispatcher::{INTERRUPTED_MESSAGE, MAX_RETRIES_MESSAGE, TEMPORARY_FAILURE_MESSAGE};

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn not_found(id: Uuid) -> AppError {
        AppError::NotFound(format!("Notification {} not found", id))
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, new: NewNotification) -> Result<NotificationRecord, AppError> {
        let record: NotificationRecord = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, template, data, channel, recipient, server_id, scheduled_for, status,
                 is_recurring, recurrence_pattern, recurrence_end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.template)
        .bind(Json(&new.data))
        .bind(new.channel.to_string())
        .bind(&new.recipient)
        .bind(&new.server_id)
        .bind(new.scheduled_for)
        .bind(NotificationStatus::Pending.to_string())
        .bind(new.is_recurring)
        .bind(&new.recurrence_pattern)
        .bind(new.recurrence_end_date)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            notification_id = %record.id,
            template = %record.template,
            channel = %record.channel,
            scheduled_for = %record.scheduled_for,
            "Notification created"
        );

        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        let record = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_pending_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn find_retryable(&self, max_retries: u32) -> Result<Vec<NotificationRecord>, AppError> {
        let max = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let records = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE status = 'failed' AND retry_count < $1
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(max)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        message: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, last_error = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.to_string())
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(id));
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<u32, AppError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE notifications
            SET retry_count = retry_count + 1, last_attempt = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|c| c.max(0) as u32)
            .ok_or_else(|| Self::not_found(id))
    }

    async fn claim(&self, observed: &NotificationRecord) -> Result<Option<NotificationRecord>, AppError> {
        let claimed = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1
              AND status = $2
              AND status IN ('pending', 'failed')
              AND updated_at = $3
            RETURNING *
            "#,
        )
        .bind(observed.id)
        .bind(observed.status.to_string())
        .bind(observed.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn record_transient_failure(&self, id: Uuid, max_retries: u32) -> Result<NotificationRecord, AppError> {
        let max = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let record: Option<NotificationRecord> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET retry_count = retry_count + 1,
                last_attempt = NOW(),
                status = CASE WHEN retry_count + 1 >= $2 THEN 'permanently_failed' ELSE 'failed' END,
                last_error = CASE WHEN retry_count + 1 >= $2 THEN $3 ELSE $4 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(max)
        .bind(MAX_RETRIES_MESSAGE)
        .bind(TEMPORARY_FAILURE_MESSAGE)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| Self::not_found(id))
    }

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed', last_error = $1, last_attempt = NOW(), updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $2
            "#,
        )
        .bind(INTERRUPTED_MESSAGE)
        .bind(before)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            tracing::warn!(released, before = %before, "Released stale notification claims");
        }
        Ok(released)
    }

    async fn mark_delivered(&self, id: Uuid, receipt: &DeliveryReceipt) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'sent', delivery_result = $1, last_attempt = NOW(),
                last_error = NULL, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(Json(receipt))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(id));
        }
        Ok(())
    }

    async fn find_by_filters(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR channel = $2)
              AND ($3::text IS NULL OR recipient = $3)
              AND ($4::text IS NULL OR server_id = $4)
              AND ($5::text IS NULL OR template = $5)
              AND ($6::timestamptz IS NULL OR scheduled_for >= $6)
              AND ($7::timestamptz IS NULL OR scheduled_for <= $7)
            ORDER BY scheduled_for DESC
            LIMIT $8
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.channel.map(|c| c.to_string()))
        .bind(&filter.recipient)
        .bind(&filter.server_id)
        .bind(&filter.template)
        .bind(filter.scheduled_from)
        .bind(filter.scheduled_to)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn cleanup_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE status IN ('sent', 'permanently_failed', 'error')
              AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, before = %before, "Old notifications cleaned up");
        }
        Ok(removed)
    }
}
