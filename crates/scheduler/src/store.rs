//! Persistence for reminder schedules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{NewReminder, ReminderSchedule};

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, new: NewReminder) -> Result<ReminderSchedule, AppError>;

    /// Schedules with `scheduled_for <= now`, oldest first.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ReminderSchedule>, AppError>;

    async fn find_by_task(&self, task_id: &str) -> Result<Vec<ReminderSchedule>, AppError>;

    /// Returns `true` if a schedule was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;

    async fn delete_by_task(&self, task_id: &str) -> Result<u64, AppError>;

    async fn reschedule(&self, id: Uuid, next: DateTime<Utc>) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn insert(&self, new: NewReminder) -> Result<ReminderSchedule, AppError> {
        let schedule: ReminderSchedule = sqlx::query_as(
            r#"
            INSERT INTO reminder_schedules (id, task_id, server_id, frequency, scheduled_for)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.task_id)
        .bind(&new.server_id)
        .bind(new.frequency.to_string())
        .bind(new.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        Ok(schedule)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ReminderSchedule>, AppError> {
        let schedules = sqlx::query_as(
            "SELECT * FROM reminder_schedules WHERE scheduled_for <= $1 ORDER BY scheduled_for ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Vec<ReminderSchedule>, AppError> {
        let schedules = sqlx::query_as(
            "SELECT * FROM reminder_schedules WHERE task_id = $1 ORDER BY scheduled_for ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM reminder_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_task(&self, task_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM reminder_schedules WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reschedule(&self, id: Uuid, next: DateTime<Utc>) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE reminder_schedules SET scheduled_for = $1 WHERE id = $2")
            .bind(next)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Reminder schedule {} not found", id)));
        }
        Ok(())
    }
}

/// In-process schedule store for tests and local development.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: DashMap<Uuid, ReminderSchedule>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing rows, including ones `insert` would never produce.
    pub fn with_schedules(schedules: impl IntoIterator<Item = ReminderSchedule>) -> Self {
        let store = Self::new();
        for schedule in schedules {
            store.schedules.insert(schedule.id, schedule);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<ReminderSchedule> {
        self.schedules.get(&id).map(|s| s.value().clone())
    }

    fn collect(&self, keep: impl Fn(&ReminderSchedule) -> bool) -> Vec<ReminderSchedule> {
        let mut out: Vec<ReminderSchedule> = self
            .schedules
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|s| s.scheduled_for);
        out
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, new: NewReminder) -> Result<ReminderSchedule, AppError> {
        let schedule = ReminderSchedule {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            server_id: new.server_id,
            frequency: new.frequency.to_string(),
            scheduled_for: new.scheduled_for,
            created_at: Utc::now(),
        };
        self.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ReminderSchedule>, AppError> {
        Ok(self.collect(|s| s.scheduled_for <= now))
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Vec<ReminderSchedule>, AppError> {
        Ok(self.collect(|s| s.task_id == task_id))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.schedules.remove(&id).is_some())
    }

    async fn delete_by_task(&self, task_id: &str) -> Result<u64, AppError> {
        let before = self.schedules.len();
        self.schedules.retain(|_, s| s.task_id != task_id);
        Ok((before - self.schedules.len()) as u64)
    }

    async fn reschedule(&self, id: Uuid, next: DateTime<Utc>) -> Result<(), AppError> {
        let mut schedule = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Reminder schedule {} not found", id)))?;
        schedule.scheduled_for = next;
        Ok(())
    }
}
