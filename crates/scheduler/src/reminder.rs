//! Reminder scheduler.
//!
//! Every tick loads due schedules, emits a [`DueSignal`] for each, then deletes
//! one-shot schedules and moves repeating ones to their next local fire time.
//! Schedules are handled one at a time; a failing row is logged and skipped.
//! A row whose frequency cannot be parsed can never fire and is deleted the
//! first time it is seen.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use herald_common::error::AppError;
use herald_common::types::{DueSignal, Frequency, NewReminder, ReminderSchedule};

use crate::calendar;
use crate::error::ScheduleError;
use crate::store::ScheduleStore;

/// Per-tick counts, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerTickReport {
    pub due: usize,
    pub emitted: usize,
    /// Signals emitted with nobody listening.
    pub dropped: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

pub struct ReminderScheduler {
    store: Arc<dyn ScheduleStore>,
    signals: mpsc::Sender<DueSignal>,
    timezone: Tz,
    tick_interval: Duration,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        signals: mpsc::Sender<DueSignal>,
        timezone: Tz,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            signals,
            timezone,
            tick_interval,
        }
    }

    pub async fn schedule_reminder(
        &self,
        task_id: &str,
        server_id: &str,
        scheduled_for: DateTime<Utc>,
        frequency: Frequency,
    ) -> Result<ReminderSchedule, AppError> {
        if task_id.trim().is_empty() {
            return Err(AppError::Validation("task_id must not be empty".to_string()));
        }
        if server_id.trim().is_empty() {
            return Err(AppError::Validation("server_id must not be empty".to_string()));
        }

        let schedule = self
            .store
            .insert(NewReminder {
                task_id: task_id.to_string(),
                server_id: server_id.to_string(),
                scheduled_for,
                frequency,
            })
            .await?;

        tracing::info!(
            schedule_id = %schedule.id,
            task_id = %schedule.task_id,
            server_id = %schedule.server_id,
            frequency = %frequency,
            scheduled_for = %schedule.scheduled_for,
            "Reminder scheduled"
        );

        Ok(schedule)
    }

    /// Remove every schedule for a task; returns how many were removed.
    pub async fn cancel_reminder(&self, task_id: &str) -> Result<u64, AppError> {
        let removed = self.store.delete_by_task(task_id).await?;
        tracing::info!(task_id, removed, "Reminders cancelled");
        Ok(removed)
    }

    pub async fn list_reminders(&self, task_id: &str) -> Result<Vec<ReminderSchedule>, AppError> {
        self.store.find_by_task(task_id).await
    }

    /// Fire every schedule due at `now`.
    ///
    /// Only a failure to load due schedules is returned as an error.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SchedulerTickReport, AppError> {
        let due = self.store.find_due(now).await?;
        let mut report = SchedulerTickReport {
            due: due.len(),
            ..Default::default()
        };

        for schedule in &due {
            if let Err(e) = self.fire(schedule, now, &mut report).await {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    task_id = %schedule.task_id,
                    error = %e,
                    "Failed to process reminder schedule"
                );
                report.failed += 1;
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                emitted = report.emitted,
                completed = report.completed,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Scheduler tick complete"
            );
        }

        Ok(report)
    }

    async fn fire(
        &self,
        schedule: &ReminderSchedule,
        now: DateTime<Utc>,
        report: &mut SchedulerTickReport,
    ) -> Result<(), ScheduleError> {
        let Ok(frequency) = schedule.frequency.parse::<Frequency>() else {
            self.store.delete(schedule.id).await?;
            return Err(ScheduleError::UnknownFrequency(schedule.frequency.clone()));
        };

        let signal = DueSignal {
            task_id: schedule.task_id.clone(),
            schedule_id: schedule.id,
            server_id: schedule.server_id.clone(),
            timestamp: now,
        };
        match self.signals.send(signal).await {
            Ok(()) => report.emitted += 1,
            Err(_) => {
                tracing::warn!(schedule_id = %schedule.id, "Due signal receiver closed, signal dropped");
                report.dropped += 1;
            }
        }

        match calendar::advance(frequency, schedule.scheduled_for, self.timezone)? {
            None => {
                self.store.delete(schedule.id).await?;
                report.completed += 1;
            }
            Some(next) => {
                self.store.reschedule(schedule.id, next).await?;
                tracing::debug!(schedule_id = %schedule.id, next = %next, "Reminder rescheduled");
                report.rescheduled += 1;
            }
        }

        Ok(())
    }

    /// Poll for due schedules until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            timezone = %self.timezone,
            "Reminder scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reminder scheduler stopped");
    }
}
