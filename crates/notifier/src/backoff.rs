//! Persisted retry policy: a fixed backoff table plus a retry ceiling.
//!
//! The delay before the next attempt of a `Failed` record is looked up by its
//! current `retry_count`; counts past the end of the table reuse the last entry.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use herald_common::config::DispatchConfig;
use herald_common::types::{NotificationRecord, NotificationStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub schedule: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, schedule: Vec<Duration>) -> Self {
        Self {
            max_retries,
            schedule,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.max_retries, config.backoff_schedule.clone())
    }

    /// Backoff delay after `retry_count` failed attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let last = self.schedule.len().saturating_sub(1);
        let index = (retry_count as usize).min(last);
        self.schedule.get(index).copied().unwrap_or(Duration::ZERO)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Earliest instant a failed record may be retried. `None` when it has
    /// never been attempted or the delay overflows the calendar.
    pub fn retry_at(&self, record: &NotificationRecord) -> Option<DateTime<Utc>> {
        let last = record.last_attempt?;
        let delay = TimeDelta::from_std(self.delay_for(record.retries())).ok()?;
        last.checked_add_signed(delay)
    }

    /// Whether `record` should be attempted at `now`.
    pub fn should_process(&self, record: &NotificationRecord, now: DateTime<Utc>) -> bool {
        if record.scheduled_for > now {
            return false;
        }

        match record.status {
            NotificationStatus::Pending => true,
            NotificationStatus::Failed => {
                if self.is_exhausted(record.retries()) {
                    return false;
                }
                match record.last_attempt {
                    None => true,
                    Some(_) => self.retry_at(record).is_some_and(|at| now >= at),
                }
            }
            NotificationStatus::Processing
            | NotificationStatus::Sent
            | NotificationStatus::PermanentlyFailed
            | NotificationStatus::Error => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}
