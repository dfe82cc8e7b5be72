//! Reminder scheduling for the Herald bot.
//!
//! The scheduler owns `reminder_schedules` and only ever emits
//! [`DueSignal`](herald_common::types::DueSignal)s; turning a signal into a
//! notification is the notifier's job.

pub mod calendar;
pub mod error;
pub mod reminder;
pub mod store;

pub use error::ScheduleError;
pub use reminder::{ReminderScheduler, SchedulerTickReport};
pub use store::ScheduleStore;
