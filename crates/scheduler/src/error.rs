use thiserror::Error;

use herald_common::error::AppError;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Unknown reminder frequency '{0}', schedule discarded")]
    UnknownFrequency(String),

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("Cannot advance {from} by {days} day(s) in {timezone}")]
    InvalidLocalTime {
        from: String,
        days: u64,
        timezone: String,
    },

    #[error(transparent)]
    Store(#[from] AppError),
}
