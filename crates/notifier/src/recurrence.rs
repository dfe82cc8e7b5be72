//! Recurrence patterns for repeating notifications.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, TimeDelta, Utc};
use croner::Cron;
use thiserror::Error;

/// Upper bound on how many occurrences are skipped to get past "now".
const MAX_CATCH_UP_STEPS: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("Invalid recurrence pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Recurrence pattern '{0}' has no further occurrences")]
    Exhausted(String),
}

/// `hourly`, `daily`, `weekly`, `monthly`, or a 5-field cron expression.
pub enum RecurrencePattern {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron { expression: String, schedule: Cron },
}

impl RecurrencePattern {
    /// Next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, RecurrenceError> {
        let next = match self {
            RecurrencePattern::Hourly => after.checked_add_signed(TimeDelta::hours(1)),
            RecurrencePattern::Daily => after.checked_add_signed(TimeDelta::days(1)),
            RecurrencePattern::Weekly => after.checked_add_signed(TimeDelta::weeks(1)),
            RecurrencePattern::Monthly => after.checked_add_months(Months::new(1)),
            RecurrencePattern::Cron { schedule, .. } => {
                schedule.find_next_occurrence(&after, false).ok()
            }
        };
        next.ok_or_else(|| RecurrenceError::Exhausted(self.to_string()))
    }

    /// First occurrence after `from` that is also after `now`.
    ///
    /// A recurring notification delivered late must not queue a burst of
    /// occurrences that are already due.
    pub fn next_after_now(
        &self,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        let mut next = self.next_after(from)?;
        for _ in 0..MAX_CATCH_UP_STEPS {
            if next > now {
                return Ok(next);
            }
            next = self.next_after(next)?;
        }
        // Pattern is too fine-grained to walk; jump from now instead.
        self.next_after(now)
    }
}

impl FromStr for RecurrencePattern {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "hourly" => return Ok(RecurrencePattern::Hourly),
            "daily" => return Ok(RecurrencePattern::Daily),
            "weekly" => return Ok(RecurrencePattern::Weekly),
            "monthly" => return Ok(RecurrencePattern::Monthly),
            _ => {}
        }

        if trimmed.split_whitespace().count() != 5 {
            return Err(RecurrenceError::InvalidPattern {
                pattern: s.to_string(),
                reason: "expected hourly, daily, weekly, monthly or a 5-field cron expression"
                    .to_string(),
            });
        }

        let schedule = Cron::new(trimmed)
            .parse()
            .map_err(|e| RecurrenceError::InvalidPattern {
                pattern: s.to_string(),
                reason: e.to_string(),
            })?;

        Ok(RecurrencePattern::Cron {
            expression: trimmed.to_string(),
            schedule,
        })
    }
}

impl fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecurrencePattern::Hourly => write!(f, "hourly"),
            RecurrencePattern::Daily => write!(f, "daily"),
            RecurrencePattern::Weekly => write!(f, "weekly"),
            RecurrencePattern::Monthly => write!(f, "monthly"),
            RecurrencePattern::Cron { expression, .. } => write!(f, "{expression}"),
        }
    }
}

impl fmt::Debug for RecurrencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecurrencePattern({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_parse_named_patterns() {
        assert!(matches!("Daily".parse(), Ok(RecurrencePattern::Daily)));
        assert!(matches!(" hourly".parse(), Ok(RecurrencePattern::Hourly)));
        assert!(matches!("monthly".parse(), Ok(RecurrencePattern::Monthly)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("every tuesday".parse::<RecurrencePattern>().is_err());
        assert!("".parse::<RecurrencePattern>().is_err());
        assert!("99 * * * *".parse::<RecurrencePattern>().is_err());
    }

    #[test]
    fn test_fixed_steps() {
        let from = at(2025, 1, 31, 9, 0);
        let daily: RecurrencePattern = "daily".parse().unwrap();
        let weekly: RecurrencePattern = "weekly".parse().unwrap();
        let monthly: RecurrencePattern = "monthly".parse().unwrap();

        assert_eq!(daily.next_after(from).unwrap(), at(2025, 2, 1, 9, 0));
        assert_eq!(weekly.next_after(from).unwrap(), at(2025, 2, 7, 9, 0));
        // Clamped to the last day of February.
        assert_eq!(monthly.next_after(from).unwrap(), at(2025, 2, 28, 9, 0));
    }

    #[test]
    fn test_cron_next_occurrence() {
        let weekdays_at_nine: RecurrencePattern = "0 9 * * 1-5".parse().unwrap();
        // 2025-03-07 is a Friday.
        let next = weekdays_at_nine.next_after(at(2025, 3, 7, 9, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 10, 9, 0));
        assert_eq!(weekdays_at_nine.to_string(), "0 9 * * 1-5");
    }

    #[test]
    fn test_next_after_now_skips_missed_occurrences() {
        let hourly: RecurrencePattern = "hourly".parse().unwrap();
        let from = at(2025, 3, 1, 8, 0);
        let now = at(2025, 3, 1, 11, 30);
        assert_eq!(hourly.next_after_now(from, now).unwrap(), at(2025, 3, 1, 12, 0));
    }

    #[test]
    fn test_next_after_now_on_time() {
        let daily: RecurrencePattern = "daily".parse().unwrap();
        let from = at(2025, 3, 1, 8, 0);
        assert_eq!(daily.next_after_now(from, from).unwrap(), at(2025, 3, 2, 8, 0));
    }
}
