//! Calendar arithmetic for repeating reminders.
//!
//! Reminders repeat at the same local wall-clock time, so a 09:00 daily
//! reminder stays at 09:00 across DST changes even though the UTC offset moves.

use chrono::{DateTime, Days, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use herald_common::types::Frequency;

use crate::error::ScheduleError;

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Next fire time after `from`, or `None` for one-shot reminders.
pub fn advance(
    frequency: Frequency,
    from: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let days = match frequency {
        Frequency::Once => return Ok(None),
        Frequency::Daily => 1,
        Frequency::Weekly => 7,
    };

    let invalid = || ScheduleError::InvalidLocalTime {
        from: from.to_rfc3339(),
        days,
        timezone: tz.name().to_string(),
    };

    let local = from.with_timezone(&tz).naive_local();
    let target = local.checked_add_days(Days::new(days)).ok_or_else(invalid)?;
    let resolved = resolve_local(tz, target).ok_or_else(invalid)?;

    Ok(Some(resolved.with_timezone(&Utc)))
}

/// Map a local wall-clock time to an instant. Ambiguous times (clocks going
/// back) take the earlier instant; times inside a gap (clocks going forward)
/// move forward by an hour.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    if let Some(resolved) = tz.from_local_datetime(&local).earliest() {
        return Some(resolved);
    }
    let shifted = local.checked_add_signed(TimeDelta::hours(1))?;
    tz.from_local_datetime(&shifted).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn new_york() -> Tz {
        parse_timezone("America/New_York").unwrap()
    }

    #[test]
    fn test_once_does_not_advance() {
        assert_eq!(advance(Frequency::Once, utc(2025, 1, 1, 0, 0), Tz::UTC).unwrap(), None);
    }

    #[test]
    fn test_utc_steps() {
        let from = utc(2025, 2, 28, 18, 0);
        assert_eq!(
            advance(Frequency::Daily, from, Tz::UTC).unwrap(),
            Some(utc(2025, 3, 1, 18, 0))
        );
        assert_eq!(
            advance(Frequency::Weekly, from, Tz::UTC).unwrap(),
            Some(utc(2025, 3, 7, 18, 0))
        );
    }

    #[test]
    fn test_daily_across_spring_forward_keeps_local_time() {
        // 09:00 EST → 09:00 EDT
        let next = advance(Frequency::Daily, utc(2025, 3, 8, 14, 0), new_york()).unwrap();
        assert_eq!(next, Some(utc(2025, 3, 9, 13, 0)));
    }

    #[test]
    fn test_weekly_across_fall_back_keeps_local_time() {
        // 09:00 EDT → 09:00 EST
        let next = advance(Frequency::Weekly, utc(2025, 10, 30, 13, 0), new_york()).unwrap();
        assert_eq!(next, Some(utc(2025, 11, 6, 14, 0)));
    }

    #[test]
    fn test_time_inside_dst_gap_moves_forward() {
        // 02:30 EST on 2025-03-08; 02:30 does not exist on 2025-03-09.
        let next = advance(Frequency::Daily, utc(2025, 3, 8, 7, 30), new_york()).unwrap();
        assert_eq!(next, Some(utc(2025, 3, 9, 7, 30)));
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap(), Tz::UTC);
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }
}
