//! Local-day arithmetic in the configured business timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`, as UTC.
///
/// Zones that skip midnight on DST change (America/Santiago does) start the day
/// at the first local hour that exists.
pub fn start_of_day(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    for hour in 0..24 {
        let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
            continue;
        };
        if let Some(local) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            return local.with_timezone(&Utc);
        }
    }
    date.and_time(NaiveTime::MIN).and_utc()
}

/// `[start, end)` bounds of one local day.
pub fn day_bounds(tz: Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    range_bounds(tz, date, date)
}

/// `[start of first, start of the day after last)`.
pub fn range_bounds(tz: Tz, first: NaiveDate, last: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = last.succ_opt().unwrap_or(last);
    (start_of_day(tz, first), start_of_day(tz, next))
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

pub fn format_local(tz: Tz, at: DateTime<Utc>, pattern: &str) -> String {
    at.with_timezone(&tz).format(pattern).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn today_follows_the_local_calendar() {
        let tz: Tz = "America/Santiago".parse().expect("tz");
        // 02:30 UTC on the 15th is still the evening of the 14th in Santiago.
        let now = DateTime::parse_from_rfc3339("2025-01-15T02:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(local_today(tz, now), date("2025-01-14"));
    }

    #[test]
    fn day_bounds_span_one_local_day() {
        let tz: Tz = "America/Santiago".parse().expect("tz");
        let (start, end) = day_bounds(tz, date("2025-01-14"));
        assert_eq!(start.to_rfc3339(), "2025-01-14T03:00:00+00:00");
        assert_eq!(end - start, Duration::hours(24));
    }

    #[test]
    fn skipped_midnight_starts_at_the_first_valid_hour() {
        let tz: Tz = "America/Santiago".parse().expect("tz");
        // Clocks jump from 00:00 to 01:00 on 2024-09-08.
        let start = start_of_day(tz, date("2024-09-08"));
        assert_eq!(format_local(tz, start, "%H:%M"), "01:00");
        assert_eq!(start.to_rfc3339(), "2024-09-08T04:00:00+00:00");
    }

    #[test]
    fn weeks_start_on_monday() {
        assert_eq!(week_start(date("2025-01-16")), date("2025-01-13"));
        assert_eq!(week_start(date("2025-01-13")), date("2025-01-13"));
        assert_eq!(week_start(date("2025-01-19")), date("2025-01-13"));
    }
}
