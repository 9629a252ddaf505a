//! Human readable renderings of elapsed time.

use chrono::{DateTime, Duration, TimeZone};

/// Long form used on notification items, e.g. `"5 minutes ago"`.
///
/// Anything older than 30 days is rendered as the local date `dd/mm/YYYY`.
pub fn time_ago<Tz: TimeZone>(at: DateTime<Tz>, now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let elapsed = now.clone().signed_duration_since(at.clone());
    if elapsed < Duration::minutes(1) {
        return "just now".to_string();
    }
    if elapsed < Duration::hours(1) {
        return plural(elapsed.num_minutes(), "minute");
    }
    if elapsed < Duration::days(1) {
        return plural(elapsed.num_hours(), "hour");
    }
    if elapsed < Duration::days(7) {
        return plural(elapsed.num_days(), "day");
    }
    if elapsed < Duration::days(30) {
        return plural(elapsed.num_days() / 7, "week");
    }
    at.format("%d/%m/%Y").to_string()
}

fn plural(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{value} {unit}s ago")
    }
}

/// Compact form shown on the guard dashboard, e.g. `"3 min ago"` or `"2h ago"`.
pub fn short_ago(elapsed: Duration) -> String {
    if elapsed < Duration::minutes(1) {
        "a few seconds ago".to_string()
    } else if elapsed < Duration::hours(1) {
        format!("{} min ago", elapsed.num_minutes())
    } else if elapsed < Duration::days(1) {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_days() == 1 {
        "1 day ago".to_string()
    } else {
        format!("{} days ago", elapsed.num_days())
    }
}

/// Age of an open incident: `"<m> min"`, `"<h>h"` or `"<d>d"`.
pub fn unresolved_for(elapsed: Duration) -> String {
    let elapsed = elapsed.max(Duration::zero());
    if elapsed < Duration::hours(1) {
        format!("{} min", elapsed.num_minutes())
    } else if elapsed < Duration::days(1) {
        format!("{}h", elapsed.num_hours())
    } else {
        format!("{}d", elapsed.num_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn time_ago_buckets() {
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(time_ago(now - Duration::seconds(20), now), "just now");
        assert_eq!(time_ago(now - Duration::minutes(1), now), "1 minute ago");
        assert_eq!(time_ago(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(time_ago(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(time_ago(now - Duration::days(2), now), "2 days ago");
        assert_eq!(time_ago(now - Duration::days(14), now), "2 weeks ago");
        assert_eq!(time_ago(now - Duration::days(45), now), "14/02/2025");
    }

    #[test]
    fn short_ago_buckets() {
        assert_eq!(short_ago(Duration::seconds(5)), "a few seconds ago");
        assert_eq!(short_ago(Duration::minutes(12)), "12 min ago");
        assert_eq!(short_ago(Duration::hours(2)), "2h ago");
        assert_eq!(short_ago(Duration::hours(30)), "1 day ago");
        assert_eq!(short_ago(Duration::days(3)), "3 days ago");
    }

    #[test]
    fn unresolved_for_buckets() {
        assert_eq!(unresolved_for(Duration::minutes(42)), "42 min");
        assert_eq!(unresolved_for(Duration::hours(5)), "5h");
        assert_eq!(unresolved_for(Duration::hours(50)), "2d");
        assert_eq!(unresolved_for(Duration::minutes(-3)), "0 min");
    }
}
