//! Derives a resolution date from the wording of a question.

use chrono::{DateTime, Datelike, Duration, Utc};

const DEFAULT_HORIZON_DAYS: i64 = 7;

/// Resolution date for `question` relative to `now`.
///
/// "tomorrow" resolves a day later, "this week" a week later and "weekend"
/// on the coming Sunday (the same day when `now` is a Sunday). Anything else
/// gets the default one-week horizon. Rules are checked in that order, so
/// "this weekend" matches "this week".
pub fn resolution_date_for(question: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let text = question.to_lowercase();

    if text.contains("tomorrow") {
        now + Duration::days(1)
    } else if text.contains("this week") {
        now + Duration::days(7)
    } else if text.contains("weekend") {
        let days_until_sunday = 6 - i64::from(now.weekday().num_days_from_monday());
        now + Duration::days(days_until_sunday)
    } else {
        now + Duration::days(DEFAULT_HORIZON_DAYS)
    }
}
