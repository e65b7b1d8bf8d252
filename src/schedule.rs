use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::models::rule::ScheduleType;

/// Decide whether a rule is eligible to fire at `ts`.
///
/// The timestamp is converted into the tenant's timezone before any
/// day-of-week or time-of-day check. A malformed schedule config always
/// passes: a bad schedule must never silence a rule.
pub fn is_rule_scheduled(
    schedule_type: ScheduleType,
    config: &serde_json::Value,
    ts: DateTime<Utc>,
    tz: Tz,
) -> bool {
    match schedule_type {
        ScheduleType::Always => true,
        ScheduleType::TimeWindow => time_window_contains(config, ts, tz).unwrap_or(true),
        ScheduleType::DateRange => date_range_contains(config, ts, tz).unwrap_or(true),
    }
}

/// `{"start_time": "HH:MM", "end_time": "HH:MM", "days": [1..7]}` with ISO
/// weekday numbers (1 = Monday). Days default to every day.
fn time_window_contains(config: &serde_json::Value, ts: DateTime<Utc>, tz: Tz) -> Option<bool> {
    let start = parse_hhmm(config.get("start_time")?.as_str()?)?;
    let end = parse_hhmm(config.get("end_time")?.as_str()?)?;

    let local = ts.with_timezone(&tz);
    let day = u64::from(local.weekday().number_from_monday());

    let day_ok = match config.get("days") {
        Some(serde_json::Value::Array(days)) => days.iter().any(|d| d.as_u64() == Some(day)),
        Some(_) => return None,
        None => true,
    };

    Some(day_ok && start <= local.time() && local.time() <= end)
}

/// `{"start_date": "YYYY-MM-DD", "end_date": "YYYY-MM-DD"}`, inclusive on
/// both ends, compared against the tenant-local date.
fn date_range_contains(config: &serde_json::Value, ts: DateTime<Utc>, tz: Tz) -> Option<bool> {
    let start = parse_date(config.get("start_date")?.as_str()?)?;
    let end = parse_date(config.get("end_date")?.as_str()?)?;
    let local_date = ts.with_timezone(&tz).date_naive();
    Some(start <= local_date && local_date <= end)
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}
