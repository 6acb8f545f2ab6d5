use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

use crate::db::models::{day_start, SessionStatus, TaskStatus};

/// Session timestamps are stored at whole-second precision with a `Z`
/// suffix so that text order in SQLite matches chronological order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Ledger timestamps keep microseconds; every row uses the same width.
pub fn format_precise_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_session_status(value: &str) -> Result<SessionStatus> {
    match value {
        "ongoing" => Ok(SessionStatus::Ongoing),
        "completed" => Ok(SessionStatus::Completed),
        other => Err(anyhow!("unknown session status {other}")),
    }
}

pub fn parse_task_status(value: &str) -> Result<TaskStatus> {
    match value {
        "ongoing" => Ok(TaskStatus::Ongoing),
        "completed" => Ok(TaskStatus::Completed),
        "quarantine" => Ok(TaskStatus::Quarantine),
        other => Err(anyhow!("unknown task status {other}")),
    }
}

/// Half-open `[day, day + 1)` bounds, already formatted for range queries.
pub fn day_bounds(day: NaiveDate) -> (String, String) {
    let start = day_start(day);
    (
        format_datetime(&start),
        format_datetime(&(start + Duration::days(1))),
    )
}

/// Drop sub-second precision so stored values round-trip exactly.
pub fn truncate_to_second(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}
