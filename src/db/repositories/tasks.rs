use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    helpers::{format_datetime, format_precise_datetime, parse_datetime, parse_task_status},
    models::{TaskKey, TaskStatus, TaskStatusRecord, TaskType, UpstreamScope},
    Database,
};

fn row_to_record(row: &Row) -> Result<TaskStatusRecord> {
    let task_type: String = row.get("task_type")?;
    let task_timestamp: String = row.get("task_timestamp")?;
    let status: String = row.get("status")?;
    let set_at: String = row.get("set_at")?;

    Ok(TaskStatusRecord {
        id: row.get("id")?,
        key: TaskKey {
            task_type: task_type.parse()?,
            task_name: row.get("task_name")?,
            task_timestamp: parse_datetime(&task_timestamp, "task_timestamp")?,
        },
        status: parse_task_status(&status)?,
        attempt: row.get("attempt")?,
        set_at: parse_datetime(&set_at, "set_at")?,
    })
}

/// Newest ledger row for `key`. The ledger is append-only, so the highest id
/// is the most recent status.
pub(crate) fn latest_record(conn: &Connection, key: &TaskKey) -> Result<Option<TaskStatusRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_type, task_name, task_timestamp, status, attempt, set_at
         FROM task_status
         WHERE task_type = ?1 AND task_name = ?2 AND task_timestamp = ?3
         ORDER BY id DESC
         LIMIT 1",
    )?;

    let mut rows = stmt.query(params![
        key.task_type.as_str(),
        key.task_name,
        format_datetime(&key.task_timestamp),
    ])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_record(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn append_record(
    conn: &Connection,
    key: &TaskKey,
    status: TaskStatus,
    attempt: &str,
    set_at: DateTime<Utc>,
) -> Result<TaskStatusRecord> {
    conn.execute(
        "INSERT INTO task_status (task_type, task_name, task_timestamp, status, attempt, set_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.task_type.as_str(),
            key.task_name,
            format_datetime(&key.task_timestamp),
            status.as_str(),
            attempt,
            format_precise_datetime(&set_at),
        ],
    )
    .with_context(|| format!("failed to append {} status for {}", status.as_str(), key.task_name))?;

    Ok(TaskStatusRecord {
        id: conn.last_insert_rowid(),
        key: key.clone(),
        status,
        attempt: attempt.to_string(),
        set_at,
    })
}

/// Whether an upstream task completed after ledger row `after_id`.
pub(crate) fn upstream_completed_after(
    conn: &Connection,
    scope: UpstreamScope,
    task_timestamp: &DateTime<Utc>,
    after_id: i64,
) -> Result<bool> {
    let newest: Option<i64> = match scope {
        UpstreamScope::SameTimestamp(upstream) => conn
            .query_row(
                "SELECT MAX(id) FROM task_status
                 WHERE task_type = ?1 AND status = 'completed' AND task_timestamp = ?2",
                params![upstream.as_str(), format_datetime(task_timestamp)],
                |row| row.get(0),
            )
            .optional()?
            .flatten(),
        UpstreamScope::AnyTimestamp(upstream) => conn
            .query_row(
                "SELECT MAX(id) FROM task_status
                 WHERE task_type = ?1 AND status = 'completed'",
                params![upstream.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten(),
    };

    Ok(newest.is_some_and(|id| id > after_id))
}

/// Task timestamps whose newest completed `session_file` row is newer than
/// their newest completed consolidation (or that were never consolidated).
pub(crate) fn timestamps_ready_for_consolidation(conn: &Connection) -> Result<Vec<DateTime<Utc>>> {
    let mut stmt = conn.prepare(
        "SELECT ingested.task_timestamp
         FROM (
             SELECT task_timestamp, MAX(id) AS last_id
             FROM task_status
             WHERE task_type = ?1 AND status = 'completed'
             GROUP BY task_timestamp
         ) ingested
         LEFT JOIN (
             SELECT task_timestamp, MAX(id) AS last_id
             FROM task_status
             WHERE task_type = ?2 AND status = 'completed'
             GROUP BY task_timestamp
         ) consolidated
         ON consolidated.task_timestamp = ingested.task_timestamp
         WHERE consolidated.last_id IS NULL OR ingested.last_id > consolidated.last_id
         ORDER BY ingested.task_timestamp ASC",
    )?;

    let mut rows = stmt.query(params![
        TaskType::SessionFile.as_str(),
        TaskType::Consolidation.as_str(),
    ])?;
    let mut ready = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        ready.push(parse_datetime(&raw, "task_timestamp")?);
    }
    Ok(ready)
}

impl Database {
    pub async fn most_recent_task_status(&self, key: &TaskKey) -> Result<Option<TaskStatusRecord>> {
        let key = key.clone();
        self.execute(move |conn| latest_record(conn, &key)).await
    }

    /// Full history of one key, oldest first.
    pub async fn task_history(&self, key: &TaskKey) -> Result<Vec<TaskStatusRecord>> {
        let key = key.clone();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_type, task_name, task_timestamp, status, attempt, set_at
                 FROM task_status
                 WHERE task_type = ?1 AND task_name = ?2 AND task_timestamp = ?3
                 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(params![
                key.task_type.as_str(),
                key.task_name,
                format_datetime(&key.task_timestamp),
            ])?;
            let mut history = Vec::new();
            while let Some(row) = rows.next()? {
                history.push(row_to_record(row)?);
            }
            Ok(history)
        })
        .await
    }
}
