use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    models::{TaskKey, TaskStatus, TaskStatusRecord},
    repositories::tasks::{
        append_record, latest_record, timestamps_ready_for_consolidation, upstream_completed_after,
    },
    Database,
};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("{task_name} ({task_type}) already completed and cannot run again")]
    AlreadyCompleted {
        task_type: &'static str,
        task_name: String,
    },
    #[error("{task_name} ({task_type}) is already in progress")]
    InProgress {
        task_type: &'static str,
        task_name: String,
    },
    #[error("{task_name} ({task_type}) is up to date with its upstream")]
    UpToDate {
        task_type: &'static str,
        task_name: String,
    },
    #[error("{task_name} ({task_type}) has never been started")]
    NotStarted {
        task_type: &'static str,
        task_name: String,
    },
    #[error("{task_name} ({task_type}) cannot move from {from} to {to}")]
    IllegalTransition {
        task_type: &'static str,
        task_name: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Why a key may not start a new attempt; `None` means it may.
fn blocking_reason(conn: &Connection, key: &TaskKey) -> Result<Option<TrackerError>> {
    let Some(latest) = latest_record(conn, key)? else {
        return Ok(None);
    };

    let task_type = key.task_type.as_str();
    let task_name = key.task_name.clone();
    let reason = match latest.status {
        TaskStatus::Quarantine => None,
        TaskStatus::Ongoing => Some(TrackerError::InProgress {
            task_type,
            task_name,
        }),
        TaskStatus::Completed => match key.task_type.upstream() {
            None => Some(TrackerError::AlreadyCompleted {
                task_type,
                task_name,
            }),
            Some(scope) => {
                if upstream_completed_after(conn, scope, &key.task_timestamp, latest.id)? {
                    None
                } else {
                    Some(TrackerError::UpToDate {
                        task_type,
                        task_name,
                    })
                }
            }
        },
    };
    Ok(reason)
}

/// Append-only ledger of units of work.
///
/// `ongoing -> completed | quarantine`, `quarantine -> ongoing`. Completed is
/// terminal except for recurring task types, which become eligible again once
/// their upstream records a newer completion.
#[derive(Clone)]
pub struct ConsolidationTracker {
    db: Database,
}

impl ConsolidationTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn most_recent_status(&self, key: &TaskKey) -> Result<Option<TaskStatusRecord>> {
        self.db.most_recent_task_status(key).await
    }

    pub async fn can_process(&self, key: &TaskKey) -> Result<bool> {
        let key = key.clone();
        self.db
            .execute(move |conn| Ok(blocking_reason(conn, &key)?.is_none()))
            .await
    }

    /// Start a new attempt: appends an `ongoing` row with a fresh attempt id.
    ///
    /// The eligibility check and the append run in one closure on the
    /// database thread, so two callers cannot both start the same key.
    pub async fn commit_new(&self, key: &TaskKey) -> Result<TaskStatusRecord> {
        let key = key.clone();
        let record = self
            .db
            .execute(move |conn| {
                if let Some(reason) = blocking_reason(conn, &key)? {
                    return Err(reason.into());
                }
                let attempt = Uuid::new_v4().to_string();
                append_record(conn, &key, TaskStatus::Ongoing, &attempt, Utc::now())
            })
            .await?;

        crate::log_debug!(
            "[Tracker] {} {} started (attempt {})",
            record.key.task_type.as_str(),
            record.key.task_name,
            record.attempt
        );
        Ok(record)
    }

    /// Record the outcome of the current attempt.
    pub async fn set_status(&self, key: &TaskKey, status: TaskStatus) -> Result<TaskStatusRecord> {
        let key = key.clone();
        let record = self
            .db
            .execute(move |conn| {
                let task_type = key.task_type.as_str();
                let Some(latest) = latest_record(conn, &key)? else {
                    return Err(TrackerError::NotStarted {
                        task_type,
                        task_name: key.task_name.clone(),
                    }
                    .into());
                };

                let legal = matches!(
                    (latest.status, status),
                    (TaskStatus::Ongoing, TaskStatus::Completed)
                        | (TaskStatus::Ongoing, TaskStatus::Quarantine)
                        | (TaskStatus::Quarantine, TaskStatus::Ongoing)
                );
                if !legal {
                    let err = if latest.status == TaskStatus::Completed && !key.task_type.is_recurring() {
                        TrackerError::AlreadyCompleted {
                            task_type,
                            task_name: key.task_name.clone(),
                        }
                    } else {
                        TrackerError::IllegalTransition {
                            task_type,
                            task_name: key.task_name.clone(),
                            from: latest.status.as_str(),
                            to: status.as_str(),
                        }
                    };
                    return Err(err.into());
                }

                append_record(conn, &key, status, &latest.attempt, Utc::now())
            })
            .await?;

        if status == TaskStatus::Quarantine {
            crate::log_warn!(
                "[Tracker] {} {} quarantined (attempt {})",
                record.key.task_type.as_str(),
                record.key.task_name,
                record.attempt
            );
        }
        Ok(record)
    }

    /// Days with an ingestion completed after their latest consolidation.
    pub async fn ready_for_consolidation(&self) -> Result<Vec<NaiveDate>> {
        let timestamps: Vec<DateTime<Utc>> = self
            .db
            .execute(|conn| timestamps_ready_for_consolidation(conn))
            .await?;
        Ok(timestamps.into_iter().map(|ts| ts.date_naive()).collect())
    }
}
