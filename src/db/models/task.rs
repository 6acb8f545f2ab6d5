use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Ingestion of one day's slice of a poll file.
    SessionFile,
    /// Consolidation of one day's polls into canonical sessions.
    Consolidation,
    /// Merge and overlap resolution of the full timeline.
    Resolution,
}

/// Where a recurring task looks for newer upstream completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScope {
    /// Upstream rows must share the task timestamp.
    SameTimestamp(TaskType),
    /// Any upstream row counts, whatever its timestamp.
    AnyTimestamp(TaskType),
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SessionFile => "session_file",
            TaskType::Consolidation => "consolidation",
            TaskType::Resolution => "resolution",
        }
    }

    /// Recurring tasks may run again after completing, once upstream advances.
    pub fn is_recurring(&self) -> bool {
        self.upstream().is_some()
    }

    pub fn upstream(&self) -> Option<UpstreamScope> {
        match self {
            TaskType::SessionFile => None,
            TaskType::Consolidation => Some(UpstreamScope::SameTimestamp(TaskType::SessionFile)),
            TaskType::Resolution => Some(UpstreamScope::AnyTimestamp(TaskType::Consolidation)),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "session_file" => Ok(TaskType::SessionFile),
            "consolidation" => Ok(TaskType::Consolidation),
            "resolution" => Ok(TaskType::Resolution),
            other => Err(anyhow::anyhow!("unknown task type {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ongoing,
    Completed,
    Quarantine,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ongoing => "ongoing",
            TaskStatus::Completed => "completed",
            TaskStatus::Quarantine => "quarantine",
        }
    }
}

/// Identity of a unit of work in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub task_type: TaskType,
    pub task_name: String,
    pub task_timestamp: DateTime<Utc>,
}

impl TaskKey {
    pub fn new(task_type: TaskType, task_name: impl Into<String>, task_timestamp: DateTime<Utc>) -> Self {
        Self {
            task_type,
            task_name: task_name.into(),
            task_timestamp,
        }
    }

    pub fn session_file(file_name: impl Into<String>, day: NaiveDate) -> Self {
        Self::new(TaskType::SessionFile, file_name, day_start(day))
    }

    pub fn consolidation(day: NaiveDate) -> Self {
        Self::new(
            TaskType::Consolidation,
            format!("canonical_sessions_{}", day.format("%Y_%m_%d")),
            day_start(day),
        )
    }

    /// The resolved timeline spans every day, so it is keyed at the epoch.
    pub fn resolution() -> Self {
        Self::new(TaskType::Resolution, "resolved_sessions", DateTime::UNIX_EPOCH)
    }
}

/// One append-only row of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusRecord {
    pub id: i64,
    pub key: TaskKey,
    pub status: TaskStatus,
    /// Shared by every row written for the same attempt.
    pub attempt: String,
    pub set_at: DateTime<Utc>,
}

pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc()
}
