//! Session-level models shared by every pipeline stage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ongoing,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ongoing => "ongoing",
            SessionStatus::Completed => "completed",
        }
    }
}

/// A physical session after duplicate-poll consolidation.
///
/// Every retained poll row of a session is represented; all rows sharing a
/// key carry the same `end`, `status` and `duration_secs`, and exactly one of
/// them has `latest_poll` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSession {
    pub entity: String,
    pub device: String,
    pub location: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: SessionStatus,
    pub duration_secs: i64,
    pub poll_time: DateTime<Utc>,
    pub latest_poll: bool,
    pub signal: i32,
}

impl CanonicalSession {
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }
}
