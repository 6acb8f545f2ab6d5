use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::session::SessionStatus;

/// Consecutive same-location sessions of one entity joined across small gaps.
///
/// Merged intervals of different locations may still overlap each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergedInterval {
    pub id: Option<i64>,
    pub entity: String,
    pub location: String,
    pub status: SessionStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub signal: f64,
}

/// Final output: for one entity these never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInterval {
    pub entity: String,
    pub location: String,
    pub status: SessionStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub signal: f64,
}

impl ResolvedInterval {
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }

    pub fn overlaps(&self, other: &ResolvedInterval) -> bool {
        !(self.end < other.start || other.end < self.start)
    }
}
