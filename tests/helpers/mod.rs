//! Shared fixtures for pipeline integration tests.
//!
//! Every workspace owns a temporary directory holding the SQLite database and
//! any poll files written by the test.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use presence_lib::consolidation::{ConsolidationConfig, Pipeline};
use presence_lib::db::Database;
use serde_json::json;
use tempfile::TempDir;

pub struct Workspace {
    dir: TempDir,
    pub db: Database,
    pub pipeline: Pipeline,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_config(ConsolidationConfig::default())
    }

    pub fn with_config(config: ConsolidationConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(dir.path().join("presence.sqlite3")).expect("database");
        let pipeline = Pipeline::new(db.clone(), config);
        Self { dir, db, pipeline }
    }

    /// Write JSON-lines polls to `name` inside the workspace.
    pub fn write_polls(&self, name: &str, polls: &[PollLine]) -> PathBuf {
        let path = self.dir.path().join(name);
        let contents: Vec<String> = polls.iter().map(PollLine::to_json).collect();
        fs::write(&path, contents.join("\n")).expect("write poll file");
        path
    }

    /// Move a table out of the way so statements against it fail.
    pub async fn hide_table(&self, table: &str) {
        let sql = format!("ALTER TABLE {table} RENAME TO {table}_hidden");
        self.db
            .execute(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
            .expect("hide table");
    }

    pub async fn restore_table(&self, table: &str) {
        let sql = format!("ALTER TABLE {table}_hidden RENAME TO {table}");
        self.db
            .execute(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
            .expect("restore table");
    }
}

/// One poll as it appears in an input file.
#[derive(Clone)]
pub struct PollLine {
    pub entity: &'static str,
    pub device: &'static str,
    pub location: &'static str,
    pub start: &'static str,
    pub end: Option<&'static str>,
    pub poll_time: &'static str,
    pub signal: i32,
}

impl PollLine {
    pub fn to_json(&self) -> String {
        json!({
            "entity": self.entity,
            "device": self.device,
            "location": self.location,
            "network": "campus",
            "protocol": "802.11ac",
            "start": self.start,
            "end": self.end,
            "pollTime": self.poll_time,
            "signal": self.signal,
        })
        .to_string()
    }
}

/// Poll of an open session.
pub fn open(entity: &'static str, location: &'static str, start: &'static str, poll_time: &'static str) -> PollLine {
    PollLine {
        entity,
        device: "mac-1",
        location,
        start,
        end: None,
        poll_time,
        signal: -60,
    }
}

/// Poll reporting the end of a session; polled at the end time.
pub fn closed(entity: &'static str, location: &'static str, start: &'static str, end: &'static str) -> PollLine {
    PollLine {
        entity,
        device: "mac-1",
        location,
        start,
        end: Some(end),
        poll_time: end,
        signal: -60,
    }
}

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, 20).expect("valid date")
}
