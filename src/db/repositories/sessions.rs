use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Row};

use crate::db::{
    helpers::{day_bounds, format_datetime, parse_datetime, parse_session_status},
    models::CanonicalSession,
    Database,
};

fn row_to_session(row: &Row) -> Result<CanonicalSession> {
    let start: String = row.get("session_start")?;
    let end: String = row.get("session_end")?;
    let poll_time: String = row.get("poll_time")?;
    let status: String = row.get("status")?;

    Ok(CanonicalSession {
        entity: row.get("entity")?,
        device: row.get("device")?,
        location: row.get("location")?,
        start: parse_datetime(&start, "session_start")?,
        end: parse_datetime(&end, "session_end")?,
        status: parse_session_status(&status)?,
        duration_secs: row.get("duration_secs")?,
        poll_time: parse_datetime(&poll_time, "poll_time")?,
        latest_poll: true,
        signal: row.get("signal")?,
    })
}

impl Database {
    /// Replace every canonical session that started on `day`.
    ///
    /// Runs as one transaction, so a failure leaves the previous
    /// consolidation of that day untouched.
    pub async fn replace_sessions_for_day(
        &self,
        day: NaiveDate,
        sessions: &[CanonicalSession],
    ) -> Result<usize> {
        let (from, until) = day_bounds(day);
        let sessions = sessions.to_vec();
        self.transaction(move |tx| {
            tx.execute(
                "DELETE FROM canonical_sessions
                 WHERE session_start >= ?1 AND session_start < ?2",
                params![from, until],
            )
            .context("failed to clear canonical sessions")?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO canonical_sessions (
                        entity,
                        device,
                        location,
                        session_start,
                        session_end,
                        status,
                        duration_secs,
                        poll_time,
                        signal
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ON CONFLICT (entity, device, location, session_start) DO UPDATE SET
                        session_end = excluded.session_end,
                        status = excluded.status,
                        duration_secs = excluded.duration_secs,
                        poll_time = excluded.poll_time,
                        signal = excluded.signal",
                )?;

                for session in sessions.iter().filter(|s| s.latest_poll) {
                    stmt.execute(params![
                        session.entity,
                        session.device,
                        session.location,
                        format_datetime(&session.start),
                        format_datetime(&session.end),
                        session.status.as_str(),
                        session.duration_secs,
                        format_datetime(&session.poll_time),
                        session.signal,
                    ])
                    .context("failed to upsert canonical session")?;
                }
            }

            let written: i64 = tx.query_row(
                "SELECT COUNT(*) FROM canonical_sessions
                 WHERE session_start >= ?1 AND session_start < ?2",
                params![from, until],
                |row| row.get(0),
            )?;
            Ok(written as usize)
        })
        .await
    }

    pub async fn get_session_entities(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT entity FROM canonical_sessions ORDER BY entity")?;
            let entities = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entities)
        })
        .await
    }

    /// All canonical sessions of one entity, ordered by start.
    pub async fn get_sessions_for_entity(&self, entity: &str) -> Result<Vec<CanonicalSession>> {
        let entity = entity.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    entity,
                    device,
                    location,
                    session_start,
                    session_end,
                    status,
                    duration_secs,
                    poll_time,
                    signal
                FROM canonical_sessions
                WHERE entity = ?1
                ORDER BY session_start ASC, session_end ASC",
            )?;

            let mut rows = stmt.query(params![entity])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }
}
