use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Row};

use crate::db::{
    helpers::{day_bounds, format_datetime, parse_datetime, parse_optional_datetime},
    models::RawPoll,
    Database,
};

fn row_to_poll(row: &Row) -> Result<RawPoll> {
    let start: String = row.get("session_start")?;
    let end: Option<String> = row.get("session_end")?;
    let poll_time: String = row.get("poll_time")?;

    Ok(RawPoll {
        entity: row.get("entity")?,
        device: row.get("device")?,
        location: row.get("location")?,
        network: row.get("network")?,
        protocol: row.get("protocol")?,
        poll_time: parse_datetime(&poll_time, "poll_time")?,
        start: parse_datetime(&start, "session_start")?,
        end: parse_optional_datetime(end, "session_end")?,
        signal: row.get("signal")?,
    })
}

impl Database {
    /// Append polls in one transaction; either all rows land or none do.
    pub async fn insert_polls(&self, polls: &[RawPoll]) -> Result<usize> {
        let polls = polls.to_vec();
        self.transaction(move |tx| {
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO polls (
                        entity,
                        device,
                        location,
                        network,
                        protocol,
                        session_start,
                        session_end,
                        poll_time,
                        signal
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;

                for poll in &polls {
                    stmt.execute(params![
                        poll.entity,
                        poll.device,
                        poll.location,
                        poll.network,
                        poll.protocol,
                        format_datetime(&poll.start),
                        poll.end.as_ref().map(format_datetime),
                        format_datetime(&poll.poll_time),
                        poll.signal,
                    ])
                    .context("failed to insert poll")?;
                }
            }
            Ok(polls.len())
        })
        .await
    }

    /// Polls whose session started on `day`, in insertion order.
    pub async fn get_polls_for_day(&self, day: NaiveDate) -> Result<Vec<RawPoll>> {
        let (from, until) = day_bounds(day);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    entity,
                    device,
                    location,
                    network,
                    protocol,
                    session_start,
                    session_end,
                    poll_time,
                    signal
                FROM polls
                WHERE session_start >= ?1 AND session_start < ?2
                ORDER BY id ASC",
            )?;

            let mut rows = stmt.query(params![from, until])?;
            let mut polls = Vec::new();
            while let Some(row) = rows.next()? {
                polls.push(row_to_poll(row)?);
            }

            Ok(polls)
        })
        .await
    }
}
