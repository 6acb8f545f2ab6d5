use anyhow::{Context, Result};
use rusqlite::{params, Row, Transaction};

use crate::db::{
    helpers::{format_datetime, parse_datetime, parse_session_status},
    models::{MergedInterval, ResolvedInterval},
    Database,
};

fn row_to_merged(row: &Row) -> Result<MergedInterval> {
    let start: String = row.get("session_start")?;
    let end: String = row.get("session_end")?;
    let status: String = row.get("status")?;

    Ok(MergedInterval {
        id: row.get("id")?,
        entity: row.get("entity")?,
        location: row.get("location")?,
        status: parse_session_status(&status)?,
        start: parse_datetime(&start, "session_start")?,
        end: parse_datetime(&end, "session_end")?,
        signal: row.get("signal")?,
    })
}

fn row_to_resolved(row: &Row) -> Result<ResolvedInterval> {
    let start: String = row.get("session_start")?;
    let end: String = row.get("session_end")?;
    let status: String = row.get("status")?;

    Ok(ResolvedInterval {
        entity: row.get("entity")?,
        location: row.get("location")?,
        status: parse_session_status(&status)?,
        start: parse_datetime(&start, "session_start")?,
        end: parse_datetime(&end, "session_end")?,
        duration_secs: row.get("duration_secs")?,
        signal: row.get("signal")?,
    })
}

fn stage_resolved(tx: &Transaction<'_>, batch: &[ResolvedInterval]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO resolved_staging (
            entity,
            location,
            status,
            session_start,
            session_end,
            duration_secs,
            signal
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;

    for interval in batch {
        stmt.execute(params![
            interval.entity,
            interval.location,
            interval.status.as_str(),
            format_datetime(&interval.start),
            format_datetime(&interval.end),
            interval.duration_secs,
            interval.signal,
        ])
        .context("failed to stage resolved interval")?;
    }
    Ok(())
}

impl Database {
    /// Replace the merged intervals of one entity.
    pub async fn replace_merged_for_entity(
        &self,
        entity: &str,
        merged: &[MergedInterval],
    ) -> Result<usize> {
        let entity = entity.to_string();
        let merged = merged.to_vec();
        self.transaction(move |tx| {
            tx.execute("DELETE FROM merged_intervals WHERE entity = ?1", params![entity])
                .context("failed to clear merged intervals")?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO merged_intervals (
                        entity,
                        location,
                        status,
                        session_start,
                        session_end,
                        signal
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for interval in &merged {
                    stmt.execute(params![
                        interval.entity,
                        interval.location,
                        interval.status.as_str(),
                        format_datetime(&interval.start),
                        format_datetime(&interval.end),
                        interval.signal,
                    ])
                    .context("failed to insert merged interval")?;
                }
            }
            Ok(merged.len())
        })
        .await
    }

    /// Merged intervals of one entity in sweep order: start, then end, then id.
    pub async fn get_merged_for_entity(&self, entity: &str) -> Result<Vec<MergedInterval>> {
        let entity = entity.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity, location, status, session_start, session_end, signal
                 FROM merged_intervals
                 WHERE entity = ?1
                 ORDER BY session_start ASC, session_end ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![entity])?;
            let mut merged = Vec::new();
            while let Some(row) = rows.next()? {
                merged.push(row_to_merged(row)?);
            }
            Ok(merged)
        })
        .await
    }

    pub async fn clear_resolved_staging(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM resolved_staging", [])
                .context("failed to clear resolved staging")?;
            Ok(())
        })
        .await
    }

    /// One sink batch, written as a single transaction.
    pub async fn insert_resolved_batch(&self, batch: Vec<ResolvedInterval>) -> Result<usize> {
        self.transaction(move |tx| {
            stage_resolved(tx, &batch)?;
            Ok(batch.len())
        })
        .await
    }

    /// Delete every staged entity that has an interval longer than
    /// `ceiling_secs`; returns the dropped entities.
    pub async fn drop_implausible_staged_entities(&self, ceiling_secs: i64) -> Result<Vec<String>> {
        self.transaction(move |tx| {
            let entities = {
                let mut stmt = tx.prepare(
                    "SELECT entity FROM resolved_staging
                     GROUP BY entity
                     HAVING MAX(duration_secs) > ?1
                     ORDER BY entity",
                )?;
                let entities = stmt
                    .query_map(params![ceiling_secs], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                entities
            };
            for entity in &entities {
                tx.execute("DELETE FROM resolved_staging WHERE entity = ?1", params![entity])?;
            }
            Ok(entities)
        })
        .await
    }

    /// Swap the staged timeline into `resolved_intervals` atomically.
    pub async fn publish_resolved(&self) -> Result<usize> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM resolved_intervals", [])?;
            let published = tx
                .execute(
                    "INSERT INTO resolved_intervals (
                        entity, location, status, session_start, session_end, duration_secs, signal
                    )
                    SELECT entity, location, status, session_start, session_end, duration_secs, signal
                    FROM resolved_staging
                    ORDER BY entity, session_start",
                    [],
                )
                .context("failed to publish resolved intervals")?;
            tx.execute("DELETE FROM resolved_staging", [])?;
            Ok(published)
        })
        .await
    }

    /// Published intervals of one entity, ordered by start.
    pub async fn get_resolved_for_entity(&self, entity: &str) -> Result<Vec<ResolvedInterval>> {
        let entity = entity.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entity, location, status, session_start, session_end, duration_secs, signal
                 FROM resolved_intervals
                 WHERE entity = ?1
                 ORDER BY session_start ASC",
            )?;

            let mut rows = stmt.query(params![entity])?;
            let mut resolved = Vec::new();
            while let Some(row) = rows.next()? {
                resolved.push(row_to_resolved(row)?);
            }
            Ok(resolved)
        })
        .await
    }
}
