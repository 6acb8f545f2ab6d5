use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::consolidation::{
    ConsolidationReport, IngestReport, Pipeline, ResolutionRun, UnitOutcome,
};
use crate::db::models::{TaskKey, TaskStatus, TaskStatusRecord, TaskType};

/// Consolidate Wi-Fi association polls into per-entity presence timelines.
#[derive(Parser, Debug)]
#[command(name = "presence", version)]
pub struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "PRESENCE_DB", default_value = "presence.sqlite3")]
    pub db: PathBuf,

    /// JSON settings file; missing means defaults
    #[arg(long, global = true, env = "PRESENCE_SETTINGS", default_value = "presence.json")]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load JSON-lines poll files, one tracked unit per file and start day
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Consolidate one day, or every day with newer ingestions
    Consolidate {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Merge, resolve and publish the per-entity timelines
    Resolve,
    /// Show the most recent ledger record of a unit of work, or quarantine one
    /// left ongoing by an interrupted run
    Status(StatusQuery),
}

#[derive(Args, Debug, Clone)]
pub struct StatusQuery {
    /// session_file, consolidation or resolution
    #[arg(long = "type", default_value = "resolution")]
    pub task_type: String,

    /// Poll file name (session_file only)
    #[arg(long)]
    pub name: Option<String>,

    /// Day of the unit (session_file and consolidation)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Quarantine the unit's ongoing attempt so the next run may retry it
    #[arg(long)]
    pub quarantine: bool,
}

impl StatusQuery {
    pub fn key(&self) -> Result<TaskKey> {
        let task_type: TaskType = self.task_type.parse()?;
        match (task_type, &self.name, self.date) {
            (TaskType::Resolution, _, _) => Ok(TaskKey::resolution()),
            (TaskType::Consolidation, _, Some(day)) => Ok(TaskKey::consolidation(day)),
            (TaskType::SessionFile, Some(name), Some(day)) => Ok(TaskKey::session_file(name, day)),
            (TaskType::Consolidation, _, None) => bail!("--date is required for consolidation"),
            (TaskType::SessionFile, _, _) => bail!("--name and --date are required for session_file"),
        }
    }
}

/// What a command prints, and whether any unit it touched was quarantined.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Ingest(Vec<IngestReport>),
    Consolidate(ConsolidationReport),
    Resolve(ResolutionRun),
    Status(Option<TaskStatusRecord>),
}

impl CommandOutput {
    pub fn has_quarantine(&self) -> bool {
        match self {
            CommandOutput::Ingest(reports) => reports
                .iter()
                .flat_map(|report| &report.days)
                .any(|day| day.outcome == UnitOutcome::Quarantined),
            CommandOutput::Consolidate(report) => report.quarantined() > 0,
            CommandOutput::Resolve(run) => run.outcome == UnitOutcome::Quarantined,
            CommandOutput::Status(_) => false,
        }
    }
}

pub async fn ingest(pipeline: &Pipeline, files: &[PathBuf]) -> Result<Vec<IngestReport>> {
    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        reports.push(pipeline.ingest_file(file).await?);
    }
    Ok(reports)
}

pub async fn consolidate(pipeline: &Pipeline, date: Option<NaiveDate>) -> Result<ConsolidationReport> {
    pipeline.consolidate(date).await
}

pub async fn resolve(pipeline: &Pipeline) -> Result<ResolutionRun> {
    pipeline.resolve().await
}

pub async fn status(pipeline: &Pipeline, query: &StatusQuery) -> Result<Option<TaskStatusRecord>> {
    let key = query.key()?;
    if query.quarantine {
        let record = pipeline.tracker().set_status(&key, TaskStatus::Quarantine).await?;
        return Ok(Some(record));
    }
    pipeline.tracker().most_recent_status(&key).await
}

pub async fn dispatch(pipeline: &Pipeline, command: &Command) -> Result<CommandOutput> {
    let output = match command {
        Command::Ingest { files } => CommandOutput::Ingest(ingest(pipeline, files).await?),
        Command::Consolidate { date } => {
            CommandOutput::Consolidate(consolidate(pipeline, *date).await?)
        }
        Command::Resolve => CommandOutput::Resolve(resolve(pipeline).await?),
        Command::Status(query) => CommandOutput::Status(status(pipeline, query).await?),
    };
    Ok(output)
}
