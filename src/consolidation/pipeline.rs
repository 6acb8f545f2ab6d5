//! Drives the tracked units of work end to end:
//!
//! 1. `ingest_file`: one `session_file` unit per start day of a poll file.
//! 2. `consolidate`: one `consolidation` unit per ready day.
//! 3. `resolve`: one `resolution` unit fanning out per entity into the
//!    batched sink, published only when every entity succeeded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::db::{
    helpers::truncate_to_second,
    models::{RawPoll, TaskKey, TaskStatus},
    Database,
};

use super::{
    config::ConsolidationConfig,
    consolidator::consolidate_polls,
    locality::merge_locality,
    overlap::{OverlapResolver, ResolverStats},
    sink::{BatchedSink, SinkHandle},
    tracker::{ConsolidationTracker, TrackerError},
};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOutcome {
    Completed,
    Skipped,
    Quarantined,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayIngest {
    pub day: NaiveDate,
    pub polls: usize,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub file_name: String,
    pub days: Vec<DayIngest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayConsolidation {
    pub day: NaiveDate,
    pub outcome: UnitOutcome,
    pub polls: usize,
    pub duplicates_removed: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub days: Vec<DayConsolidation>,
}

impl ConsolidationReport {
    pub fn quarantined(&self) -> usize {
        self.days
            .iter()
            .filter(|day| day.outcome == UnitOutcome::Quarantined)
            .count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub entities: usize,
    pub failed_entities: Vec<String>,
    pub implausible_sessions: usize,
    pub merged_intervals: usize,
    pub resolved_intervals: usize,
    pub dropped_entities: Vec<String>,
    pub batches: usize,
    /// Most entity tasks observed running at the same moment.
    pub peak_in_flight: usize,
    /// Rows now in the published table; `None` when the run was not published.
    pub published: Option<usize>,
    pub cancelled: bool,
}

impl ResolutionReport {
    pub fn is_clean(&self) -> bool {
        self.failed_entities.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRun {
    pub outcome: UnitOutcome,
    pub report: Option<ResolutionReport>,
}

/// Per-entity counts collected by the resolution workers.
#[derive(Debug, Default)]
struct EntityOutcome {
    implausible_sessions: usize,
    merged_intervals: usize,
    resolver: ResolverStats,
}

/// Counts entity tasks while they run and remembers the high-water mark.
#[derive(Debug, Default)]
struct RunningGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl RunningGauge {
    fn enter(self: &Arc<Self>) -> RunningGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RunningGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<RunningGauge>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

fn is_blocked(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TrackerError>().is_some()
}

/// Parse JSON-lines polls, skipping blank lines.
pub fn parse_polls(contents: &str) -> Result<Vec<RawPoll>> {
    let mut polls = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let poll: RawPoll = serde_json::from_str(line)
            .with_context(|| format!("invalid poll on line {}", idx + 1))?;
        polls.push(poll);
    }
    Ok(polls)
}

/// Group polls by the day their session started, normalised for storage.
fn split_by_day(polls: Vec<RawPoll>) -> BTreeMap<NaiveDate, Vec<RawPoll>> {
    let mut days: BTreeMap<NaiveDate, Vec<RawPoll>> = BTreeMap::new();
    for poll in polls {
        let mut poll = poll.clamped();
        poll.start = truncate_to_second(poll.start);
        poll.poll_time = truncate_to_second(poll.poll_time);
        poll.end = poll.end.map(truncate_to_second);
        days.entry(poll.start.date_naive()).or_default().push(poll);
    }
    days
}

#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    tracker: ConsolidationTracker,
    config: ConsolidationConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(db: Database, config: ConsolidationConfig) -> Self {
        Self {
            tracker: ConsolidationTracker::new(db.clone()),
            db,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop launching entity tasks once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tracker(&self) -> &ConsolidationTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let polls = parse_polls(&contents).with_context(|| format!("failed to parse {file_name}"))?;
        self.ingest_polls(&file_name, polls).await
    }

    /// Store polls as one tracked unit per (file, start day).
    pub async fn ingest_polls(&self, file_name: &str, polls: Vec<RawPoll>) -> Result<IngestReport> {
        let mut report = IngestReport {
            file_name: file_name.to_string(),
            days: Vec::new(),
        };

        for (day, polls) in split_by_day(polls) {
            let key = TaskKey::session_file(file_name, day);
            let outcome = match self.tracker.commit_new(&key).await {
                Ok(_) => match self.db.insert_polls(&polls).await {
                    Ok(written) => {
                        self.tracker.set_status(&key, TaskStatus::Completed).await?;
                        crate::log_info!("[Ingest] {} {}: {} polls", file_name, day, written);
                        UnitOutcome::Completed
                    }
                    Err(err) => {
                        crate::log_error!("[Ingest] {} {} failed: {:#}", file_name, day, err);
                        self.tracker.set_status(&key, TaskStatus::Quarantine).await?;
                        UnitOutcome::Quarantined
                    }
                },
                Err(err) if is_blocked(&err) => {
                    crate::log_info!("[Ingest] {} {} skipped: {}", file_name, day, err);
                    UnitOutcome::Skipped
                }
                Err(err) => return Err(err),
            };

            report.days.push(DayIngest {
                day,
                polls: polls.len(),
                outcome,
            });
        }

        Ok(report)
    }

    /// Consolidate `day`, or every day with newer ingestions when `None`.
    pub async fn consolidate(&self, day: Option<NaiveDate>) -> Result<ConsolidationReport> {
        let days = match day {
            Some(day) => vec![day],
            None => self.tracker.ready_for_consolidation().await?,
        };

        let mut report = ConsolidationReport::default();
        for day in days {
            if self.cancel.is_cancelled() {
                crate::log_warn!("[Consolidate] cancelled before {}", day);
                break;
            }
            report.days.push(self.consolidate_day(day).await?);
        }
        Ok(report)
    }

    /// One tracked consolidation unit. Errors inside the unit quarantine it
    /// and leave the previous canonical sessions of the day in place.
    pub async fn consolidate_day(&self, day: NaiveDate) -> Result<DayConsolidation> {
        let key = TaskKey::consolidation(day);
        let mut outcome = DayConsolidation {
            day,
            outcome: UnitOutcome::Skipped,
            polls: 0,
            duplicates_removed: 0,
            sessions: 0,
        };

        match self.tracker.commit_new(&key).await {
            Ok(_) => {}
            Err(err) if is_blocked(&err) => {
                crate::log_info!("[Consolidate] {} skipped: {}", day, err);
                return Ok(outcome);
            }
            Err(err) => return Err(err),
        }

        let started = Instant::now();
        let result = async {
            let polls = self.db.get_polls_for_day(day).await?;
            outcome.polls = polls.len();

            let consolidation = consolidate_polls(polls);
            outcome.duplicates_removed = consolidation.duplicates_removed;

            let sessions: Vec<_> = consolidation.sessions().cloned().collect();
            outcome.sessions = self.db.replace_sessions_for_day(day, &sessions).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.tracker.set_status(&key, TaskStatus::Completed).await?;
                outcome.outcome = UnitOutcome::Completed;
                crate::log_elapsed!(
                    started,
                    "[Consolidate] {}: {} polls, {} duplicates removed, {} sessions",
                    day,
                    outcome.polls,
                    outcome.duplicates_removed,
                    outcome.sessions
                );
            }
            Err(err) => {
                crate::log_error!("[Consolidate] {} failed: {:#}", day, err);
                self.tracker.set_status(&key, TaskStatus::Quarantine).await?;
                outcome.outcome = UnitOutcome::Quarantined;
            }
        }
        Ok(outcome)
    }

    /// The resolution unit: skipped while up to date with consolidation,
    /// quarantined when any entity fails or the run is cancelled.
    pub async fn resolve(&self) -> Result<ResolutionRun> {
        let key = TaskKey::resolution();
        match self.tracker.commit_new(&key).await {
            Ok(_) => {}
            Err(err) if is_blocked(&err) => {
                crate::log_info!("[Resolve] skipped: {}", err);
                return Ok(ResolutionRun {
                    outcome: UnitOutcome::Skipped,
                    report: None,
                });
            }
            Err(err) => return Err(err),
        }

        match self.resolve_timelines().await {
            Ok(report) if report.is_clean() => {
                self.tracker.set_status(&key, TaskStatus::Completed).await?;
                Ok(ResolutionRun {
                    outcome: UnitOutcome::Completed,
                    report: Some(report),
                })
            }
            Ok(report) => {
                crate::log_error!(
                    "[Resolve] {} entities failed, cancelled: {}; timeline not published",
                    report.failed_entities.len(),
                    report.cancelled
                );
                self.tracker.set_status(&key, TaskStatus::Quarantine).await?;
                Ok(ResolutionRun {
                    outcome: UnitOutcome::Quarantined,
                    report: Some(report),
                })
            }
            Err(err) => {
                crate::log_error!("[Resolve] failed: {:#}", err);
                self.tracker.set_status(&key, TaskStatus::Quarantine).await?;
                Ok(ResolutionRun {
                    outcome: UnitOutcome::Quarantined,
                    report: None,
                })
            }
        }
    }

    /// Merge and resolve every entity into the staging table, drop
    /// implausible entities, then publish if nothing failed.
    pub async fn resolve_timelines(&self) -> Result<ResolutionReport> {
        let started = Instant::now();
        self.db.clear_resolved_staging().await?;

        let entities = self.db.get_session_entities().await?;
        let mut report = ResolutionReport {
            entities: entities.len(),
            ..ResolutionReport::default()
        };

        let sink = BatchedSink::spawn(
            self.db.clone(),
            self.config.batch_size,
            self.config.queue_capacity,
        );
        let fan_out = self.config.fan_out.max(1);
        let mut in_flight: JoinSet<(String, Result<EntityOutcome>)> = JoinSet::new();
        let gauge = Arc::new(RunningGauge::default());

        for entity in entities {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            while in_flight.len() >= fan_out {
                self.collect_next(&mut in_flight, &mut report).await;
            }

            let db = self.db.clone();
            let handle = sink.handle();
            let config = self.config.clone();
            let gauge = Arc::clone(&gauge);
            in_flight.spawn(async move {
                let _running = gauge.enter();
                let result = resolve_entity(&db, &handle, &entity, &config).await;
                (entity, result)
            });
        }
        while !in_flight.is_empty() {
            self.collect_next(&mut in_flight, &mut report).await;
        }

        let sink_stats = sink.close().await?;
        report.batches = sink_stats.batches;
        report.peak_in_flight = gauge.peak();

        let ceiling = self.config.max_entity_duration.num_seconds();
        report.dropped_entities = self.db.drop_implausible_staged_entities(ceiling).await?;
        if !report.dropped_entities.is_empty() {
            crate::log_warn!(
                "[Resolve] dropped {} entities with an interval longer than {}s",
                report.dropped_entities.len(),
                ceiling
            );
        }

        if report.is_clean() {
            report.published = Some(self.db.publish_resolved().await?);
        }

        crate::log_elapsed!(
            started,
            "[Resolve] {} entities, {} failed, {} resolved intervals in {} batches",
            report.entities,
            report.failed_entities.len(),
            report.resolved_intervals,
            report.batches
        );
        Ok(report)
    }

    async fn collect_next(
        &self,
        in_flight: &mut JoinSet<(String, Result<EntityOutcome>)>,
        report: &mut ResolutionReport,
    ) {
        match in_flight.join_next().await {
            Some(Ok((_, Ok(outcome)))) => {
                report.implausible_sessions += outcome.implausible_sessions;
                report.merged_intervals += outcome.merged_intervals;
                report.resolved_intervals += outcome.resolver.emitted;
            }
            Some(Ok((entity, Err(err)))) => {
                crate::log_error!("[Resolve] entity {} failed: {:#}", entity, err);
                report.failed_entities.push(entity);
            }
            Some(Err(join_err)) => {
                crate::log_error!("[Resolve] entity task aborted: {}", join_err);
                report.failed_entities.push(String::from("<aborted>"));
            }
            None => {}
        }
    }
}

/// One entity: plausible sessions, merged per location, persisted, read back
/// in start order and swept into the sink.
async fn resolve_entity(
    db: &Database,
    sink: &SinkHandle,
    entity: &str,
    config: &ConsolidationConfig,
) -> Result<EntityOutcome> {
    let mut outcome = EntityOutcome::default();

    let sessions = db.get_sessions_for_entity(entity).await?;
    let total = sessions.len();
    let ceiling = config.max_session_duration.num_seconds();
    let plausible: Vec<_> = sessions
        .into_iter()
        .filter(|session| session.duration() <= config.max_session_duration)
        .collect();
    outcome.implausible_sessions = total - plausible.len();
    if outcome.implausible_sessions > 0 {
        crate::log_debug!(
            "[Resolve] {}: skipped {} sessions longer than {}s",
            entity,
            outcome.implausible_sessions,
            ceiling
        );
    }

    let merged = merge_locality(&plausible, config.merge_gap);
    outcome.merged_intervals = db.replace_merged_for_entity(entity, &merged).await?;

    let mut resolver = OverlapResolver::new(entity, config.min_duration);
    for interval in db.get_merged_for_entity(entity).await? {
        for resolved in resolver.offer(interval)? {
            sink.enqueue(resolved).await?;
        }
    }
    let (tail, stats) = resolver.finish();
    for resolved in tail {
        sink.enqueue(resolved).await?;
    }
    outcome.resolver = stats;

    crate::log_debug!(
        "[Resolve] {}: {} sessions, {} merged, {} resolved",
        entity,
        total,
        outcome.merged_intervals,
        stats.emitted
    );
    Ok(outcome)
}
