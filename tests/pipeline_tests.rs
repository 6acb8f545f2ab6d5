//! End-to-end runs of ingest, consolidation and resolution against a real
//! SQLite file.

mod helpers;

use chrono::{DateTime, Duration, Utc};
use helpers::{closed, day, open, Workspace};
use presence_lib::commands::{self, StatusQuery};
use presence_lib::consolidation::{ConsolidationConfig, UnitOutcome};
use presence_lib::db::models::{SessionStatus, TaskKey, TaskStatus};

fn ts(value: &str) -> DateTime<Utc> {
    value.parse().expect("timestamp")
}

fn first_day_polls() -> Vec<helpers::PollLine> {
    vec![
        // u1 at the lab: one session polled three times, then a second
        // session five minutes later.
        open("u1", "ap-lab", "2021-01-20T09:00:00Z", "2021-01-20T09:01:00Z"),
        open("u1", "ap-lab", "2021-01-20T09:00:00Z", "2021-01-20T09:01:00Z"),
        open("u1", "ap-lab", "2021-01-20T09:00:00Z", "2021-01-20T09:30:00Z"),
        closed("u1", "ap-lab", "2021-01-20T09:00:00Z", "2021-01-20T09:45:00Z"),
        closed("u1", "ap-lab", "2021-01-20T09:50:00Z", "2021-01-20T10:30:00Z"),
        // Overlaps the lab run and is left with less than ten minutes.
        closed("u1", "ap-hall", "2021-01-20T10:20:00Z", "2021-01-20T10:40:00Z"),
        closed("u1", "ap-hall", "2021-01-20T11:00:00Z", "2021-01-20T12:00:00Z"),
        // u2 is still connected at the last poll.
        open("u2", "ap-lab", "2021-01-20T13:00:00Z", "2021-01-20T13:20:00Z"),
    ]
}

#[tokio::test]
async fn ingest_consolidate_resolve_publishes_disjoint_timelines() {
    let ws = Workspace::new();
    let file = ws.write_polls("polls.jsonl", &first_day_polls());

    let ingest = ws.pipeline.ingest_file(&file).await.unwrap();
    assert_eq!(ingest.days.len(), 1);
    assert_eq!(ingest.days[0].outcome, UnitOutcome::Completed);
    assert_eq!(ingest.days[0].polls, 8);

    let consolidation = ws.pipeline.consolidate(None).await.unwrap();
    assert_eq!(consolidation.days.len(), 1);
    let consolidated = &consolidation.days[0];
    assert_eq!(consolidated.outcome, UnitOutcome::Completed);
    assert_eq!(consolidated.polls, 8);
    assert_eq!(consolidated.duplicates_removed, 1);
    assert_eq!(consolidated.sessions, 5);

    let u2_sessions = ws.db.get_sessions_for_entity("u2").await.unwrap();
    assert_eq!(u2_sessions.len(), 1);
    assert_eq!(u2_sessions[0].status, SessionStatus::Ongoing);
    assert_eq!(u2_sessions[0].end, ts("2021-01-20T13:20:00Z"));

    let run = ws.pipeline.resolve().await.unwrap();
    assert_eq!(run.outcome, UnitOutcome::Completed);
    let report = run.report.unwrap();
    assert_eq!(report.entities, 2);
    assert!(report.failed_entities.is_empty());
    assert_eq!(report.merged_intervals, 4);
    assert_eq!(report.resolved_intervals, 3);
    assert_eq!(report.published, Some(3));

    let u1 = ws.db.get_resolved_for_entity("u1").await.unwrap();
    let spans: Vec<_> = u1.iter().map(|r| (r.location.as_str(), r.start, r.end)).collect();
    assert_eq!(
        spans,
        vec![
            ("ap-lab", ts("2021-01-20T09:00:00Z"), ts("2021-01-20T10:30:00Z")),
            ("ap-hall", ts("2021-01-20T11:00:00Z"), ts("2021-01-20T12:00:00Z")),
        ]
    );
    for pair in u1.windows(2) {
        assert!(pair[0].end < pair[1].start);
    }
    assert!(u1.iter().all(|r| r.duration() >= Duration::minutes(10)));

    let u2 = ws.db.get_resolved_for_entity("u2").await.unwrap();
    assert_eq!(u2.len(), 1);
    assert_eq!(u2[0].status, SessionStatus::Ongoing);
    assert_eq!(u2[0].duration_secs, 20 * 60);
}

#[tokio::test]
async fn overlapping_locations_are_trimmed_by_duration() {
    let config = ConsolidationConfig {
        min_duration: Duration::zero(),
        ..ConsolidationConfig::default()
    };
    let ws = Workspace::with_config(config);
    let file = ws.write_polls(
        "polls.jsonl",
        &[
            closed("u1", "ap-a", "2021-01-20T10:00:00Z", "2021-01-20T10:20:00Z"),
            closed("u1", "ap-b", "2021-01-20T10:15:00Z", "2021-01-20T10:30:00Z"),
            closed("u2", "ap-a", "2021-01-20T10:00:00Z", "2021-01-20T10:20:00Z"),
            closed("u2", "ap-b", "2021-01-20T10:15:00Z", "2021-01-20T10:40:00Z"),
        ],
    );

    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(Some(day())).await.unwrap();
    ws.pipeline.resolve().await.unwrap();

    let u1 = ws.db.get_resolved_for_entity("u1").await.unwrap();
    assert_eq!((u1[0].start, u1[0].end), (ts("2021-01-20T10:00:00Z"), ts("2021-01-20T10:20:00Z")));
    assert_eq!((u1[1].start, u1[1].end), (ts("2021-01-20T10:20:01Z"), ts("2021-01-20T10:30:00Z")));

    let u2 = ws.db.get_resolved_for_entity("u2").await.unwrap();
    assert_eq!((u2[0].start, u2[0].end), (ts("2021-01-20T10:00:00Z"), ts("2021-01-20T10:14:59Z")));
    assert_eq!((u2[1].start, u2[1].end), (ts("2021-01-20T10:15:00Z"), ts("2021-01-20T10:40:00Z")));
}

#[tokio::test]
async fn entity_with_implausible_interval_is_dropped_whole() {
    let config = ConsolidationConfig {
        max_session_duration: Duration::hours(72),
        ..ConsolidationConfig::default()
    };
    let ws = Workspace::with_config(config);
    let file = ws.write_polls(
        "polls.jsonl",
        &[
            closed("u-bad", "ap-x", "2021-01-20T00:00:00Z", "2021-01-22T02:00:00Z"),
            closed("u-bad", "ap-y", "2021-01-20T06:00:00Z", "2021-01-20T06:30:00Z"),
            closed("u-good", "ap-y", "2021-01-20T10:00:00Z", "2021-01-20T11:00:00Z"),
        ],
    );

    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();
    let run = ws.pipeline.resolve().await.unwrap();

    assert_eq!(run.outcome, UnitOutcome::Completed);
    let report = run.report.unwrap();
    assert_eq!(report.dropped_entities, vec!["u-bad".to_string()]);
    assert!(ws.db.get_resolved_for_entity("u-bad").await.unwrap().is_empty());
    assert_eq!(ws.db.get_resolved_for_entity("u-good").await.unwrap().len(), 1);
}

#[tokio::test]
async fn sessions_over_the_plausible_length_are_skipped() {
    let ws = Workspace::new();
    let file = ws.write_polls(
        "polls.jsonl",
        &[
            closed("u1", "ap-x", "2021-01-20T00:00:00Z", "2021-01-21T06:00:00Z"),
            closed("u1", "ap-y", "2021-01-20T08:00:00Z", "2021-01-20T09:00:00Z"),
        ],
    );

    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();
    let run = ws.pipeline.resolve().await.unwrap();

    let report = run.report.unwrap();
    assert_eq!(report.implausible_sessions, 1);
    let u1 = ws.db.get_resolved_for_entity("u1").await.unwrap();
    assert_eq!(u1.len(), 1);
    assert_eq!(u1[0].location, "ap-y");
}

#[tokio::test]
async fn reruns_skip_completed_work_until_new_polls_arrive() {
    let ws = Workspace::new();
    let file = ws.write_polls("polls.jsonl", &first_day_polls());
    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();
    ws.pipeline.resolve().await.unwrap();

    let again = ws.pipeline.ingest_file(&file).await.unwrap();
    assert_eq!(again.days[0].outcome, UnitOutcome::Skipped);
    assert!(ws.pipeline.consolidate(None).await.unwrap().days.is_empty());
    assert_eq!(ws.pipeline.resolve().await.unwrap().outcome, UnitOutcome::Skipped);

    let late = ws.write_polls(
        "late.jsonl",
        &[open("u2", "ap-lab", "2021-01-20T13:00:00Z", "2021-01-20T13:40:00Z")],
    );
    ws.pipeline.ingest_file(&late).await.unwrap();

    let consolidation = ws.pipeline.consolidate(None).await.unwrap();
    assert_eq!(consolidation.days.len(), 1);
    assert_eq!(consolidation.days[0].outcome, UnitOutcome::Completed);

    assert_eq!(ws.pipeline.resolve().await.unwrap().outcome, UnitOutcome::Completed);
    let u2 = ws.db.get_resolved_for_entity("u2").await.unwrap();
    assert_eq!(u2[0].end, ts("2021-01-20T13:40:00Z"));
    let u1 = ws.db.get_resolved_for_entity("u1").await.unwrap();
    assert_eq!(u1.len(), 2);
}

#[tokio::test]
async fn failed_ingestion_is_quarantined_and_retried() {
    let ws = Workspace::new();
    let file = ws.write_polls("polls.jsonl", &first_day_polls());
    let key = TaskKey::session_file("polls.jsonl", day());

    ws.hide_table("polls").await;
    let failed = ws.pipeline.ingest_file(&file).await.unwrap();
    assert_eq!(failed.days[0].outcome, UnitOutcome::Quarantined);
    let status = ws.pipeline.tracker().most_recent_status(&key).await.unwrap();
    assert_eq!(status.unwrap().status, TaskStatus::Quarantine);

    ws.restore_table("polls").await;
    let retried = ws.pipeline.ingest_file(&file).await.unwrap();
    assert_eq!(retried.days[0].outcome, UnitOutcome::Completed);

    let history = ws.db.task_history(&key).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_ne!(history[0].attempt, history[2].attempt);
    assert_eq!(history[2].attempt, history[3].attempt);
}

#[tokio::test]
async fn failed_consolidation_keeps_previous_sessions() {
    let ws = Workspace::new();
    let file = ws.write_polls("polls.jsonl", &first_day_polls());
    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();

    let late = ws.write_polls(
        "late.jsonl",
        &[open("u2", "ap-lab", "2021-01-20T13:00:00Z", "2021-01-20T13:50:00Z")],
    );
    ws.pipeline.ingest_file(&late).await.unwrap();

    ws.hide_table("canonical_sessions").await;
    let failed = ws.pipeline.consolidate(None).await.unwrap();
    assert_eq!(failed.quarantined(), 1);
    ws.restore_table("canonical_sessions").await;

    let before = ws.db.get_sessions_for_entity("u2").await.unwrap();
    assert_eq!(before[0].end, ts("2021-01-20T13:20:00Z"));

    let retried = ws.pipeline.consolidate(None).await.unwrap();
    assert_eq!(retried.days[0].outcome, UnitOutcome::Completed);
    let after = ws.db.get_sessions_for_entity("u2").await.unwrap();
    assert_eq!(after[0].end, ts("2021-01-20T13:50:00Z"));
}

#[tokio::test]
async fn failed_entities_withhold_publication() {
    let ws = Workspace::new();
    let file = ws.write_polls("polls.jsonl", &first_day_polls());
    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();
    ws.pipeline.resolve().await.unwrap();

    let late = ws.write_polls(
        "late.jsonl",
        &[open("u2", "ap-lab", "2021-01-20T13:00:00Z", "2021-01-20T14:00:00Z")],
    );
    ws.pipeline.ingest_file(&late).await.unwrap();
    ws.pipeline.consolidate(None).await.unwrap();

    ws.hide_table("merged_intervals").await;
    let run = ws.pipeline.resolve().await.unwrap();
    assert_eq!(run.outcome, UnitOutcome::Quarantined);
    let report = run.report.unwrap();
    assert_eq!(report.failed_entities.len(), 2);
    assert_eq!(report.published, None);

    let published = ws.db.get_resolved_for_entity("u2").await.unwrap();
    assert_eq!(published[0].end, ts("2021-01-20T13:20:00Z"));

    ws.restore_table("merged_intervals").await;
    let run = ws.pipeline.resolve().await.unwrap();
    assert_eq!(run.outcome, UnitOutcome::Completed);
    let published = ws.db.get_resolved_for_entity("u2").await.unwrap();
    assert_eq!(published[0].end, ts("2021-01-20T14:00:00Z"));
}

#[tokio::test]
async fn polls_are_split_into_one_unit_per_start_day() {
    let ws = Workspace::new();
    let file = ws.write_polls(
        "polls.jsonl",
        &[
            closed("u1", "ap-a", "2021-01-20T22:00:00Z", "2021-01-20T23:00:00Z"),
            closed("u1", "ap-a", "2021-01-21T08:00:00Z", "2021-01-21T09:00:00Z"),
        ],
    );

    let ingest = ws.pipeline.ingest_file(&file).await.unwrap();
    assert_eq!(ingest.days.len(), 2);

    let ready = ws.pipeline.tracker().ready_for_consolidation().await.unwrap();
    assert_eq!(ready, vec![day(), day().succ_opt().unwrap()]);

    let one = ws.pipeline.consolidate(Some(day())).await.unwrap();
    assert_eq!(one.days[0].sessions, 1);
    let ready = ws.pipeline.tracker().ready_for_consolidation().await.unwrap();
    assert_eq!(ready, vec![day().succ_opt().unwrap()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn entity_tasks_stay_within_fan_out_and_all_publish() {
    const ENTITIES: [&str; 12] = [
        "e01", "e02", "e03", "e04", "e05", "e06", "e07", "e08", "e09", "e10", "e11", "e12",
    ];
    let config = ConsolidationConfig {
        fan_out: 2,
        queue_capacity: 1,
        batch_size: 1,
        ..ConsolidationConfig::default()
    };
    let ws = Workspace::with_config(config);
    let polls: Vec<_> = ENTITIES
        .iter()
        .flat_map(|&entity| {
            [
                closed(entity, "ap-a", "2021-01-20T09:00:00Z", "2021-01-20T09:30:00Z"),
                closed(entity, "ap-b", "2021-01-20T10:00:00Z", "2021-01-20T10:45:00Z"),
            ]
        })
        .collect();
    let file = ws.write_polls("polls.jsonl", &polls);

    ws.pipeline.ingest_file(&file).await.unwrap();
    ws.pipeline.consolidate(Some(day())).await.unwrap();
    let run = ws.pipeline.resolve().await.unwrap();

    assert_eq!(run.outcome, UnitOutcome::Completed);
    let report = run.report.unwrap();
    assert_eq!(report.entities, ENTITIES.len());
    assert!(report.failed_entities.is_empty());
    assert!(report.peak_in_flight >= 1);
    assert!(report.peak_in_flight <= 2, "peak {}", report.peak_in_flight);
    assert_eq!(report.resolved_intervals, 2 * ENTITIES.len());
    assert_eq!(report.batches, 2 * ENTITIES.len());
    assert_eq!(report.published, Some(2 * ENTITIES.len()));

    for entity in ENTITIES {
        let resolved = ws.db.get_resolved_for_entity(entity).await.unwrap();
        let spans: Vec<_> = resolved.iter().map(|r| r.location.as_str()).collect();
        assert_eq!(spans, vec!["ap-a", "ap-b"], "entity {entity}");
    }
}

#[tokio::test]
async fn interrupted_unit_is_released_by_operator_quarantine() {
    let ws = Workspace::new();
    let file = ws.write_polls(
        "polls.jsonl",
        &[closed("u1", "ap-a", "2021-01-20T09:00:00Z", "2021-01-20T10:00:00Z")],
    );
    ws.pipeline.ingest_file(&file).await.unwrap();

    // An attempt that never finished.
    let key = TaskKey::consolidation(day());
    let stuck = ws.pipeline.tracker().commit_new(&key).await.unwrap();
    let blocked = ws.pipeline.consolidate(Some(day())).await.unwrap();
    assert_eq!(blocked.days[0].outcome, UnitOutcome::Skipped);

    let query = StatusQuery {
        task_type: "consolidation".into(),
        name: None,
        date: Some(day()),
        quarantine: true,
    };
    let record = commands::status(&ws.pipeline, &query).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Quarantine);
    assert_eq!(record.attempt, stuck.attempt);

    let retried = ws.pipeline.consolidate(Some(day())).await.unwrap();
    assert_eq!(retried.days[0].outcome, UnitOutcome::Completed);
    assert_eq!(retried.days[0].sessions, 1);

    // Completed units cannot be quarantined.
    assert!(commands::status(&ws.pipeline, &query).await.is_err());
}
