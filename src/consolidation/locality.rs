use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{CanonicalSession, MergedInterval, SessionStatus};

/// Accumulator for one run of same-location sessions.
struct Run {
    entity: String,
    location: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    status: SessionStatus,
    weighted_signal: f64,
    total_secs: i64,
    min_signal: i32,
}

impl Run {
    fn open(session: &CanonicalSession) -> Self {
        let mut run = Self {
            entity: session.entity.clone(),
            location: session.location.clone(),
            start: session.start,
            end: session.end,
            status: session.status,
            weighted_signal: 0.0,
            total_secs: 0,
            min_signal: session.signal,
        };
        run.absorb_signal(session);
        run
    }

    fn extend(&mut self, session: &CanonicalSession) {
        self.start = self.start.min(session.start);
        self.end = self.end.max(session.end);
        // Sessions arrive in start order, so the newest one sets the status.
        self.status = session.status;
        self.absorb_signal(session);
    }

    fn absorb_signal(&mut self, session: &CanonicalSession) {
        let secs = session.duration_secs.max(0);
        self.weighted_signal += secs as f64 * f64::from(session.signal);
        self.total_secs += secs;
        self.min_signal = self.min_signal.min(session.signal);
    }

    fn close(self) -> MergedInterval {
        let signal = if self.total_secs == 0 {
            f64::from(self.min_signal)
        } else {
            self.weighted_signal / self.total_secs as f64
        };

        MergedInterval {
            id: None,
            entity: self.entity,
            location: self.location,
            status: self.status,
            start: self.start,
            end: self.end,
            signal,
        }
    }
}

/// Merge consecutive sessions of the same (entity, location) whose gap is
/// below `max_gap`.
///
/// The gap is measured between each session and the one right before it at
/// that location, so a single wide gap ends the run. Sessions elsewhere in
/// between never join or split a run. Output is ordered by entity, location
/// and start.
pub fn merge_locality(sessions: &[CanonicalSession], max_gap: Duration) -> Vec<MergedInterval> {
    let mut by_location: BTreeMap<(&str, &str), Vec<&CanonicalSession>> = BTreeMap::new();
    for session in sessions {
        by_location
            .entry((session.entity.as_str(), session.location.as_str()))
            .or_default()
            .push(session);
    }

    let mut merged = Vec::new();
    for (_, mut group) in by_location {
        // Stable sort keeps input order for identical spans.
        group.sort_by_key(|session| (session.start, session.end));

        let mut iter = group.into_iter();
        let Some(first) = iter.next() else {
            continue;
        };
        let mut run = Run::open(first);
        let mut previous_end = first.end;

        for session in iter {
            if session.start - previous_end < max_gap {
                run.extend(session);
            } else {
                merged.push(run.close());
                run = Run::open(session);
            }
            previous_end = session.end;
        }
        merged.push(run.close());
    }

    merged
}
