//! Collapses the repeated poll snapshots of each physical session into one
//! canonical record.
//!
//! A session that is still open is reported at every poll with a null end.
//! Retried ingestion can also insert the same poll twice. Consolidation:
//!
//! 1. clamps clock skew (end or poll time before start),
//! 2. removes exact duplicate polls, keeping the first inserted,
//! 3. picks the latest poll per [`SessionKey`] by poll time, later insertion
//!    winning ties,
//! 4. resolves end and status from that poll and copies them to every row of
//!    the session.
//!
//! The result depends only on the poll set and its insertion order, so
//! re-running it is idempotent.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::db::models::{CanonicalSession, RawPoll, SessionKey, SessionStatus};

type DuplicateKey = (
    String,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn duplicate_key(poll: &RawPoll) -> DuplicateKey {
    (
        poll.entity.clone(),
        poll.device.clone(),
        poll.location.clone(),
        poll.network.clone(),
        poll.protocol.clone(),
        poll.start,
        poll.poll_time,
    )
}

/// Output of one consolidation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidation {
    /// Every retained poll row, grouped by session key and ordered by poll
    /// time within a session.
    pub rows: Vec<CanonicalSession>,
    pub duplicates_removed: usize,
}

impl Consolidation {
    /// One authoritative record per physical session.
    pub fn sessions(&self) -> impl Iterator<Item = &CanonicalSession> {
        self.rows.iter().filter(|row| row.latest_poll)
    }
}

/// The end and status every row of one session agrees on.
struct Resolution {
    end: DateTime<Utc>,
    status: SessionStatus,
}

fn resolve_session(polls: &[RawPoll], members: &[usize], latest: usize) -> Resolution {
    let latest_poll = &polls[latest];
    if let Some(end) = latest_poll.end {
        return Resolution {
            end,
            status: SessionStatus::Completed,
        };
    }

    // An open latest poll does not reopen a session an earlier poll closed.
    let last_reported_end = members
        .iter()
        .filter_map(|&idx| polls[idx].end.map(|end| (polls[idx].poll_time, idx, end)))
        .max();

    match last_reported_end {
        Some((_, _, end)) => Resolution {
            end,
            status: SessionStatus::Completed,
        },
        None => Resolution {
            end: latest_poll.poll_time,
            status: SessionStatus::Ongoing,
        },
    }
}

pub fn consolidate_polls(polls: Vec<RawPoll>) -> Consolidation {
    let mut seen = HashSet::with_capacity(polls.len());
    let mut retained = Vec::with_capacity(polls.len());
    let mut duplicates_removed = 0;

    for poll in polls {
        let poll = poll.clamped();
        if seen.insert(duplicate_key(&poll)) {
            retained.push(poll);
        } else {
            duplicates_removed += 1;
        }
    }

    let mut sessions: BTreeMap<SessionKey, Vec<usize>> = BTreeMap::new();
    for (idx, poll) in retained.iter().enumerate() {
        sessions.entry(poll.key()).or_default().push(idx);
    }

    let mut rows = Vec::with_capacity(retained.len());
    for (key, mut members) in sessions {
        members.sort_by_key(|&idx| (retained[idx].poll_time, idx));
        let Some(&latest) = members.last() else {
            continue;
        };

        let Resolution { end, status } = resolve_session(&retained, &members, latest);
        let duration_secs = (end - key.start).num_seconds().max(0);

        for &idx in &members {
            let poll = &retained[idx];
            rows.push(CanonicalSession {
                entity: key.entity.clone(),
                device: key.device.clone(),
                location: key.location.clone(),
                start: key.start,
                end,
                status,
                duration_secs,
                poll_time: poll.poll_time,
                latest_poll: idx == latest,
                signal: poll.signal,
            });
        }
    }

    Consolidation {
        rows,
        duplicates_removed,
    }
}
