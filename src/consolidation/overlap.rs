//! Sweep-line overlap resolution for one entity's timeline.
//!
//! Merged intervals arrive in start order. Each step takes the smallest
//! pending interval (by start, end, sequence) and compares it with the tail of
//! the resolved buffer:
//!
//! - no overlap (`previous.end < current.start`): current is appended;
//! - overlap and previous lasts at least as long: current starts one second
//!   after previous ends and goes back into the pending heap, or is discarded
//!   when previous contains it;
//! - overlap and current lasts longer: previous ends one second before current
//!   starts and is removed if nothing is left of it; current is appended.
//!
//! Everything in the buffer except the tail is final, so it is released after
//! each step. Released intervals shorter than the minimum duration are
//! dropped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::db::models::{MergedInterval, ResolvedInterval, SessionStatus};

#[derive(Debug, Error, PartialEq)]
pub enum OverlapError {
    #[error("interval starting {start} for entity {entity} arrived after one starting {previous}")]
    OutOfOrder {
        entity: String,
        start: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
    #[error("resolver for entity {expected} was offered an interval of entity {found}")]
    ForeignEntity { expected: String, found: String },
}

/// Boundary adjustment applied when trimming an overlap.
fn unit() -> Duration {
    Duration::seconds(1)
}

/// Field order gives the heap ordering: start, then end, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Span {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    seq: u64,
}

impl Span {
    fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone)]
struct Payload {
    location: String,
    status: SessionStatus,
    signal: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub offered: usize,
    pub emitted: usize,
    /// Intervals removed entirely by a longer overlapping interval.
    pub absorbed: usize,
    /// Intervals that survived trimming but fell under the minimum duration.
    pub too_short: usize,
}

pub struct OverlapResolver {
    entity: String,
    min_duration: Duration,
    pending: BinaryHeap<Reverse<Span>>,
    resolved: VecDeque<Span>,
    payloads: HashMap<u64, Payload>,
    next_seq: u64,
    last_offered_start: Option<DateTime<Utc>>,
    stats: ResolverStats,
}

impl OverlapResolver {
    pub fn new(entity: impl Into<String>, min_duration: Duration) -> Self {
        Self {
            entity: entity.into(),
            min_duration,
            pending: BinaryHeap::new(),
            resolved: VecDeque::new(),
            payloads: HashMap::new(),
            next_seq: 0,
            last_offered_start: None,
            stats: ResolverStats::default(),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// Feed the next interval of the start-ordered stream and return whatever
    /// became final.
    pub fn offer(&mut self, interval: MergedInterval) -> Result<Vec<ResolvedInterval>, OverlapError> {
        if interval.entity != self.entity {
            return Err(OverlapError::ForeignEntity {
                expected: self.entity.clone(),
                found: interval.entity,
            });
        }
        if let Some(previous) = self.last_offered_start {
            if interval.start < previous {
                return Err(OverlapError::OutOfOrder {
                    entity: self.entity.clone(),
                    start: interval.start,
                    previous,
                });
            }
        }
        self.last_offered_start = Some(interval.start);
        self.stats.offered += 1;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.payloads.insert(
            seq,
            Payload {
                location: interval.location,
                status: interval.status,
                signal: interval.signal,
            },
        );
        self.pending.push(Reverse(Span {
            start: interval.start,
            end: interval.end.max(interval.start),
            seq,
        }));

        // Push-then-pop: a trimmed interval waiting in the heap may still
        // start before the one just offered.
        if let Some(Reverse(current)) = self.pending.pop() {
            self.step(current);
        }
        Ok(self.release(1))
    }

    /// Drain the pending heap and release the whole buffer.
    pub fn finish(mut self) -> (Vec<ResolvedInterval>, ResolverStats) {
        let mut released = Vec::new();
        while let Some(Reverse(current)) = self.pending.pop() {
            self.step(current);
            released.extend(self.release(1));
        }
        released.extend(self.release(0));
        (released, self.stats)
    }

    fn step(&mut self, current: Span) {
        let Some(&previous) = self.resolved.back() else {
            self.resolved.push_back(current);
            return;
        };

        if previous.end < current.start {
            self.resolved.push_back(current);
            return;
        }

        if previous.duration() >= current.duration() {
            if current.end > previous.end {
                self.pending.push(Reverse(Span {
                    start: previous.end + unit(),
                    ..current
                }));
            } else {
                self.discard(current.seq);
            }
        } else {
            let trimmed_end = current.start - unit();
            if trimmed_end > previous.start {
                if let Some(tail) = self.resolved.back_mut() {
                    tail.end = trimmed_end;
                }
            } else {
                self.resolved.pop_back();
                self.discard(previous.seq);
            }
            self.resolved.push_back(current);
        }
    }

    fn discard(&mut self, seq: u64) {
        self.payloads.remove(&seq);
        self.stats.absorbed += 1;
    }

    /// Release buffered spans until at most `keep` remain.
    fn release(&mut self, keep: usize) -> Vec<ResolvedInterval> {
        let mut released = Vec::new();
        while self.resolved.len() > keep {
            let Some(span) = self.resolved.pop_front() else {
                break;
            };
            let Some(payload) = self.payloads.remove(&span.seq) else {
                continue;
            };
            if span.duration() < self.min_duration {
                self.stats.too_short += 1;
                continue;
            }
            self.stats.emitted += 1;
            released.push(ResolvedInterval {
                entity: self.entity.clone(),
                location: payload.location,
                status: payload.status,
                start: span.start,
                end: span.end,
                duration_secs: span.duration().num_seconds(),
                signal: payload.signal,
            });
        }
        released
    }
}

/// Resolve a complete, start-ordered timeline in one call.
pub fn resolve_timeline(
    entity: &str,
    intervals: impl IntoIterator<Item = MergedInterval>,
    min_duration: Duration,
) -> Result<Vec<ResolvedInterval>, OverlapError> {
    let mut resolver = OverlapResolver::new(entity, min_duration);
    let mut resolved = Vec::new();
    for interval in intervals {
        resolved.extend(resolver.offer(interval)?);
    }
    let (tail, _) = resolver.finish();
    resolved.extend(tail);
    Ok(resolved)
}
