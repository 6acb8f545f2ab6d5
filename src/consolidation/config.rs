use chrono::Duration;

/// Tunables for the consolidation pipeline.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Same-location sessions closer than this are merged into one run.
    pub merge_gap: Duration,

    /// Resolved intervals shorter than this are dropped at flush.
    pub min_duration: Duration,

    /// Canonical sessions longer than this are skipped before merging.
    pub max_session_duration: Duration,

    /// An entity with any resolved interval longer than this is dropped whole.
    pub max_entity_duration: Duration,

    /// Maximum intervals per sink write.
    pub batch_size: usize,

    /// Maximum per-entity tasks in flight at once.
    pub fan_out: usize,

    /// Sink channel capacity; producers wait when it is full.
    pub queue_capacity: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_gap: Duration::minutes(10),
            min_duration: Duration::minutes(10),
            max_session_duration: Duration::hours(24),
            max_entity_duration: Duration::hours(48),
            batch_size: 1000,
            fan_out: 20,
            queue_capacity: 10_000,
        }
    }
}
