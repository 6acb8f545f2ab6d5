pub mod config;
pub mod consolidator;
pub mod locality;
pub mod overlap;
pub mod pipeline;
pub mod sink;
pub mod tracker;

pub use config::ConsolidationConfig;
pub use consolidator::{consolidate_polls, Consolidation};
pub use locality::merge_locality;
pub use overlap::{resolve_timeline, OverlapError, OverlapResolver, ResolverStats};
pub use pipeline::{
    ConsolidationReport, IngestReport, Pipeline, ResolutionReport, ResolutionRun, UnitOutcome,
};
pub use sink::{BatchedSink, IntervalWriter, SinkHandle, SinkStats};
pub use tracker::{ConsolidationTracker, TrackerError};
