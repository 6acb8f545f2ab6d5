pub mod interval;
pub mod poll;
pub mod session;
pub mod task;

pub use interval::{MergedInterval, ResolvedInterval};
pub use poll::{RawPoll, SessionKey};
pub use session::{CanonicalSession, SessionStatus};
pub use task::{day_start, TaskKey, TaskStatus, TaskStatusRecord, TaskType, UpstreamScope};
