pub mod intervals;
pub mod polls;
pub mod sessions;
pub mod tasks;
