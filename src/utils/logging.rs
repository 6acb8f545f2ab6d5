//! Module-gated logging macros.
//!
//! A module opts in by declaring a `const ENABLE_LOGS: bool` and importing the
//! macros from the crate root:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//!
//! log_info!("resolved {} intervals", count);
//! ```
//!
//! The per-entity workers are chatty, so turning a single module off keeps the
//! pipeline summary readable without touching `RUST_LOG`.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Info line suffixed with the milliseconds elapsed since `$started`
/// (a `std::time::Instant` or `tokio::time::Instant`).
///
/// `log_elapsed!(started, "wrote {} rows", n)` logs `wrote 12 rows (took 4ms)`.
#[macro_export]
macro_rules! log_elapsed {
    ($started:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        if ENABLE_LOGS {
            log::info!(
                concat!($fmt, " (took {}ms)") $(, $arg)*,
                $started.elapsed().as_millis()
            );
        }
    };
}
