//! Process-wide logging setup.

/// Tracing configuration (filters, format).
pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with_verbosity, level_for_verbosity};
