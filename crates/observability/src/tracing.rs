//! Tracing/logging initialization.
//!
//! `RUST_LOG` always wins; otherwise the level comes from the verbosity
//! count (`-v`, `PROCRASTINATE_VERBOSE`).

use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable lines.
    Text,
}

/// Initialize JSON logging at `info` (or `RUST_LOG`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_verbosity(0, LogFormat::Json);
}

/// Initialize logging with the level picked by `verbosity`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with_verbosity(verbosity: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// `0` = info, `1` = debug, more = trace.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(1), "debug");
        assert_eq!(level_for_verbosity(9), "trace");
    }

    #[test]
    fn init_twice_is_a_no_op() {
        init_with_verbosity(0, LogFormat::Text);
        init();
    }
}
