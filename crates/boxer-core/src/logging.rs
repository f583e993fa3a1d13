//! Tracing subscriber setup for binaries and tests embedding the engine.
//!
//! The library itself only emits `tracing` events. Verbosity levels map to
//! filters as follows: 0 → warn, 1 → info, 2 → debug, 3+ → trace. A
//! `RUST_LOG` value takes precedence when verbosity is 0.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for a verbosity level.
pub fn filter_for_verbosity(verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

/// Install a global fmt subscriber writing to stderr.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(verbosity: u8) -> bool {
    fmt()
        .with_env_filter(filter_for_verbosity(verbosity))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_verbosity_levels() {
        assert_eq!(filter_for_verbosity(1).to_string(), "info");
        assert_eq!(filter_for_verbosity(2).to_string(), "debug");
        assert_eq!(filter_for_verbosity(3).to_string(), "trace");
        assert_eq!(filter_for_verbosity(9).to_string(), "trace");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let _ = init_tracing(2);
        assert!(!init_tracing(2));
    }
}
