//! Logging configuration for rowpipe.
//!
//! Result rows go to stdout, so logs are always written to stderr.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Initializes logging to stderr.
///
/// The level defaults to `info` and can be overridden with `RUST_LOG`
/// (e.g. `RUST_LOG=db_rowpipe=debug` to trace every walk).
pub fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
