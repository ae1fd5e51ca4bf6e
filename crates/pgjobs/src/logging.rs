//! Tracing initialization.
//!
//! Everything is written to stderr: a worker child's stdout carries the IPC
//! channel and must only ever contain protocol lines.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process. `RUST_LOG` controls filtering,
/// `PGJOBS_LOG_FORMAT=json` switches to JSON lines.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("PGJOBS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}
