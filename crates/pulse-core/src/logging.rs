//! `tracing` subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be made noisier without touching the settings file.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at startup. Later calls are no-ops.
///
/// * `level` - default filter directive when `RUST_LOG` is unset (e.g. `"info"`).
/// * `json` - emit one JSON object per line instead of compact text.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // try_init fails only when a global subscriber already exists
    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    }
}
