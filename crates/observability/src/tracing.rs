//! Tracing/logging initialization.
//!
//! Structured JSON logs with an env-configurable filter. Dispatcher and
//! watchdog batches log at info, lost compare-and-swap transitions at warn,
//! swallowed telemetry sink errors at debug.

use tracing_subscriber::EnvFilter;

/// Default directives when `RUST_LOG` is unset: the run pipeline at info,
/// sqlx statement logging quieted to warnings.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    // JSON lines with timestamps; RUST_LOG overrides the defaults.
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
