//! Tracing setup for the server binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `info` for the cohort crates when
/// unset. Safe to call once per process; a second call is a no-op
/// (the error from `try_init` is ignored so tests can call this freely).
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
