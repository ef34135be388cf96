//! Tracing/logging initialization.
//!
//! JSON lines with timestamps, filtered via `RUST_LOG`. Payment and
//! reconciliation paths log structured fields (wallet, invoice, transaction
//! ids), so downstream tooling can correlate a flow across services.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process with the `info` default.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Initialize with an explicit default directive, still overridable through
/// `RUST_LOG`. Tests use this to quiet retry warnings.
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
