//! # telemetry
//!
//! why: one place to install structured logging for binaries and tests
//! relations: every module logs through `tracing`; this only wires the subscriber
//! what: init_tracing

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring RUST_LOG (default "info").
///
/// safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();
}
