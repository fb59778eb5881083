//! Logging setup.
//!
//! Every module logs through `tracing` at the same points the original
//! Python implementation logged through the stdlib `logging` module: DB
//! init and migration, cache hits/misses, indexer results, queue job
//! failures, watcher promotion.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. Reads `RUST_LOG`, defaulting
/// to `info` for this crate and `warn` for dependencies.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,context_harness=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
