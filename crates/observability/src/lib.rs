//! Process-wide tracing setup for the batch engine.

/// Initialize process-wide logging (JSON, `RUST_LOG` filter, default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging for test binaries: human-readable output captured by the
/// test harness, default filter `debug` for the engine crates.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber configuration.
pub mod tracing;
