//! Tracing and logging setup shared by every retrier binary.

/// Initialize process-wide observability with the default filter (`info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
