//! Tracing and logging setup shared by the binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Initialize process-wide logging.
///
/// `verbose` lowers the default level to `debug` when `RUST_LOG` is unset.
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(verbose: bool) {
    tracing::init(verbose);
}
