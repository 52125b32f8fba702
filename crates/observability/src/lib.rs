//! Process-wide logging setup shared by storefront binaries.

/// Initialize process-wide tracing with the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Like [`init`], with a custom fallback filter used when `RUST_LOG` is unset.
pub fn init_with_default(directives: &str) {
    tracing::init(directives);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
