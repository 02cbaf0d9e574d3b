//! Diagnostic tracing for the warden binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operator diagnostics via `RUST_LOG`, output to
//!   stderr. Not persisted.
//!
//! - **Product logs (`io/metrics`, `io/jsonl`)**: Append-only JSONL files under
//!   `.warden/logs/`. Always written on live cycles, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warden=info` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=warden=debug warden cycle --dry-run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
