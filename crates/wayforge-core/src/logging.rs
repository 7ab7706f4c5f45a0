//! Tracing bootstrap for host binaries. A plain fmt+`EnvFilter` setup --
//! no OTel exporter branch, since this crate has no metrics/tracing-backend
//! ambitions of its own.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info`. Safe to call once at process startup; a second
/// call is a no-op (errors are swallowed, matching the common "don't crash
/// a library on double-init" convention).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
