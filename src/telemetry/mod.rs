//! Tracing/logging initialization.
//!
//! One subscriber for the whole process: env-filtered fmt output plus the
//! error-layer so spans are captured into error reports. Safe to call more
//! than once (later calls are no-ops).

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber. `RUST_LOG` controls filtering;
/// the default level is `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init();
}
