//! Tracing initialization.
//!
//! Sets up `tracing-subscriber` with a console fmt layer and an `EnvFilter`
//! read from `RUST_LOG` (defaulting to `info`). Background workers all log
//! through `tracing`, so this is the single switchboard for diagnostics.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global subscriber.
///
/// Safe to call once per process; returns an error if a subscriber is
/// already installed (tests install their own).
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
