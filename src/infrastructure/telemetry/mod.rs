//! Tracing Setup
//!
//! Structured logging through `tracing` with an `EnvFilter`. Production
//! emits one JSON object per line; setting `BUNNY_LOG_PRETTY=true` switches
//! to human-readable output for local work.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: `info`)
//! - `BUNNY_LOG_PRETTY`: pretty-print instead of JSON (default: false)

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber.
///
/// Call once at startup, before anything logs.
pub fn init(pretty: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if pretty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .pretty(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).json())
            .init();
    }
}
