// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod app;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod realtime;
pub mod store;
pub mod webhook;

// ---- Re-exports for stable public API ----
pub use crate::app::{Services, Stores};
pub use crate::config::AppConfig;
pub use crate::error::IngestError;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Crate modules log under short per-subsystem targets.
const DEFAULT_LOG_FILTER: &str =
    "reelwire=info,ingest=info,scheduler=info,webhook=info,dedup=info,push=info,realtime=info,store=info,extract=warn,warn";

/// Install the global subscriber: `RUST_LOG` filter (default: info for the
/// pipeline targets), compact lines, or JSON when `LOG_FORMAT=json`.
/// A second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}
