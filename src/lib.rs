// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod backoff;
pub mod config;
pub mod guide;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod signals;
pub mod sources;
pub mod status;
pub mod supervisor;

// ---- Re-exports for a stable public API ----
pub use crate::config::OrchestratorConfig;
pub use crate::merge::{merge, MergeError, SourcePriority};
pub use crate::pipeline::{CycleOutcome, CycleReport, Pipeline, RefreshCycle};
pub use crate::publish::{PublishReport, Publisher};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` selects the filter (default `info`); `LOG_FORMAT=json` switches
/// from compact lines to one JSON object per event.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialized: {e}");
    }
}
