//! Series Sync - rate-limited time-series ingestion engine
//!
//! Pulls economic time series from a FRED-style upstream API into a local
//! DuckDB store, with checkpointed resume, gap detection and remediation.

pub mod config;
pub mod db;
pub mod error;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod sync;
pub mod types;
pub mod upstream;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use state::AppState;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
