//! Upstream time-series API adapters

pub mod fred;
pub mod memory;

use crate::error::Result;
use crate::types::RawObservation;
use async_trait::async_trait;
use chrono::NaiveDate;

pub use fred::FredClient;
pub use memory::{InjectedFailure, MemorySource};

/// One page request against the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationRequest {
    pub series_id: String,
    pub observation_start: NaiveDate,
    pub observation_end: Option<NaiveDate>,
    /// Result-size cap for this request
    pub limit: u32,
    pub offset: u32,
}

/// Trait every upstream adapter implements.
///
/// Implementations perform exactly one HTTP call per invocation and classify
/// failures into [`SyncError`](crate::error::SyncError) variants; rate limiting
/// and retries live in the fetcher.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Adapter ID (e.g. "fred")
    fn id(&self) -> &'static str;

    /// Fetch one page of observations in ascending date order
    async fn fetch_page(&self, request: &ObservationRequest) -> Result<Vec<RawObservation>>;
}
