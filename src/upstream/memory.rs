//! In-memory upstream used by tests and local experiments
//!
//! Serves registered series with the same paging semantics as the HTTP
//! adapter and can inject scripted failures ahead of real responses.

use crate::error::{Result, SyncError};
use crate::types::{parse_date, RawObservation};
use crate::upstream::{ObservationRequest, SeriesSource};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Failure to return instead of the next real response
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFailure {
    Status(u16),
    RateLimited(Option<Duration>),
    ConnectionReset,
    Malformed,
    /// Stall for the given time, then answer normally
    Delay(Duration),
}

impl InjectedFailure {
    fn into_error(self) -> SyncError {
        match self {
            InjectedFailure::Delay(_) => SyncError::State("delay is not an error".into()),
            InjectedFailure::Status(code) => {
                SyncError::transport(Some(code), format!("injected HTTP {}", code))
            }
            InjectedFailure::RateLimited(retry_after) => SyncError::Quota {
                retry_after,
                message: "injected rate limit".into(),
            },
            InjectedFailure::ConnectionReset => {
                SyncError::transport(None, "injected connection reset")
            }
            InjectedFailure::Malformed => SyncError::malformed("injected malformed payload"),
        }
    }
}

/// Upstream double backed by in-memory series
#[derive(Default)]
pub struct MemorySource {
    series: DashMap<String, Vec<RawObservation>>,
    failures: DashMap<String, Mutex<VecDeque<InjectedFailure>>>,
    requests: DashMap<String, usize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a series' full history
    pub fn insert_series(&self, series_id: &str, rows: Vec<RawObservation>) {
        self.series.insert(series_id.to_string(), rows);
    }

    /// Queue failures served before real data for `series_id`
    pub fn inject_failures(&self, series_id: &str, failures: Vec<InjectedFailure>) {
        self.failures
            .entry(series_id.to_string())
            .or_default()
            .lock()
            .extend(failures);
    }

    /// Number of requests received for `series_id`
    pub fn request_count(&self, series_id: &str) -> usize {
        self.requests.get(series_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.requests.iter().map(|c| *c.value()).sum()
    }
}

#[async_trait]
impl SeriesSource for MemorySource {
    fn id(&self) -> &'static str {
        "memory"
    }

    async fn fetch_page(&self, request: &ObservationRequest) -> Result<Vec<RawObservation>> {
        *self.requests.entry(request.series_id.clone()).or_insert(0) += 1;

        let injected = self
            .failures
            .get(&request.series_id)
            .and_then(|queue| queue.lock().pop_front());
        match injected {
            Some(InjectedFailure::Delay(wait)) => tokio::time::sleep(wait).await,
            Some(failure) => return Err(failure.into_error()),
            None => {}
        }

        let rows = self.series.get(&request.series_id).ok_or_else(|| {
            SyncError::transport(Some(400), format!("series {} does not exist", request.series_id))
        })?;

        // Unparseable dates pass through so validation can see them
        let in_window = |row: &&RawObservation| match row.date.as_deref().and_then(parse_date) {
            Some(date) => {
                date >= request.observation_start
                    && request.observation_end.map_or(true, |end| date <= end)
            }
            None => true,
        };

        Ok(rows
            .iter()
            .filter(in_window)
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .cloned()
            .collect())
    }
}
