//! Engine configuration
//!
//! Loaded from a JSON file with every field defaulted, then overridden
//! from the environment (`FRED_API_KEY`, `SERIES_SYNC_DATA_DIR`,
//! `SERIES_SYNC_BASE_URL`).

use crate::error::{Result, SyncError};
use crate::types::SeriesSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub gaps: GapConfig,
    pub sync: OrchestratorConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub schedule: ScheduleConfig,
    pub series: Vec<SeriesSpec>,
}

/// Upstream time-series API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Result-size cap per request; shorter pages end pagination
    pub page_size: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stlouisfed.org/fred".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            page_size: 100_000,
        }
    }
}

/// Token bucket settings shared by every fetch worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst ceiling
    pub max_tokens: u32,
    /// Upstream quota per minute
    pub requests_per_minute: u32,
}

impl RateLimitConfig {
    pub fn refill_rate_per_second(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            requests_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Batch write engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    /// Floor for adaptive chunk halving
    pub min_chunk_size: usize,
    pub max_retries: u32,
    /// Failed-row ratio that switches a batch into adaptive mode
    pub error_rate_threshold: f64,
    /// Rows written between checkpoint saves
    pub sync_batch_size: usize,
    /// Ceiling on simultaneous store writes across all series
    pub max_concurrent_writes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            min_chunk_size: 10,
            max_retries: 3,
            error_rate_threshold: 0.10,
            sync_batch_size: 2_000,
            max_concurrent_writes: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub min_gap_days: i64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self { min_gap_days: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_data_sources: usize,
    pub enable_auto_recovery: bool,
    /// Days re-read before a checkpoint's last synced date on resume
    pub resume_overlap_days: i64,
    pub checkpoint_retention_hours: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_data_sources: 4,
            enable_auto_recovery: true,
            resume_overlap_days: 1,
            checkpoint_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub sqlite_pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sqlite_pool_size: 4,
        }
    }
}

impl StoreConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("series_sync.db")
    }

    pub fn duckdb_path(&self) -> PathBuf {
        self.data_dir.join("observations.duckdb")
    }
}

/// HTTP trigger/status server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

/// Daily incremental sync schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub timezone: String,
    pub hour: u32,
    pub minute: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "America/New_York".to_string(),
            hour: 6,
            minute: 0,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    SyncError::Config(format!("Invalid config {}: {}", path.display(), e))
                })?
            }
            None => SyncConfig::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("FRED_API_KEY") {
            if !key.is_empty() {
                self.upstream.api_key = Some(key);
            }
        }
        if let Ok(dir) = std::env::var("SERIES_SYNC_DATA_DIR") {
            if !dir.is_empty() {
                self.store.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("SERIES_SYNC_BASE_URL") {
            if !url.is_empty() {
                self.upstream.base_url = url;
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.upstream.base_url)
            .map_err(|e| SyncError::Config(format!("Invalid upstream base_url: {}", e)))?;

        if self.upstream.page_size == 0 {
            return Err(SyncError::Config("upstream.page_size must be > 0".into()));
        }
        if self.rate_limit.max_tokens == 0 || self.rate_limit.requests_per_minute == 0 {
            return Err(SyncError::Config(
                "rate_limit.max_tokens and requests_per_minute must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.batch.min_chunk_size == 0 || self.batch.min_chunk_size > self.batch.chunk_size {
            return Err(SyncError::Config(format!(
                "batch.min_chunk_size ({}) must be between 1 and chunk_size ({})",
                self.batch.min_chunk_size, self.batch.chunk_size
            )));
        }
        if !(self.batch.error_rate_threshold > 0.0 && self.batch.error_rate_threshold <= 1.0) {
            return Err(SyncError::Config(
                "batch.error_rate_threshold must be in (0, 1]".into(),
            ));
        }
        if self.batch.sync_batch_size == 0 || self.batch.max_concurrent_writes == 0 {
            return Err(SyncError::Config(
                "batch.sync_batch_size and max_concurrent_writes must be > 0".into(),
            ));
        }
        if self.sync.max_concurrent_data_sources == 0 {
            return Err(SyncError::Config(
                "sync.max_concurrent_data_sources must be > 0".into(),
            ));
        }
        if self.store.sqlite_pool_size == 0 {
            return Err(SyncError::Config("store.sqlite_pool_size must be > 0".into()));
        }
        if self.schedule.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(SyncError::Config(format!(
                "Unknown schedule timezone: {}",
                self.schedule.timezone
            )));
        }
        if self.schedule.hour > 23 || self.schedule.minute > 59 {
            return Err(SyncError::Config("schedule time out of range".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.series {
            if spec.id.trim().is_empty() {
                return Err(SyncError::Config("series id must not be empty".into()));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(SyncError::Config(format!("duplicate series id: {}", spec.id)));
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }
}
