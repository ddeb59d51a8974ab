//! Application state management

use crate::config::SyncConfig;
use crate::db::duckdb::DuckDb;
use crate::db::memory::{MemoryCheckpointStore, MemoryObservationStore};
use crate::db::sqlite::SqliteDb;
use crate::error::{Result, SyncError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::orchestrator::{GapReport, Orchestrator, SyncRequest};
use crate::sync::status::RunReport;
use crate::sync::writer::{ObservationStore, SeriesCoverage};
use crate::types::{Observation, SeriesSpec};
use crate::upstream::{FredClient, SeriesSource};
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A registered series and what the store holds for it
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStatus {
    #[serde(flatten)]
    pub spec: SeriesSpec,
    pub coverage: Option<SeriesCoverage>,
}

/// Application state shared by the CLI, HTTP surface and scheduler
pub struct AppState {
    pub config: SyncConfig,

    /// Checkpoints, registry and run history; absent in dry runs
    pub sqlite: Option<Arc<SqliteDb>>,

    pub orchestrator: Orchestrator,

    /// Cancelled on shutdown; every run gets a child token
    pub shutdown: CancellationToken,

    /// One run at a time
    run_lock: Mutex<()>,
}

impl AppState {
    /// Open the on-disk stores under `store.data_dir` and register the
    /// configured series
    pub fn new(config: SyncConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        info!("Data directory: {:?}", config.store.data_dir);

        let sqlite = Arc::new(SqliteDb::new(
            &config.store.sqlite_path(),
            config.store.sqlite_pool_size,
        )?);
        let duckdb = Arc::new(DuckDb::new(&config.store.duckdb_path())?);

        for spec in &config.series {
            sqlite.upsert_series(spec)?;
        }
        let mut config = config;
        config.series = sqlite.list_series()?;
        info!("Series registry: {} series", config.series.len());

        let source = Arc::new(FredClient::new(&config.upstream)?);
        Ok(Self::from_parts(
            config,
            source,
            duckdb,
            sqlite.clone(),
            Some(sqlite),
        ))
    }

    /// Real upstream, in-memory stores; nothing touches disk
    pub fn dry_run(config: SyncConfig) -> Result<Self> {
        let source = Arc::new(FredClient::new(&config.upstream)?);
        info!("Dry run: observations and checkpoints stay in memory");
        Ok(Self::from_parts(
            config,
            source,
            Arc::new(MemoryObservationStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
            None,
        ))
    }

    pub fn from_parts(
        config: SyncConfig,
        source: Arc<dyn SeriesSource>,
        store: Arc<dyn ObservationStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        sqlite: Option<Arc<SqliteDb>>,
    ) -> Self {
        let orchestrator = Orchestrator::from_config(&config, source, store, checkpoints);
        Self {
            config,
            sqlite,
            orchestrator,
            shutdown: CancellationToken::new(),
            run_lock: Mutex::new(()),
        }
    }

    /// Execute a run and persist its report. Fails only when another run
    /// holds the lock; initialization errors come back inside the report.
    pub async fn run_sync(&self, request: SyncRequest) -> Result<RunReport> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::State("a sync run is already in progress".into()))?;

        let report = self
            .orchestrator
            .run(request, self.shutdown.child_token())
            .await;

        if let Some(sqlite) = &self.sqlite {
            let sqlite = Arc::clone(sqlite);
            let stored = report.clone();
            let saved = tokio::task::spawn_blocking(move || sqlite.save_report(&stored))
                .await
                .map_err(|e| SyncError::Internal(format!("report save task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = saved {
                warn!("Failed to persist run report {}: {}", report.run_id, e);
            }
        }

        Ok(report)
    }

    /// The live report while a run executes, else the newest persisted one
    pub async fn latest_report(&self) -> Result<Option<RunReport>> {
        let board = self.orchestrator.board();
        if let Some(active) = board.active() {
            return Ok(Some(active));
        }
        match &self.sqlite {
            Some(sqlite) => {
                let sqlite = Arc::clone(sqlite);
                blocking(move || sqlite.latest_report()).await
            }
            None => Ok(board.snapshot()),
        }
    }

    pub async fn recent_reports(&self, limit: usize) -> Result<Vec<RunReport>> {
        match &self.sqlite {
            Some(sqlite) => {
                let sqlite = Arc::clone(sqlite);
                blocking(move || sqlite.recent_reports(limit)).await
            }
            None => Ok(self.orchestrator.board().snapshot().into_iter().collect()),
        }
    }

    /// Delete completed checkpoints older than the retention window
    pub async fn prune(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(self.config.sync.checkpoint_retention_hours);
        let checkpoints = Arc::clone(self.orchestrator.checkpoints());
        let removed = blocking(move || checkpoints.prune_stale(cutoff)).await?;
        info!("Checkpoint housekeeping removed {} checkpoint(s)", removed);
        Ok(removed)
    }

    pub async fn series_status(&self) -> Result<Vec<SeriesStatus>> {
        let store = Arc::clone(self.orchestrator.store());
        let specs = self.orchestrator.series();
        blocking(move || {
            specs
                .into_iter()
                .map(|spec| {
                    let coverage = store.coverage(&spec.id)?;
                    Ok(SeriesStatus { spec, coverage })
                })
                .collect()
        })
        .await
    }

    pub async fn observations(
        &self,
        series_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<Observation>> {
        if self.orchestrator.find_series(series_id).is_none() {
            return Err(SyncError::NotFound(format!(
                "series {} is not registered",
                series_id
            )));
        }
        let store = Arc::clone(self.orchestrator.store());
        let id = series_id.to_string();
        blocking(move || store.query_range(&id, from, to)).await
    }

    pub async fn gaps(
        &self,
        series_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<GapReport> {
        self.orchestrator.inspect_gaps(series_id, from, to).await
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let checkpoints = Arc::clone(self.orchestrator.checkpoints());
        blocking(move || checkpoints.list()).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Internal(format!("blocking task failed: {}", e)))?
}
