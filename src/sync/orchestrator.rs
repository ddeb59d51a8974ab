//! Sync orchestrator
//!
//! Resolves a [`SyncRequest`] into a [`SyncMode`] and a priority-tiered
//! series plan once, at entry, then drives every series through
//! fetch → validate → write → checkpoint (→ gap fill). Tiers run strictly
//! in priority order; inside a tier a bounded worker pool processes up to
//! `max_concurrent` series at once. A failing or panicking series only
//! affects its own [`SyncResult`].
//!
//! The run reaches `failed` only when it cannot start (unknown series,
//! recovery without exactly one series). Everything after that ends in
//! `completed`, with per-series failures counted in the report.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
use crate::sync::fetcher::SeriesFetcher;
use crate::sync::gaps::{detect_gaps, plan_remediation, Gap, RemediationItem};
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::retry::RetryPolicy;
use crate::sync::status::{RunPhase, RunReport, SeriesOutcome, StatusBoard, SyncResult};
use crate::sync::validation::{validate_observations, ValidationIssue};
use crate::sync::writer::{BatchWriter, ObservationStore};
use crate::types::{years_before, DateRange, Observation, Priority, RawObservation, SeriesSpec};
use crate::upstream::SeriesSource;
use chrono::{NaiveDate, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-series cap on issue lines copied into a result
const MAX_REPORTED_ISSUES: usize = 20;

/// Run mode as requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncModeKind {
    Full,
    Incremental,
    Backfill,
    Recovery,
}

impl SyncModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncModeKind::Full => "full",
            SyncModeKind::Incremental => "incremental",
            SyncModeKind::Backfill => "backfill",
            SyncModeKind::Recovery => "recovery",
        }
    }
}

impl fmt::Display for SyncModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncModeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncModeKind::Full),
            "incremental" => Ok(SyncModeKind::Incremental),
            "backfill" => Ok(SyncModeKind::Backfill),
            "recovery" => Ok(SyncModeKind::Recovery),
            other => Err(format!("unknown sync mode: {}", other)),
        }
    }
}

/// Resolved run mode, carrying exactly the parameters it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Lookback window through today, checkpoints ignored, gaps filled
    Full,
    /// From the last stored date minus a cadence margin, no gap filling
    Incremental,
    /// Only the missing runs across each series' stored history
    Backfill,
    /// Resume one series from its checkpoint, gaps filled
    Recovery { series_id: String },
}

impl SyncMode {
    pub fn kind(&self) -> SyncModeKind {
        match self {
            SyncMode::Full => SyncModeKind::Full,
            SyncMode::Incremental => SyncModeKind::Incremental,
            SyncMode::Backfill => SyncModeKind::Backfill,
            SyncMode::Recovery { .. } => SyncModeKind::Recovery,
        }
    }
}

/// Per-run overrides of the configured orchestrator settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub max_concurrent: Option<usize>,
    pub enable_auto_recovery: Option<bool>,
}

/// What an operational trigger asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub mode: SyncModeKind,
    /// Registered series to sync; all of them when absent or empty
    #[serde(default)]
    pub series_ids: Option<Vec<String>>,
    #[serde(default)]
    pub options: SyncOptions,
}

impl SyncRequest {
    pub fn new(mode: SyncModeKind) -> Self {
        Self {
            mode,
            series_ids: None,
            options: SyncOptions::default(),
        }
    }

    pub fn with_series<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.series_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_data_sources: usize,
    pub enable_auto_recovery: bool,
    pub resume_overlap_days: i64,
    pub min_gap_days: i64,
    /// Rows written between checkpoint saves
    pub sync_batch_size: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_concurrent_data_sources: config.sync.max_concurrent_data_sources,
            enable_auto_recovery: config.sync.enable_auto_recovery,
            resume_overlap_days: config.sync.resume_overlap_days,
            min_gap_days: config.gaps.min_gap_days,
            sync_batch_size: config.batch.sync_batch_size,
        }
    }
}

/// Gaps in one series plus what to do about them
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapReport {
    pub series_id: String,
    pub range: Option<DateRange>,
    pub gaps: Vec<Gap>,
    pub plan: Vec<RemediationItem>,
}

struct RunPlan {
    mode: SyncMode,
    tiers: Vec<(Priority, Vec<SeriesSpec>)>,
    max_concurrent: usize,
    auto_recovery: bool,
}

/// Where one series' work starts
enum FetchPlan {
    Window { start: NaiveDate, fill_gaps: bool },
    GapsOnly,
}

#[derive(Clone)]
pub struct Orchestrator {
    fetcher: Arc<SeriesFetcher>,
    writer: Arc<BatchWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<RwLock<Vec<SeriesSpec>>>,
    settings: Arc<OrchestratorSettings>,
    board: Arc<StatusBoard>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<SeriesFetcher>,
        writer: Arc<BatchWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
        series: Vec<SeriesSpec>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            fetcher,
            writer,
            checkpoints,
            registry: Arc::new(RwLock::new(series)),
            settings: Arc::new(settings),
            board: Arc::new(StatusBoard::new()),
        }
    }

    /// Wire the limiter, retry policy, fetcher and writer from configuration
    pub fn from_config(
        config: &SyncConfig,
        source: Arc<dyn SeriesSource>,
        store: Arc<dyn ObservationStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let retry = RetryPolicy::from_config(&config.retry);
        let fetcher = SeriesFetcher::new(source, limiter, retry.clone(), config.upstream.page_size);
        let writer = BatchWriter::new(store, &config.batch, &retry);

        Self::new(
            Arc::new(fetcher),
            Arc::new(writer),
            checkpoints,
            config.series.clone(),
            OrchestratorSettings::from_config(config),
        )
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn store(&self) -> &Arc<dyn ObservationStore> {
        self.writer.store()
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.fetcher.limiter()
    }

    pub fn series(&self) -> Vec<SeriesSpec> {
        self.registry.read().clone()
    }

    pub fn find_series(&self, series_id: &str) -> Option<SeriesSpec> {
        self.registry
            .read()
            .iter()
            .find(|s| s.id == series_id)
            .cloned()
    }

    /// Add or replace a registered series
    pub fn register(&self, spec: SeriesSpec) {
        let mut registry = self.registry.write();
        match registry.iter_mut().find(|s| s.id == spec.id) {
            Some(existing) => *existing = spec,
            None => registry.push(spec),
        }
    }

    /// Execute one run. Never fails: initialization errors come back as a
    /// report in the `failed` phase.
    pub async fn run(&self, request: SyncRequest, cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4().to_string();

        let plan = match self.resolve(&request) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Sync run {} could not start: {}", run_id, e);
                let mut report = RunReport::new(run_id, request.mode, 0);
                report.error = Some(e.to_string());
                report.finish(RunPhase::Failed);
                self.board.publish(&report);
                return report;
            }
        };

        let kind = plan.mode.kind();
        let total: usize = plan.tiers.iter().map(|(_, specs)| specs.len()).sum();
        let mut report = RunReport::new(run_id.clone(), kind, total);
        report.phase = RunPhase::Running;

        // Last run's row count is the best size estimate before fetching
        for spec in plan.tiers.iter().flat_map(|(_, specs)| specs) {
            let known = self.load_checkpoint(&spec.id).await.ok().flatten();
            if let Some(cp) = known.filter(|cp| cp.total_count > 0) {
                report.expect_records(&spec.id, cp.total_count as usize);
            }
        }
        self.board.begin(&report);

        info!(
            "Sync run {} started: mode={}, series={}, max_concurrent={}",
            run_id, kind, total, plan.max_concurrent
        );

        for (priority, specs) in &plan.tiers {
            report.current_tier = Some(priority.as_str().to_string());
            self.board.publish(&report);

            if cancel.is_cancelled() {
                for spec in specs {
                    let mut result = SyncResult::new(&spec.id, kind);
                    result.outcome = SeriesOutcome::Paused;
                    result
                        .warnings
                        .push("run cancelled before series started".to_string());
                    report.record(result);
                }
                continue;
            }

            info!("Processing {} tier: {} series", priority.as_str(), specs.len());
            let results = self
                .run_tier(specs, &plan.mode, &run_id, plan.max_concurrent, &cancel)
                .await;

            let failed: Vec<SeriesSpec> = specs
                .iter()
                .filter(|spec| {
                    results
                        .iter()
                        .any(|r| r.series_id == spec.id && r.outcome == SeriesOutcome::Failed)
                })
                .cloned()
                .collect();
            let first_errors: HashMap<String, Vec<String>> = results
                .iter()
                .filter(|r| r.outcome == SeriesOutcome::Failed)
                .map(|r| (r.series_id.clone(), r.errors.clone()))
                .collect();

            for result in results {
                report.record(result);
            }

            if plan.auto_recovery && !failed.is_empty() && !cancel.is_cancelled() {
                info!(
                    "Auto-recovery: retrying {} failed series in {} tier",
                    failed.len(),
                    priority.as_str()
                );
                let retried = self
                    .run_tier(&failed, &plan.mode, &run_id, plan.max_concurrent, &cancel)
                    .await;
                for mut result in retried {
                    if !result.failed() {
                        let earlier = first_errors
                            .get(&result.series_id)
                            .map(|e| e.join("; "))
                            .unwrap_or_default();
                        result.warnings.push(format!(
                            "succeeded on automatic retry after: {}",
                            earlier
                        ));
                    }
                    report.record(result);
                }
            }

            report.update_progress(self.board.elapsed_secs());
            self.board.publish(&report);
        }

        report.phase = RunPhase::Completing;
        self.board.publish(&report);

        report.finish(RunPhase::Completed);
        self.board.publish(&report);

        info!(
            "Sync run {} completed: {} series, {} failed, {} records",
            run_id, report.processed_series, report.failed_series, report.processed_records
        );
        report
    }

    fn resolve(&self, request: &SyncRequest) -> Result<RunPlan> {
        let selected: Vec<SeriesSpec> = {
            let registry = self.registry.read();
            match &request.series_ids {
                Some(ids) if !ids.is_empty() => {
                    let mut seen = HashSet::new();
                    ids.iter()
                        .filter(|id| seen.insert(id.as_str()))
                        .map(|id| {
                            registry.iter().find(|s| &s.id == id).cloned().ok_or_else(|| {
                                SyncError::NotFound(format!("series {} is not registered", id))
                            })
                        })
                        .collect::<Result<_>>()?
                }
                _ => registry.clone(),
            }
        };

        let mode = match request.mode {
            SyncModeKind::Full => SyncMode::Full,
            SyncModeKind::Incremental => SyncMode::Incremental,
            SyncModeKind::Backfill => SyncMode::Backfill,
            SyncModeKind::Recovery => match selected.as_slice() {
                [one] => SyncMode::Recovery {
                    series_id: one.id.clone(),
                },
                other => {
                    return Err(SyncError::State(format!(
                        "recovery mode needs exactly one series, got {}",
                        other.len()
                    )))
                }
            },
        };

        let tiers = Priority::ALL
            .iter()
            .map(|p| {
                let specs: Vec<SeriesSpec> = selected
                    .iter()
                    .filter(|s| s.priority == *p)
                    .cloned()
                    .collect();
                (*p, specs)
            })
            .filter(|(_, specs)| !specs.is_empty())
            .collect();

        Ok(RunPlan {
            mode,
            tiers,
            max_concurrent: request
                .options
                .max_concurrent
                .unwrap_or(self.settings.max_concurrent_data_sources)
                .max(1),
            auto_recovery: request
                .options
                .enable_auto_recovery
                .unwrap_or(self.settings.enable_auto_recovery),
        })
    }

    /// Bounded worker pool over one tier. Results come back in input order.
    async fn run_tier(
        &self,
        specs: &[SeriesSpec],
        mode: &SyncMode,
        run_id: &str,
        max_concurrent: usize,
        cancel: &CancellationToken,
    ) -> Vec<SyncResult> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut tasks = JoinSet::new();

        for spec in specs.iter().cloned() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let this = self.clone();
            let mode = mode.clone();
            let run_id = run_id.to_string();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let series_id = spec.id.clone();
                let task = this.sync_series(&spec, &mode, &run_id, &cancel);

                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!("Series {} panicked: {}", series_id, message);
                        let mut result = SyncResult::new(series_id, mode.kind());
                        result.outcome = SeriesOutcome::Failed;
                        result
                            .errors
                            .push(format!("series task panicked: {}", message));
                        result
                    }
                }
            });
        }

        let mut by_id: HashMap<String, SyncResult> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    by_id.insert(result.series_id.clone(), result);
                }
                Err(e) => error!("Series task did not complete: {}", e),
            }
        }

        specs
            .iter()
            .map(|spec| {
                by_id.remove(&spec.id).unwrap_or_else(|| {
                    let mut result = SyncResult::new(&spec.id, mode.kind());
                    result.outcome = SeriesOutcome::Failed;
                    result
                        .errors
                        .push("series task did not report a result".to_string());
                    result
                })
            })
            .collect()
    }

    async fn sync_series(
        &self,
        spec: &SeriesSpec,
        mode: &SyncMode,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::new(&spec.id, mode.kind());

        let previous = match self.load_checkpoint(&spec.id).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Could not load checkpoint for {}: {}", spec.id, e);
                result
                    .warnings
                    .push(format!("checkpoint unavailable: {}", e));
                None
            }
        };

        let mut checkpoint = match &previous {
            Some(prev) => Checkpoint::continue_from(prev, run_id, 0),
            None => Checkpoint::start(&spec.id, run_id, 0),
        };
        self.save_checkpoint(&checkpoint, &mut result).await;

        let status = match self
            .execute_series(spec, mode, previous.as_ref(), &mut checkpoint, cancel, &mut result)
            .await
        {
            Ok(()) if result.errors.is_empty() => {
                result.outcome = SeriesOutcome::Succeeded;
                CheckpointStatus::Completed
            }
            Ok(()) => {
                result.outcome = SeriesOutcome::Failed;
                CheckpointStatus::Failed
            }
            Err(e) if e.is_cancelled() => {
                warn!("Series {} paused: {}", spec.id, e);
                result.outcome = SeriesOutcome::Paused;
                result.warnings.push(e.to_string());
                CheckpointStatus::Paused
            }
            Err(e) => {
                error!("Series {} failed: {}", spec.id, e);
                result.outcome = SeriesOutcome::Failed;
                result.errors.push(e.to_string());
                if let SyncError::Validation { issues, .. } = &e {
                    push_capped(&mut result.errors, issues.iter().map(describe_issue));
                }
                CheckpointStatus::Failed
            }
        };

        if checkpoint.held && result.errors.is_empty() {
            result.warnings.push(format!(
                "checkpoint still held at {:?} by an earlier failed write; run recovery to refetch",
                checkpoint.last_synced_date
            ));
        }
        checkpoint.finish(status);
        self.save_checkpoint(&checkpoint, &mut result).await;

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            series_id = %spec.id,
            outcome = ?result.outcome,
            fetched = result.fetched,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            gaps_detected = result.gaps_detected,
            gaps_filled = result.gaps_filled,
            "Series sync finished in {}ms",
            result.duration_ms
        );
        result
    }

    async fn execute_series(
        &self,
        spec: &SeriesSpec,
        mode: &SyncMode,
        previous: Option<&Checkpoint>,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Result<()> {
        let today = Utc::now().date_naive();
        let lookback_start = years_before(today, spec.lookback_years());

        let plan = match mode {
            SyncMode::Full => FetchPlan::Window {
                start: lookback_start,
                fill_gaps: true,
            },
            SyncMode::Incremental => {
                let id = spec.id.clone();
                match self.read_store(move |s| s.latest_date(&id)).await? {
                    Some(latest) => FetchPlan::Window {
                        start: latest - spec.frequency.incremental_margin(),
                        fill_gaps: false,
                    },
                    None => {
                        warn!("No stored observations for {}, using lookback window", spec.id);
                        result.warnings.push(
                            "no stored observations, fetched the full lookback window".to_string(),
                        );
                        FetchPlan::Window {
                            start: lookback_start,
                            fill_gaps: false,
                        }
                    }
                }
            }
            SyncMode::Recovery { .. } => {
                if let Some(cp) = previous.filter(|cp| !cp.is_resumable()) {
                    info!(
                        "Checkpoint for {} is already {}, re-reading from {:?}",
                        spec.id, cp.status, cp.last_synced_date
                    );
                    result
                        .warnings
                        .push(format!("checkpoint already {}, nothing to resume", cp.status));
                }
                match previous.and_then(|cp| cp.resume_date(self.settings.resume_overlap_days)) {
                    Some(resume) => {
                        info!("Resuming {} from {}", spec.id, resume);
                        FetchPlan::Window {
                            start: resume,
                            fill_gaps: true,
                        }
                    }
                    None => {
                        warn!("No checkpoint to resume {} from, using lookback window", spec.id);
                        result.warnings.push(
                            "no checkpoint to resume from, fetched the full lookback window"
                                .to_string(),
                        );
                        FetchPlan::Window {
                            start: lookback_start,
                            fill_gaps: true,
                        }
                    }
                }
            }
            SyncMode::Backfill => FetchPlan::GapsOnly,
        };

        match plan {
            FetchPlan::Window { start, fill_gaps } => {
                let raw = self.fetcher.fetch(&spec.id, start, cancel).await?;
                result.fetched += raw.len();

                let rows = self.validate(spec, &raw, result)?;
                checkpoint.total_count += rows.len() as u64;
                checkpoint.last_observation_date = rows.last().map(|o| o.date);
                self.write_batches(spec, rows, Some(start), checkpoint, cancel, result)
                    .await?;

                if fill_gaps {
                    // Only the stored span counts; a series younger than the
                    // lookback has no leading gap
                    let id = spec.id.clone();
                    let dates = self
                        .read_store(move |s| s.existing_dates(&id, Some(start), None))
                        .await?;
                    if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
                        self.fill_gaps(spec, DateRange::new(*first, *last), checkpoint, cancel, result)
                            .await?;
                    }
                }
            }
            FetchPlan::GapsOnly => {
                let id = spec.id.clone();
                let span = self
                    .read_store(move |s| Ok((s.earliest_date(&id)?, s.latest_date(&id)?)))
                    .await?;
                match span {
                    (Some(first), Some(last)) => {
                        self.fill_gaps(spec, DateRange::new(first, last), checkpoint, cancel, result)
                            .await?;
                    }
                    _ => {
                        result
                            .warnings
                            .push("no stored history to backfill".to_string());
                    }
                }
            }
        }

        Ok(())
    }

    /// Detect gaps in `range`, fetch each missing run, then count the runs
    /// that closed
    async fn fill_gaps(
        &self,
        spec: &SeriesSpec,
        range: DateRange,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Result<()> {
        let gaps = self.detect(spec, range).await?;
        result.gaps_detected += gaps.len();
        if gaps.is_empty() {
            return Ok(());
        }

        info!("Filling {} gap(s) in {}", gaps.len(), spec.id);
        for gap in &gaps {
            let raw = self
                .fetcher
                .fetch_range(&spec.id, gap.gap_start, Some(gap.gap_end), cancel)
                .await?;
            result.fetched += raw.len();

            let rows = self.validate(spec, &raw, result)?;
            checkpoint.total_count += rows.len() as u64;
            // A refill only covers its own run, so it never lifts a hold
            self.write_batches(spec, rows, None, checkpoint, cancel, result)
                .await?;
        }

        let remaining = self.detect(spec, range).await?;
        result.gaps_filled += gaps
            .iter()
            .filter(|g| {
                !remaining
                    .iter()
                    .any(|r| r.gap_start <= g.gap_end && r.gap_end >= g.gap_start)
            })
            .count();

        if !remaining.is_empty() {
            result.warnings.push(format!(
                "{} gap(s) remain after refetch; upstream has no data for them",
                remaining.len()
            ));
        }
        Ok(())
    }

    async fn detect(&self, spec: &SeriesSpec, range: DateRange) -> Result<Vec<Gap>> {
        let id = spec.id.clone();
        let dates = self
            .read_store(move |s| s.existing_dates(&id, Some(range.start), Some(range.end)))
            .await?;
        Ok(detect_gaps(
            &spec.id,
            spec.frequency,
            &dates,
            range.start,
            range.end,
            self.settings.min_gap_days,
        ))
    }

    fn validate(
        &self,
        spec: &SeriesSpec,
        raw: &[RawObservation],
        result: &mut SyncResult,
    ) -> Result<Vec<Observation>> {
        let report = validate_observations(spec, raw);
        push_capped(&mut result.warnings, report.warnings().map(describe_issue));

        if report.has_errors() {
            return Err(SyncError::Validation {
                series_id: spec.id.clone(),
                issues: report.errors().cloned().collect(),
            });
        }

        result.skipped += report.dropped();
        Ok(report.observations)
    }

    /// Upsert in checkpointed batches, ascending by date.
    ///
    /// `window_start` is set when `rows` are everything upstream has from
    /// that date on; while every batch so far wrote cleanly, such a window
    /// may lift a hold left by an earlier failed write.
    async fn write_batches(
        &self,
        spec: &SeriesSpec,
        rows: Vec<Observation>,
        window_start: Option<NaiveDate>,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Result<()> {
        let mut clean_from = window_start;
        for batch in rows.chunks(self.settings.sync_batch_size.max(1)) {
            let outcome = self.writer.upsert(&spec.id, batch.to_vec(), cancel).await?;

            result.inserted += outcome.inserted;
            result.updated += outcome.updated;
            result.skipped += outcome.skipped;
            push_capped(
                &mut result.errors,
                outcome.errors.iter().map(|f| {
                    format!(
                        "failed to write {} row(s) {}..{}: {}",
                        f.rows, f.first_date, f.last_date, f.message
                    )
                }),
            );

            // Only the fully written prefix moves the resume point. A failure
            // holds the checkpoint below it, across later runs too, until a
            // clean window reaching back over the pin releases it.
            if !outcome.errors.is_empty() {
                clean_from = None;
            }
            if let Some(from) = clean_from {
                if checkpoint.release(from) {
                    info!("Released checkpoint hold for {}, rewritten from {}", spec.id, from);
                }
            }

            let written = outcome.written() as u64;
            if let Some(through) = outcome.written_through.filter(|_| written > 0) {
                checkpoint.advance(through, written);
            }
            if let Some(first_failed) = outcome.errors.iter().map(|f| f.first_date).min() {
                checkpoint.hold(outcome.written_through, first_failed);
                warn!(
                    "Holding checkpoint for {} at {:?} after failed write from {}",
                    spec.id, checkpoint.last_synced_date, first_failed
                );
            }
            if written > 0 || !outcome.errors.is_empty() {
                self.save_checkpoint(checkpoint, result).await;
            }
        }
        Ok(())
    }

    async fn load_checkpoint(&self, series_id: &str) -> Result<Option<Checkpoint>> {
        let store = Arc::clone(&self.checkpoints);
        let id = series_id.to_string();
        tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(|e| SyncError::Internal(format!("checkpoint load task failed: {}", e)))?
    }

    /// A failed save only costs re-processing on resume, so it is a warning
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, result: &mut SyncResult) {
        let store = Arc::clone(&self.checkpoints);
        let snapshot = checkpoint.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&snapshot.series_id, &snapshot))
            .await
            .map_err(|e| SyncError::Internal(format!("checkpoint save task failed: {}", e)))
            .and_then(|r| r);

        if let Err(e) = saved {
            warn!("Checkpoint save failed for {}: {}", checkpoint.series_id, e);
            result
                .warnings
                .push(format!("checkpoint save failed: {}", e));
        }
    }

    async fn read_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ObservationStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self.writer.store());
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| SyncError::Internal(format!("store read task failed: {}", e)))?
    }

    /// Gaps and remediation plan for one series. The range defaults to the
    /// stored span.
    pub async fn inspect_gaps(
        &self,
        series_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<GapReport> {
        let spec = self
            .find_series(series_id)
            .ok_or_else(|| SyncError::NotFound(format!("series {} is not registered", series_id)))?;

        let id = spec.id.clone();
        let (earliest, latest) = self
            .read_store(move |s| Ok((s.earliest_date(&id)?, s.latest_date(&id)?)))
            .await?;

        let range = match (from.or(earliest), to.or(latest)) {
            (Some(start), Some(end)) if start <= end => Some(DateRange::new(start, end)),
            _ => None,
        };

        let gaps = match range {
            Some(range) => self.detect(&spec, range).await?,
            None => Vec::new(),
        };
        let plan = plan_remediation(&gaps);

        Ok(GapReport {
            series_id: spec.id,
            range,
            gaps,
            plan,
        })
    }
}

fn describe_issue(issue: &ValidationIssue) -> String {
    match &issue.date {
        Some(date) => format!("{}: {}", date, issue.message),
        None => issue.message.clone(),
    }
}

fn push_capped(target: &mut Vec<String>, items: impl Iterator<Item = String>) {
    let mut overflow = 0usize;
    for item in items {
        if target.len() < MAX_REPORTED_ISSUES {
            target.push(item);
        } else {
            overflow += 1;
        }
    }
    if overflow > 0 {
        target.push(format!("... and {} more", overflow));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
