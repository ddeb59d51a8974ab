//! Sync engine
//!
//! Rate-limited fetching, validation, gap analysis, chunked upserts,
//! checkpointing and the orchestrator that ties them into runs.

pub mod checkpoint;
pub mod fetcher;
pub mod gaps;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod status;
pub mod validation;
pub mod writer;

pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
pub use fetcher::SeriesFetcher;
pub use gaps::{detect_gaps, plan_remediation, Gap, GapSeverity, RemediationAction, RemediationItem};
pub use orchestrator::{
    GapReport, Orchestrator, OrchestratorSettings, SyncMode, SyncModeKind, SyncOptions, SyncRequest,
};
pub use rate_limiter::{RateLimiter, RateLimiterState};
pub use retry::RetryPolicy;
pub use status::{RunOutcome, RunPhase, RunReport, SeriesOutcome, StatusBoard, SyncResult};
pub use validation::{validate_observations, IssueKind, IssueSeverity, ValidationIssue, ValidationReport};
pub use writer::{BatchWriter, ChunkOutcome, ObservationStore, SeriesCoverage, UpsertOutcome, WriteFailure};
