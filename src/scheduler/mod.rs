//! Scheduled background work
//!
//! - Daily incremental sync at a configured local time, followed by
//!   checkpoint housekeeping

mod daily_sync;

pub use daily_sync::DailySyncScheduler;
