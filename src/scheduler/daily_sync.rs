//! Daily incremental sync
//!
//! Sleeps until the configured local wall-clock time, runs an incremental
//! sync over every registered series, then prunes stale checkpoints.

use crate::config::ScheduleConfig;
use crate::error::{Result, SyncError};
use crate::state::AppState;
use crate::sync::orchestrator::{SyncModeKind, SyncRequest};
use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct DailySyncScheduler {
    state: Arc<AppState>,
    timezone: Tz,
    at: NaiveTime,
}

impl DailySyncScheduler {
    pub fn new(state: Arc<AppState>, config: &ScheduleConfig) -> Result<Self> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|_| SyncError::Config(format!("Unknown timezone: {}", config.timezone)))?;
        let at = NaiveTime::from_hms_opt(config.hour, config.minute, 0).ok_or_else(|| {
            SyncError::Config(format!(
                "Invalid schedule time {:02}:{:02}",
                config.hour, config.minute
            ))
        })?;

        Ok(Self {
            state,
            timezone,
            at,
        })
    }

    /// Next UTC instant strictly after `now` at which the local clock in
    /// `timezone` reads `at`
    pub fn next_run_after(timezone: Tz, at: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = now.with_timezone(&timezone).date_naive();
        loop {
            let candidate = match timezone.from_local_datetime(&day.and_time(at)) {
                LocalResult::Single(t) => Some(t),
                LocalResult::Ambiguous(first, _) => Some(first),
                // Skipped by a DST jump: run an hour later that day
                LocalResult::None => timezone
                    .from_local_datetime(&(day.and_time(at) + ChronoDuration::hours(1)))
                    .earliest(),
            };

            if let Some(t) = candidate {
                let t = t.with_timezone(&Utc);
                if t > now {
                    return t;
                }
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => return now + ChronoDuration::days(1),
            };
        }
    }

    fn duration_until_next(&self) -> Duration {
        let now = Utc::now();
        let next = Self::next_run_after(self.timezone, self.at, now);
        (next - now).to_std().unwrap_or(Duration::from_secs(60))
    }

    /// Spawn the scheduler loop; it exits when the shutdown token fires
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Daily sync scheduled at {} {}",
                self.at.format("%H:%M"),
                self.timezone
            );

            loop {
                let wait = self.duration_until_next();
                info!(
                    "Next scheduled sync in {} hours {} minutes",
                    wait.as_secs() / 3600,
                    (wait.as_secs() % 3600) / 60
                );

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.state.shutdown.cancelled() => {
                        info!("Scheduler stopped");
                        return;
                    }
                }

                self.execute().await;
            }
        })
    }

    async fn execute(&self) {
        info!("Running scheduled incremental sync");
        match self
            .state
            .run_sync(SyncRequest::new(SyncModeKind::Incremental))
            .await
        {
            Ok(report) => info!(
                "Scheduled sync {} finished: {} series, {} failed",
                report.run_id, report.processed_series, report.failed_series
            ),
            Err(e) => warn!("Scheduled sync skipped: {}", e),
        }

        if let Err(e) = self.state.prune().await {
            error!("Checkpoint housekeeping failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_run_later_today() {
        let at = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        // 05:00 EST
        let next = DailySyncScheduler::next_run_after(New_York, at, utc("2024-01-10T10:00:00Z"));
        assert_eq!(next, utc("2024-01-10T11:00:00Z"));
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        let at = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let next = DailySyncScheduler::next_run_after(New_York, at, utc("2024-01-10T11:00:00Z"));
        assert_eq!(next, utc("2024-01-11T11:00:00Z"));
    }

    #[test]
    fn test_next_run_follows_dst() {
        let at = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        // Clocks spring forward on 2024-03-10; 06:00 EDT is 10:00 UTC
        let next = DailySyncScheduler::next_run_after(New_York, at, utc("2024-03-09T12:00:00Z"));
        assert_eq!(next, utc("2024-03-10T10:00:00Z"));
    }

    #[test]
    fn test_skipped_local_time_runs_an_hour_later() {
        // 02:30 does not exist on 2024-03-10 in New York
        let at = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        let next = DailySyncScheduler::next_run_after(New_York, at, utc("2024-03-10T05:00:00Z"));
        assert_eq!(next, utc("2024-03-10T07:30:00Z"));
    }
}
