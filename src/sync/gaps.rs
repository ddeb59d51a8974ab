//! Gap detection and remediation planning
//!
//! Expected dates are generated at the series' cadence from the start of the
//! range and matched against stored dates by calendar period (day, ISO week,
//! month, quarter, year). Consecutive missing periods collapse into runs; a
//! run is reported once it covers at least `min_gap_days` calendar days.
//!
//! Detection is a pure function of its inputs, so the same snapshot always
//! yields the same gaps.

use crate::types::{DateRange, Frequency};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on generated expected dates, guards against absurd ranges
const MAX_EXPECTED_POINTS: u32 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl GapSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapSeverity::Low => "low",
            GapSeverity::Medium => "medium",
            GapSeverity::High => "high",
            GapSeverity::Critical => "critical",
        }
    }
}

/// A contiguous run of expected-but-missing observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub series_id: String,
    pub frequency: Frequency,
    /// Last present observation before the run (or the run's first date)
    pub gap_start: NaiveDate,
    /// First present observation after the run (or the run's last date)
    pub gap_end: NaiveDate,
    /// Calendar days covered by the missing periods
    pub gap_days: i64,
    /// Expected observations in `[gap_start, gap_end]`
    pub expected_points: usize,
    /// Present observations in `[gap_start, gap_end]`
    pub actual_points: usize,
    pub missing_points: usize,
    pub severity: GapSeverity,
}

impl Gap {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.gap_start, self.gap_end)
    }
}

/// Severity thresholds for one cadence: `(min_days, more_than_points)`
struct SeverityTable {
    critical: (i64, usize),
    high: (i64, usize),
    medium: (i64, usize),
}

fn severity_table(frequency: Frequency) -> SeverityTable {
    match frequency {
        Frequency::Daily => SeverityTable {
            critical: (30, 50),
            high: (14, 20),
            medium: (7, 5),
        },
        Frequency::Weekly => SeverityTable {
            critical: (90, 12),
            high: (42, 6),
            medium: (21, 3),
        },
        Frequency::Monthly => SeverityTable {
            critical: (365, 12),
            high: (180, 6),
            medium: (90, 3),
        },
        Frequency::Quarterly => SeverityTable {
            critical: (730, 8),
            high: (365, 4),
            medium: (180, 2),
        },
        Frequency::Annual => SeverityTable {
            critical: (1825, 5),
            high: (1095, 3),
            medium: (730, 2),
        },
    }
}

/// Classify a gap. Monotone in both `gap_days` and `missing_points`.
pub fn classify_severity(frequency: Frequency, gap_days: i64, missing_points: usize) -> GapSeverity {
    let table = severity_table(frequency);
    let hits = |(days, points): (i64, usize)| gap_days >= days || missing_points > points;

    if hits(table.critical) {
        GapSeverity::Critical
    } else if hits(table.high) {
        GapSeverity::High
    } else if hits(table.medium) {
        GapSeverity::Medium
    } else {
        GapSeverity::Low
    }
}

/// Expected observation dates in `[start, end]` at `frequency`
pub fn expected_dates(frequency: Frequency, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    for n in 0..MAX_EXPECTED_POINTS {
        match frequency.step(start, n) {
            Some(date) if date <= end => dates.push(date),
            _ => break,
        }
    }
    dates
}

/// Find missing-date runs of at least `min_gap_days` in `[range_start, range_end]`
pub fn detect_gaps(
    series_id: &str,
    frequency: Frequency,
    existing_dates: &[NaiveDate],
    range_start: NaiveDate,
    range_end: NaiveDate,
    min_gap_days: i64,
) -> Vec<Gap> {
    if range_start > range_end {
        return Vec::new();
    }

    // Earliest stored date per period, so reported anchors are real observations
    let mut present: HashMap<(i32, u32), NaiveDate> = HashMap::new();
    for &date in existing_dates {
        present
            .entry(frequency.period_key(date))
            .and_modify(|d| *d = (*d).min(date))
            .or_insert(date);
    }

    let expected = expected_dates(frequency, range_start, range_end);
    let found: Vec<Option<NaiveDate>> = expected
        .iter()
        .map(|d| present.get(&frequency.period_key(*d)).copied())
        .collect();

    let mut gaps = Vec::new();
    let mut i = 0;
    while i < expected.len() {
        if found[i].is_some() {
            i += 1;
            continue;
        }

        let first = i;
        while i < expected.len() && found[i].is_none() {
            i += 1;
        }
        let last = i - 1;

        let before = first.checked_sub(1);
        let after = (i < expected.len()).then_some(i);

        // Calendar coverage of the missing periods
        let lower = expected[first];
        let upper = match after {
            Some(next) => expected[next] - Duration::days(1),
            None => range_end,
        };
        let gap_days = (upper - lower).num_days() + 1;
        if gap_days < min_gap_days {
            continue;
        }

        let missing_points = last - first + 1;
        let anchors = before.is_some() as usize + after.is_some() as usize;

        gaps.push(Gap {
            series_id: series_id.to_string(),
            frequency,
            gap_start: before.and_then(|b| found[b]).unwrap_or(expected[first]),
            gap_end: after.and_then(|a| found[a]).unwrap_or(expected[last]),
            gap_days,
            expected_points: missing_points + anchors,
            actual_points: anchors,
            missing_points,
            severity: classify_severity(frequency, gap_days, missing_points),
        });
    }

    gaps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    ImmediateFetch,
    ScheduledFetch,
    Backfill,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationItem {
    /// 1 is most urgent
    pub priority: usize,
    pub series_id: String,
    pub action: RemediationAction,
    pub severity: GapSeverity,
    pub estimated_records: usize,
    pub time_range: DateRange,
}

fn remediation_action(gap: &Gap) -> RemediationAction {
    if gap.severity == GapSeverity::Critical {
        RemediationAction::ImmediateFetch
    } else if gap.severity == GapSeverity::High && gap.gap_days > 30 {
        RemediationAction::Backfill
    } else if gap.frequency == Frequency::Daily && gap.gap_days <= 7 {
        // Heals on the next incremental run
        RemediationAction::ScheduledFetch
    } else {
        RemediationAction::ManualReview
    }
}

/// Prioritized remediation plan; most severe first, ties keep input order
pub fn plan_remediation(gaps: &[Gap]) -> Vec<RemediationItem> {
    let mut ordered: Vec<&Gap> = gaps.iter().collect();
    ordered.sort_by_key(|g| std::cmp::Reverse(g.severity));

    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, gap)| RemediationItem {
            priority: idx + 1,
            series_id: gap.series_id.clone(),
            action: remediation_action(gap),
            severity: gap.severity,
            estimated_records: gap.missing_points,
            time_range: gap.range(),
        })
        .collect()
}
