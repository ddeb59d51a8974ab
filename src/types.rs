//! Shared domain types
//!
//! Series metadata, observations as fetched and as stored, and the
//! calendar helpers every stage needs to agree on.

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Date format used on the wire and in the observation table
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Nominal interval between published observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Annual => "annual",
        }
    }

    /// The `n`th expected date after `start`.
    ///
    /// Month-based cadences step from `start` rather than from the previous
    /// step so that end-of-month clamping does not drift.
    pub fn step(&self, start: NaiveDate, n: u32) -> Option<NaiveDate> {
        match self {
            Frequency::Daily => start.checked_add_signed(Duration::days(n as i64)),
            Frequency::Weekly => start.checked_add_signed(Duration::days(7 * n as i64)),
            Frequency::Monthly => start.checked_add_months(Months::new(n)),
            Frequency::Quarterly => start.checked_add_months(Months::new(3 * n)),
            Frequency::Annual => start.checked_add_months(Months::new(12 * n)),
        }
    }

    /// Calendar bucket a date falls into at this cadence.
    ///
    /// Two dates in the same bucket count as the same observation period,
    /// which tolerates publishers that date a month on the 1st or the 15th.
    pub fn period_key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            Frequency::Daily => (date.year(), date.ordinal()),
            Frequency::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Frequency::Monthly => (date.year(), date.month()),
            Frequency::Quarterly => (date.year(), (date.month() - 1) / 3 + 1),
            Frequency::Annual => (date.year(), 0),
        }
    }

    /// Default history depth for a full sync, in years
    pub fn default_lookback_years(&self) -> u32 {
        match self {
            Frequency::Daily => 2,
            Frequency::Weekly => 5,
            Frequency::Monthly => 10,
            Frequency::Quarterly => 20,
            Frequency::Annual => 30,
        }
    }

    /// Overlap applied to incremental syncs so revisions near the tip are re-read
    pub fn incremental_margin(&self) -> Duration {
        match self {
            Frequency::Daily => Duration::days(5),
            Frequency::Weekly => Duration::weeks(3),
            Frequency::Monthly => Duration::weeks(10),
            Frequency::Quarterly => Duration::weeks(26),
            Frequency::Annual => Duration::weeks(60),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "d" | "daily" => Ok(Frequency::Daily),
            "w" | "weekly" => Ok(Frequency::Weekly),
            "m" | "monthly" => Ok(Frequency::Monthly),
            "q" | "quarterly" => Ok(Frequency::Quarterly),
            "a" | "annual" | "yearly" => Ok(Frequency::Annual),
            other => Err(format!("unknown frequency: {}", other)),
        }
    }
}

/// Processing tier; tiers run strictly in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Registered series metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub frequency: Frequency,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    /// Series whose values may legitimately be negative (spreads, net flows)
    #[serde(default)]
    pub allow_negative: bool,
    /// Overrides the frequency's default full-sync depth
    #[serde(default)]
    pub lookback_years: Option<u32>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

impl SeriesSpec {
    pub fn new(id: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            frequency,
            priority: Priority::Medium,
            allow_negative: false,
            lookback_years: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    pub fn lookback_years(&self) -> u32 {
        self.lookback_years
            .unwrap_or_else(|| self.frequency.default_lookback_years())
    }
}

/// Observation exactly as the upstream returned it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub date: Option<String>,
    pub value: Option<String>,
}

impl RawObservation {
    pub fn new(date: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            date: Some(date.into()),
            value: Some(value.into()),
        }
    }
}

/// A cleaned observation keyed by `(series_id, date)`.
///
/// `value == None` is a published "no data" marker; it is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub series_id: String,
    pub date: NaiveDate,
    pub value: Option<f64>,
}

impl Observation {
    pub fn new(series_id: impl Into<String>, date: NaiveDate, value: f64) -> Self {
        Self {
            series_id: series_id.into(),
            date,
            value: Some(value),
        }
    }
}

/// Inclusive calendar range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Subtract whole years, clamping Feb 29 to Feb 28
pub fn years_before(date: NaiveDate, years: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(12 * years))
        .unwrap_or(NaiveDate::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_monthly_step_does_not_drift() {
        let start = d("2024-01-31");
        assert_eq!(Frequency::Monthly.step(start, 1), Some(d("2024-02-29")));
        assert_eq!(Frequency::Monthly.step(start, 2), Some(d("2024-03-31")));
        assert_eq!(Frequency::Quarterly.step(start, 1), Some(d("2024-04-30")));
    }

    #[test]
    fn test_period_keys() {
        assert_eq!(
            Frequency::Monthly.period_key(d("2024-03-01")),
            Frequency::Monthly.period_key(d("2024-03-15"))
        );
        assert_ne!(
            Frequency::Daily.period_key(d("2024-03-01")),
            Frequency::Daily.period_key(d("2024-03-02"))
        );
        assert_eq!(Frequency::Quarterly.period_key(d("2024-06-30")), (2024, 2));
        assert_eq!(
            Frequency::Weekly.period_key(d("2024-01-01")),
            Frequency::Weekly.period_key(d("2024-01-07"))
        );
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!("D".parse::<Frequency>(), Ok(Frequency::Daily));
        assert_eq!("quarterly".parse::<Frequency>(), Ok(Frequency::Quarterly));
        assert!("hourly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_years_before_leap_day() {
        assert_eq!(years_before(d("2024-02-29"), 1), d("2023-02-28"));
    }

    #[test]
    fn test_series_spec_deserialize_defaults() {
        let spec: SeriesSpec =
            serde_json::from_str(r#"{"id": "DGS10", "frequency": "daily"}"#).unwrap();
        assert_eq!(spec.priority, Priority::Medium);
        assert!(!spec.allow_negative);
        assert_eq!(spec.lookback_years(), 2);
    }
}
