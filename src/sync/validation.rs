//! Observation validation and cleaning
//!
//! Every raw `(date, value)` pair is either converted into an
//! [`Observation`] or dropped with a classified issue. Error-severity
//! issues invalidate the whole batch; warnings are recorded only.

use crate::types::{parse_date, Observation, RawObservation, SeriesSpec};
use serde::{Deserialize, Serialize};

/// Values upstream publishes in place of a missing observation
pub const NO_DATA_SENTINELS: [&str; 8] = [".", "", "na", "n/a", "#n/a", "null", "none", "nd"];

/// A value further than this many batch ranges outside the batch is flagged
pub const OUTLIER_RANGE_FACTOR: f64 = 10.0;

/// Below this many values the batch range is not meaningful
const MIN_OUTLIER_SAMPLE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingDate,
    MalformedDate,
    NoData,
    NonNumeric,
    NonFinite,
    Negative,
    Outlier,
}

impl IssueKind {
    pub fn severity(&self) -> IssueSeverity {
        match self {
            IssueKind::NoData | IssueKind::Outlier => IssueSeverity::Warning,
            _ => IssueSeverity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub date: Option<String>,
    pub value: Option<String>,
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub message: String,
}

impl ValidationIssue {
    fn new(raw: &RawObservation, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            date: raw.date.clone(),
            value: raw.value.clone(),
            kind,
            severity: kind.severity(),
            message: message.into(),
        }
    }
}

/// Cleaned observations plus everything found along the way
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub observations: Vec<Observation>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
    }

    /// Raw rows that did not become observations
    pub fn dropped(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.kind != IssueKind::Outlier)
            .count()
    }
}

fn is_no_data(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    NO_DATA_SENTINELS.contains(&normalized.as_str())
}

/// Validate and clean one fetched batch for `series`
pub fn validate_observations(series: &SeriesSpec, raw: &[RawObservation]) -> ValidationReport {
    let mut report = ValidationReport::default();

    for row in raw {
        let date = match row.date.as_deref().map(str::trim) {
            None | Some("") => {
                report
                    .issues
                    .push(ValidationIssue::new(row, IssueKind::MissingDate, "missing date"));
                continue;
            }
            Some(s) => match parse_date(s) {
                Some(date) => date,
                None => {
                    report.issues.push(ValidationIssue::new(
                        row,
                        IssueKind::MalformedDate,
                        format!("malformed date '{}'", s),
                    ));
                    continue;
                }
            },
        };

        let text = match row.value.as_deref() {
            Some(v) if !is_no_data(v) => v.trim(),
            _ => {
                report.issues.push(ValidationIssue::new(
                    row,
                    IssueKind::NoData,
                    format!("no data published for {}", date),
                ));
                continue;
            }
        };

        let value: f64 = match text.parse() {
            Ok(v) => v,
            Err(_) => {
                report.issues.push(ValidationIssue::new(
                    row,
                    IssueKind::NonNumeric,
                    format!("non-numeric value '{}'", text),
                ));
                continue;
            }
        };

        if !value.is_finite() {
            report.issues.push(ValidationIssue::new(
                row,
                IssueKind::NonFinite,
                format!("non-finite value {}", value),
            ));
            continue;
        }

        if value < 0.0 && !series.allow_negative {
            report.issues.push(ValidationIssue::new(
                row,
                IssueKind::Negative,
                format!("negative value {} not allowed for {}", value, series.id),
            ));
            continue;
        }

        report
            .observations
            .push(Observation::new(series.id.clone(), date, value));
    }

    flag_outliers(&mut report);
    report.observations.sort_by_key(|o| o.date);
    report
}

/// Warn on values far outside the range spanned by the rest of the batch.
/// Outliers are kept.
fn flag_outliers(report: &mut ValidationReport) {
    let mut values: Vec<f64> = report
        .observations
        .iter()
        .filter_map(|o| o.value)
        .collect();
    if values.len() < MIN_OUTLIER_SAMPLE {
        return;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    let (min, second_min) = (values[0], values[1]);
    let (max, second_max) = (values[n - 1], values[n - 2]);

    let mut outliers = Vec::new();
    for obs in &report.observations {
        let Some(v) = obs.value else { continue };

        // Range of the batch without this value
        let rest_min = if v == min { second_min } else { min };
        let rest_max = if v == max { second_max } else { max };
        let span = rest_max - rest_min;
        if span <= 0.0 {
            continue;
        }

        let distance = if v > rest_max {
            v - rest_max
        } else if v < rest_min {
            rest_min - v
        } else {
            0.0
        };

        if distance > OUTLIER_RANGE_FACTOR * span {
            outliers.push(ValidationIssue {
                date: Some(obs.date.to_string()),
                value: Some(v.to_string()),
                kind: IssueKind::Outlier,
                severity: IssueSeverity::Warning,
                message: format!(
                    "value {} is more than {}x the batch range [{}, {}] away",
                    v, OUTLIER_RANGE_FACTOR, rest_min, rest_max
                ),
            });
        }
    }

    report.issues.extend(outliers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frequency;

    fn series() -> SeriesSpec {
        SeriesSpec::new("DGS10", Frequency::Daily)
    }

    fn raw(date: &str, value: &str) -> RawObservation {
        RawObservation::new(date, value)
    }

    #[test]
    fn test_clean_batch() {
        let report = validate_observations(
            &series(),
            &[raw("2024-01-02", "4.01"), raw("2024-01-01", "3.95")],
        );
        assert!(report.issues.is_empty());
        assert_eq!(report.observations.len(), 2);
        // sorted ascending
        assert_eq!(report.observations[0].value, Some(3.95));
    }

    #[test]
    fn test_no_data_sentinel_is_warning_and_dropped() {
        let report = validate_observations(
            &series(),
            &[
                raw("2024-01-01", "."),
                raw("2024-01-02", ""),
                RawObservation {
                    date: Some("2024-01-03".into()),
                    value: None,
                },
                raw("2024-01-04", "4.1"),
            ],
        );
        assert!(!report.has_errors());
        assert_eq!(report.warnings().count(), 3);
        assert_eq!(report.observations.len(), 1);
        assert_eq!(report.dropped(), 3);
    }

    #[test]
    fn test_error_kinds() {
        let report = validate_observations(
            &series(),
            &[
                RawObservation {
                    date: None,
                    value: Some("1.0".into()),
                },
                raw("01/02/2024", "1.0"),
                raw("2024-01-03", "abc"),
                raw("2024-01-04", "inf"),
                raw("2024-01-05", "-2.5"),
            ],
        );
        let kinds: Vec<IssueKind> = report.errors().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::MissingDate,
                IssueKind::MalformedDate,
                IssueKind::NonNumeric,
                IssueKind::NonFinite,
                IssueKind::Negative,
            ]
        );
        assert!(report.has_errors());
        assert!(report.observations.is_empty());
    }

    #[test]
    fn test_negative_allowed_for_listed_series() {
        let spec = series().allowing_negative();
        let report = validate_observations(&spec, &[raw("2024-01-05", "-2.5")]);
        assert!(report.issues.is_empty());
        assert_eq!(report.observations[0].value, Some(-2.5));
    }

    #[test]
    fn test_outlier_is_warning_and_kept() {
        let mut rows: Vec<RawObservation> = (1..=9)
            .map(|d| raw(&format!("2024-01-0{}", d), &format!("{}", 4.0 + d as f64 * 0.01)))
            .collect();
        rows.push(raw("2024-01-10", "500"));

        let report = validate_observations(&series(), &rows);
        assert!(!report.has_errors());
        let warnings: Vec<&ValidationIssue> = report.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, IssueKind::Outlier);
        assert_eq!(report.observations.len(), 10);
    }

    #[test]
    fn test_flat_series_has_no_outliers() {
        let rows: Vec<RawObservation> = (1..=5)
            .map(|d| raw(&format!("2024-01-0{}", d), "1.0"))
            .collect();
        let report = validate_observations(&series(), &rows);
        assert!(report.issues.is_empty());
    }
}
