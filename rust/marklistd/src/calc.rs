use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt::Display;

pub const UNKNOWN_LEVEL: &str = "UNKNOWN";
pub const UNSCORED_LEVEL: &str = "-";

/// Two-decimal rounding, half away from zero. Applied to every mean and
/// deviation the mark list reports.
pub fn round_off_2_decimal(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query(e: impl Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn persistence(e: impl Display) -> Self {
        Self::new("persistence_failed", e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBoundary {
    pub min_marks: f64,
    pub max_marks: f64,
    pub pl: String,
    pub ab: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    Band { pl: &'a str, ab: &'a str },
    /// Score present but outside every configured interval.
    Unknown,
    /// No score recorded.
    Unscored,
}

impl<'a> Classification<'a> {
    pub fn label(&self) -> &'a str {
        match *self {
            Classification::Band { pl, .. } => pl,
            Classification::Unknown => UNKNOWN_LEVEL,
            Classification::Unscored => UNSCORED_LEVEL,
        }
    }

    pub fn abbreviation(&self) -> &'a str {
        match *self {
            Classification::Band { ab, .. } => ab,
            Classification::Unknown => UNKNOWN_LEVEL,
            Classification::Unscored => UNSCORED_LEVEL,
        }
    }
}

/// First interval (in iteration order) with `min <= score <= max` wins.
/// Overlap checks belong to whoever saves the boundary set.
pub fn classify(score: Option<f64>, boundaries: &[PointBoundary]) -> Classification<'_> {
    let Some(score) = score else {
        return Classification::Unscored;
    };
    boundaries
        .iter()
        .find(|b| b.min_marks <= score && score <= b.max_marks)
        .map(|b| Classification::Band {
            pl: &b.pl,
            ab: &b.ab,
        })
        .unwrap_or(Classification::Unknown)
}

/// Boundaries are written in whole marks, so fractional values (means,
/// per-subject averages) are rounded to the nearest mark before lookup.
pub fn classify_mean(value: f64, boundaries: &[PointBoundary]) -> Classification<'_> {
    classify(Some(value.round()), boundaries)
}

/// A mean compared against a previous exam: either a number or the `-`
/// sentinel when there is nothing comparable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeanValue {
    Value(f64),
    Missing,
}

impl MeanValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            MeanValue::Value(v) => Some(v),
            MeanValue::Missing => None,
        }
    }
}

impl From<Option<f64>> for MeanValue {
    fn from(v: Option<f64>) -> Self {
        v.map(MeanValue::Value).unwrap_or(MeanValue::Missing)
    }
}

impl Serialize for MeanValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MeanValue::Value(v) => serializer.serialize_f64(*v),
            MeanValue::Missing => serializer.serialize_str(UNSCORED_LEVEL),
        }
    }
}

pub fn deviation(current: f64, previous: Option<f64>) -> MeanValue {
    match previous {
        Some(prev) if current.is_finite() && prev.is_finite() => {
            MeanValue::Value(round_off_2_decimal(current - prev))
        }
        _ => MeanValue::Missing,
    }
}

/// One student's marks for an exam; `marks` is aligned with the configured
/// subject list and `None` means the subject has not been marked.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentMarks {
    pub student_id: i64,
    pub name: String,
    pub class: String,
    pub marks: Vec<Option<i64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedRow {
    pub student_id: i64,
    pub name: String,
    pub class: String,
    pub marks: Vec<Option<i64>>,
    pub total_marks: i64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub rows: Vec<RankedRow>,
    pub subject_means: Vec<f64>,
    pub total_mean: f64,
}

pub fn total_marks(marks: &[Option<i64>]) -> i64 {
    marks.iter().map(|m| m.unwrap_or(0)).sum()
}

/// Mark-list order: total descending, then name, then student id.
pub fn rank_order(a_total: i64, a: &StudentMarks, b_total: i64, b: &StudentMarks) -> Ordering {
    b_total
        .cmp(&a_total)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.student_id.cmp(&b.student_id))
}

pub fn subject_mean<I>(marks: I) -> f64
where
    I: IntoIterator<Item = Option<i64>>,
{
    let mut sum = 0_i64;
    let mut count = 0_i64;
    for m in marks.into_iter().flatten() {
        sum += m;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    round_off_2_decimal(sum as f64 / count as f64)
}

/// Totals of 0 are left out of the denominator.
pub fn total_mean<I>(totals: I) -> f64
where
    I: IntoIterator<Item = i64>,
{
    let mut sum = 0_i64;
    let mut count = 0_i64;
    for t in totals.into_iter().filter(|t| *t > 0) {
        sum += t;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    round_off_2_decimal(sum as f64 / count as f64)
}

pub fn aggregate(rows: Vec<StudentMarks>, subject_count: usize) -> Aggregate {
    let mut with_totals: Vec<(i64, StudentMarks)> = rows
        .into_iter()
        .map(|r| (total_marks(&r.marks), r))
        .collect();
    with_totals.sort_by(|(ta, a), (tb, b)| rank_order(*ta, a, *tb, b));

    let subject_means = (0..subject_count)
        .map(|i| {
            subject_mean(
                with_totals
                    .iter()
                    .map(|(_, r)| r.marks.get(i).copied().flatten()),
            )
        })
        .collect();
    let total_mean = total_mean(with_totals.iter().map(|(t, _)| *t));

    let rows = with_totals
        .into_iter()
        .enumerate()
        .map(|(i, (total, r))| RankedRow {
            student_id: r.student_id,
            name: r.name,
            class: r.class,
            marks: r.marks,
            total_marks: total,
            position: i as i64 + 1,
        })
        .collect();

    Aggregate {
        rows,
        subject_means,
        total_mean,
    }
}
