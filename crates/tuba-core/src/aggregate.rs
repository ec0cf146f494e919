//! Time-bucket aggregation of production series for charts.
//!
//! Stored production totals are labelled per day (`"May-20"`). The chart
//! view can show them per day, or rolled up per month. Yearly resolution
//! currently falls back to monthly buckets, since the dataset covers a single
//! season and one annual bar carried no information.
//!
//! # Example
//!
//! ```
//! use tuba_core::aggregate::{aggregate, BucketUnit};
//! use tuba_types::ChartPoint;
//!
//! let series = vec![
//!     ChartPoint::new("May-01", 10.0),
//!     ChartPoint::new("May-02", 5.0),
//!     ChartPoint::new("Jun-01", 3.0),
//! ];
//! let monthly = aggregate(&series, BucketUnit::Month);
//! assert_eq!(monthly, vec![ChartPoint::new("May", 15.0), ChartPoint::new("Jun", 3.0)]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tuba_types::{ChartPoint, MONTH_ABBREVIATIONS};

use crate::error::Error;

/// Aggregation unit for chart buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketUnit {
    /// One bucket per stored date.
    #[default]
    Day,
    /// One bucket per calendar month.
    Month,
    /// Currently one bucket per calendar month as well.
    Year,
}

impl fmt::Display for BucketUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketUnit::Day => write!(f, "day"),
            BucketUnit::Month => write!(f, "month"),
            BucketUnit::Year => write!(f, "year"),
        }
    }
}

impl FromStr for BucketUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(BucketUnit::Day),
            "month" | "monthly" => Ok(BucketUnit::Month),
            "year" | "yearly" => Ok(BucketUnit::Year),
            other => Err(Error::InvalidConfig(format!(
                "unknown bucket unit '{other}' (expected day, month or year)"
            ))),
        }
    }
}

/// Group a dated series into chart buckets.
///
/// - [`BucketUnit::Day`] returns the series unchanged; the caller supplies it
///   sorted and deduplicated.
/// - [`BucketUnit::Month`] and [`BucketUnit::Year`] sum values per month token
///   and emit one point per month present, January first. Non-finite values
///   count as zero. Labels without a month token are skipped.
#[must_use]
pub fn aggregate(series: &[ChartPoint], unit: BucketUnit) -> Vec<ChartPoint> {
    match unit {
        BucketUnit::Day => series.to_vec(),
        BucketUnit::Month | BucketUnit::Year => by_month(series),
    }
}

fn by_month(series: &[ChartPoint]) -> Vec<ChartPoint> {
    let mut totals: [Option<f64>; 12] = [None; 12];

    for point in series {
        let Some(month) = month_index(&point.label) else {
            debug!("Skipping chart point without a month token: {:?}", point.label);
            continue;
        };
        let slot = totals[month].get_or_insert(0.0);
        *slot += finite_or_zero(point.value);
    }

    totals
        .iter()
        .enumerate()
        .filter_map(|(i, total)| total.map(|v| ChartPoint::new(MONTH_ABBREVIATIONS[i], v)))
        .collect()
}

/// Sum the whole series into a single point.
#[deprecated(
    since = "0.1.0",
    note = "yearly charts use monthly buckets; a single annual total is pending product review"
)]
#[must_use]
pub fn annual_total(series: &[ChartPoint], label: &str) -> Vec<ChartPoint> {
    if series.is_empty() {
        return Vec::new();
    }
    let total = series.iter().map(|p| finite_or_zero(p.value)).sum();
    vec![ChartPoint::new(label, total)]
}

/// One label of two merged series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPoint {
    pub label: String,
    pub primary: Option<f64>,
    pub secondary: Option<f64>,
}

/// Merge two parallel series by label.
///
/// Points are matched strictly on their label, never on position, so the two
/// inputs may have different lengths or gaps. Output labels are unique;
/// labels that carry a month token are ordered chronologically, followed by
/// any others in order of first appearance.
#[must_use]
pub fn merge_series(primary: &[ChartPoint], secondary: &[ChartPoint]) -> Vec<MergedPoint> {
    let mut merged: Vec<MergedPoint> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (point, is_primary) in primary
        .iter()
        .map(|p| (p, true))
        .chain(secondary.iter().map(|p| (p, false)))
    {
        let i = *index.entry(point.label.clone()).or_insert_with(|| {
            merged.push(MergedPoint {
                label: point.label.clone(),
                primary: None,
                secondary: None,
            });
            merged.len() - 1
        });

        let slot = if is_primary {
            &mut merged[i].primary
        } else {
            &mut merged[i].secondary
        };
        *slot = Some(slot.unwrap_or(0.0) + finite_or_zero(point.value));
    }

    merged.sort_by_key(|p| {
        let key = label_key(&p.label);
        (key.is_none(), key)
    });
    merged
}

/// Month index (0-11) of the first month token found in a label.
pub(crate) fn month_index(label: &str) -> Option<usize> {
    label
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|token| token.len() >= 3)
        .find_map(|token| {
            let prefix = &token[..3];
            MONTH_ABBREVIATIONS
                .iter()
                .position(|m| m.eq_ignore_ascii_case(prefix))
        })
}

/// Chronological sort key: month index and day of month (0 if absent).
fn label_key(label: &str) -> Option<(usize, u8)> {
    let month = month_index(label)?;
    let day = label
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|token| token.parse::<u8>().ok())
        .find(|d| (1..=31).contains(d))
        .unwrap_or(0);
    Some((month, day))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}
