//! Query builder for production series.
//!
//! # Example
//!
//! ```
//! use tuba_store::{ProductionQuery, SeriesKind, Store};
//!
//! let store = Store::open_in_memory()?;
//!
//! let query = ProductionQuery::new(SeriesKind::Liters).year(2025);
//! let points = store.production_series(&query)?;
//! assert!(points.is_empty());
//! # Ok::<(), tuba_store::Error>(())
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::Error;
use crate::store::format_date;

/// Which production total to chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// Liters produced (canonical series).
    #[default]
    Liters,
    /// Sales amount (legacy series).
    Sales,
}

impl SeriesKind {
    fn column(self) -> &'static str {
        match self {
            SeriesKind::Liters => "liters",
            SeriesKind::Sales => "sales",
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for SeriesKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "liters" | "litres" => Ok(SeriesKind::Liters),
            "sales" => Ok(SeriesKind::Sales),
            other => Err(Error::InvalidValue(format!("unknown series '{other}'"))),
        }
    }
}

/// Fluent query builder for production series.
///
/// Results are ordered by date, oldest first, and only include days with a
/// non-zero total for the selected series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductionQuery {
    /// Series to read.
    pub kind: SeriesKind,
    /// Restrict to one calendar year.
    pub year: Option<i32>,
    /// Restrict to days on or after this date.
    pub since: Option<Date>,
    /// Restrict to days on or before this date.
    pub until: Option<Date>,
}

impl ProductionQuery {
    /// Query every day of a series.
    pub fn new(kind: SeriesKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Filter to one calendar year.
    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Filter to days on or after `date`.
    pub fn since(mut self, date: Date) -> Self {
        self.since = Some(date);
        self
    }

    /// Filter to days on or before `date`.
    pub fn until(mut self, date: Date) -> Self {
        self.until = Some(date);
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<String>) {
        let mut conditions = vec![format!("{} <> 0", self.kind.column())];
        let mut params = Vec::new();

        if let Some(year) = self.year {
            conditions.push("date >= ? AND date <= ?".to_string());
            params.push(format!("{year:04}-01-01"));
            params.push(format!("{year:04}-12-31"));
        }

        if let Some(since) = self.since {
            conditions.push("date >= ?".to_string());
            params.push(format_date(since));
        }

        if let Some(until) = self.until {
            conditions.push("date <= ?".to_string());
            params.push(format_date(until));
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        format!(
            "SELECT date, {} FROM production {} ORDER BY date ASC",
            self.kind.column(),
            where_clause
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_query_defaults() {
        let query = ProductionQuery::new(SeriesKind::Sales);
        assert_eq!(query.kind, SeriesKind::Sales);
        assert!(query.year.is_none());
        let sql = query.build_sql();
        assert!(sql.contains("SELECT date, sales FROM production"));
        assert!(sql.contains("WHERE sales <> 0"));
    }

    #[test]
    fn test_query_filters() {
        let query = ProductionQuery::new(SeriesKind::Liters)
            .year(2025)
            .since(date!(2025 - 05 - 01))
            .until(date!(2025 - 05 - 31));
        let (where_clause, params) = query.build_where();
        assert!(where_clause.contains("date >= ? AND date <= ?"));
        assert_eq!(
            params,
            vec!["2025-01-01", "2025-12-31", "2025-05-01", "2025-05-31"]
        );
    }

    #[test]
    fn test_series_kind_parse() {
        assert_eq!("Liters".parse::<SeriesKind>().unwrap(), SeriesKind::Liters);
        assert_eq!("sales".parse::<SeriesKind>().unwrap(), SeriesKind::Sales);
        assert!("revenue".parse::<SeriesKind>().is_err());
        assert_eq!(SeriesKind::Sales.to_string(), "sales");
    }
}
