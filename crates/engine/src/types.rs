//! Types shared by the screening engine

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// OHLCV column names as they appear in a `Series`
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const VOLUME: &str = "volume";
pub const AMOUNT: &str = "amount";
pub const PCT_CHG: &str = "pct_chg";

/// A single daily candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Column-oriented time series, ascending by date.
///
/// Missing values are stored as `NaN`. A series produced from bars always has
/// the OHLCV columns; other producers may supply only a subset, which the
/// indicator engine checks before computing anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Series {
    pub fn new(dates: Vec<NaiveDate>) -> Self {
        Self {
            dates,
            columns: BTreeMap::new(),
        }
    }

    /// Build from bars, sorting them by date first
    pub fn from_bars(bars: &[Bar]) -> Self {
        let mut sorted: Vec<&Bar> = bars.iter().collect();
        sorted.sort_by_key(|b| b.date);

        let mut series = Self::new(sorted.iter().map(|b| b.date).collect());
        series.insert(OPEN, sorted.iter().map(|b| b.open).collect());
        series.insert(HIGH, sorted.iter().map(|b| b.high).collect());
        series.insert(LOW, sorted.iter().map(|b| b.low).collect());
        series.insert(CLOSE, sorted.iter().map(|b| b.close).collect());
        series.insert(VOLUME, sorted.iter().map(|b| b.volume).collect());
        series.insert(
            AMOUNT,
            sorted.iter().map(|b| b.amount.unwrap_or(f64::NAN)).collect(),
        );
        series
    }

    /// Add a column, builder style. Panics if the length does not match.
    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    /// Insert or replace a column
    pub fn insert(&mut self, name: &str, values: Vec<f64>) {
        assert_eq!(
            values.len(),
            self.dates.len(),
            "column {name} has {} values for {} rows",
            values.len(),
            self.dates.len()
        );
        self.columns.insert(name.to_string(), values);
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// Value `back` rows before the last one (0 = last row)
    pub fn value_from_end(&self, name: &str, back: usize) -> Option<f64> {
        let column = self.columns.get(name)?;
        let idx = column.len().checked_sub(back + 1)?;
        column.get(idx).copied()
    }
}

/// A value read out of a series row, a snapshot or a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view; text that parses as a number counts
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, FieldValue::Number(n) if n.is_nan())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Flat key→value fundamentals for one symbol (no time dimension)
pub type Snapshot = BTreeMap<String, FieldValue>;

/// One matched symbol in a screening result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenedRow {
    pub symbol: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl ScreenedRow {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field; NaN numbers are dropped so absent stays absent
    pub fn set(&mut self, field: &str, value: FieldValue) {
        if value.is_nan() {
            return;
        }
        self.fields.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(format!("sort direction must be asc or desc, got '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for SortDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "asc"),
            SortDirection::Desc => write!(f, "desc"),
        }
    }
}

/// One `order_by` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Desc,
        }
    }
}
