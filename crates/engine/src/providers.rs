//! Collaborator interfaces the screening service runs against
//!
//! The service never talks to SQLite or a market-data feed directly. It is
//! handed implementations of these traits: `store::SqliteMarketStore` in the
//! binary, hand-written fakes in tests.

use crate::fields::FieldStatistics;
use crate::types::{FieldValue, ScreenedRow, Series, Snapshot};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use persistence::{StoreFilter, StoreSort};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Data types
// ============================================================================

/// Latest price fields for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub close: Option<f64>,
    pub pct_chg: Option<f64>,
    pub amount: Option<f64>,
    pub volume: Option<f64>,
}

impl Quote {
    /// Overwrite the row's price fields with the ones this quote has
    pub fn apply_to(&self, row: &mut ScreenedRow) {
        let fields = [
            ("close", self.close),
            ("pct_chg", self.pct_chg),
            ("amount", self.amount),
            ("volume", self.volume),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                row.set(name, FieldValue::Number(v));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndustrySummary {
    pub industry: String,
    pub count: i64,
}

// ============================================================================
// Traits
// ============================================================================

/// Daily OHLCV history. Failures come back as `None`, never as an error the
/// evaluator has to handle.
#[async_trait]
pub trait BarProvider: Send + Sync {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Option<Series>;
}

/// Executes a pushdown filter against the store
#[async_trait]
pub trait StoreExecutor: Send + Sync {
    /// One page of matching rows plus the total match count
    async fn query(
        &self,
        filter: &StoreFilter,
        sort: &[StoreSort],
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<ScreenedRow>, u64)>;
}

/// Live quotes keyed by symbol; symbols without a quote are absent
#[async_trait]
pub trait QuoteLookup: Send + Sync {
    async fn batch_get(&self, symbols: &[String]) -> Result<HashMap<String, Quote>>;
}

/// Fundamentals snapshot and catalog-level lookups
#[async_trait]
pub trait FundamentalsSource: Send + Sync {
    /// Candidate symbols for the computed path, at most `cap`
    async fn universe(&self, market: Option<&str>, cap: usize) -> Result<Vec<String>>;

    async fn snapshot(&self, symbol: &str) -> Result<Option<Snapshot>>;

    async fn field_statistics(&self, field: &str) -> Result<FieldStatistics>;

    async fn distinct_values(&self, field: &str, limit: usize) -> Result<Vec<String>>;

    async fn industries(&self) -> Result<Vec<IndustrySummary>>;
}
