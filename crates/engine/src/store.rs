//! SQLite-backed implementations of the screening collaborators

use crate::fields::FieldStatistics;
use crate::providers::{
    BarProvider, FundamentalsSource, IndustrySummary, Quote, QuoteLookup, StoreExecutor,
};
use crate::types::{Bar, FieldValue, ScreenedRow, Series, Snapshot};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use persistence::repository::{
    BarRecord, BarRepository, QuoteRepository, SnapshotRecord, SnapshotRepository,
};
use persistence::{Database, SqlitePool, StoreFilter, StoreSort};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Market store over the persistence crate's repositories
#[derive(Clone)]
pub struct SqliteMarketStore {
    pool: SqlitePool,
}

impl SqliteMarketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool_clone())
    }
}

/// Flatten a snapshot row into field values, dropping NULL columns
pub fn snapshot_from_record(record: SnapshotRecord) -> Snapshot {
    let mut out = Snapshot::new();
    let mut text = |name: &str, value: Option<String>| {
        if let Some(v) = value {
            out.insert(name.to_string(), FieldValue::Text(v));
        }
    };
    text("symbol", Some(record.symbol));
    text("name", record.name);
    text("industry", record.industry);
    text("area", record.area);
    text("market", record.market);
    text("board", record.board);
    text("exchange", record.exchange);
    text("trade_date", record.trade_date);

    let numbers = [
        ("total_mv", record.total_mv),
        ("circ_mv", record.circ_mv),
        ("pe", record.pe),
        ("pb", record.pb),
        ("pe_ttm", record.pe_ttm),
        ("pb_mrq", record.pb_mrq),
        ("roe", record.roe),
        ("turnover_rate", record.turnover_rate),
        ("volume_ratio", record.volume_ratio),
        ("open", record.open),
        ("high", record.high),
        ("low", record.low),
        ("close", record.close),
        ("pct_chg", record.pct_chg),
        ("amount", record.amount),
        ("volume", record.volume),
    ];
    for (name, value) in numbers {
        if let Some(v) = value.filter(|v| !v.is_nan()) {
            out.insert(name.to_string(), FieldValue::Number(v));
        }
    }
    out
}

impl From<SnapshotRecord> for ScreenedRow {
    fn from(record: SnapshotRecord) -> Self {
        let mut row = ScreenedRow::new(record.symbol.clone());
        let mut fields = snapshot_from_record(record);
        fields.remove("symbol");
        row.fields = fields;
        row
    }
}

fn bar_from_record(record: &BarRecord) -> Option<Bar> {
    let date = NaiveDate::parse_from_str(&record.trade_date, "%Y-%m-%d").ok()?;
    Some(Bar {
        date,
        open: record.open,
        high: record.high,
        low: record.low,
        close: record.close,
        volume: record.volume,
        amount: record.amount,
    })
}

#[async_trait]
impl BarProvider for SqliteMarketStore {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Option<Series> {
        let records = match BarRepository::new(&self.pool)
            .get_range(symbol, start, end)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(symbol, error = %e, "Failed to load bars");
                return None;
            }
        };

        let mut bars = Vec::with_capacity(records.len());
        for record in &records {
            match bar_from_record(record) {
                Some(bar) => bars.push(bar),
                None => warn!(symbol, date = %record.trade_date, "Skipping bar with malformed date"),
            }
        }

        if bars.is_empty() {
            debug!(symbol, %start, %end, "No bars in range");
            return None;
        }
        Some(Series::from_bars(&bars))
    }
}

#[async_trait]
impl StoreExecutor for SqliteMarketStore {
    async fn query(
        &self,
        filter: &StoreFilter,
        sort: &[StoreSort],
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<ScreenedRow>, u64)> {
        let clamp = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        let (records, total) = SnapshotRepository::new(&self.pool)
            .screen(filter, sort, clamp(limit), clamp(offset))
            .await?;
        let rows = records.into_iter().map(ScreenedRow::from).collect();
        Ok((rows, total.max(0) as u64))
    }
}

#[async_trait]
impl QuoteLookup for SqliteMarketStore {
    async fn batch_get(&self, symbols: &[String]) -> Result<HashMap<String, Quote>> {
        let records = QuoteRepository::new(&self.pool).batch_get(symbols).await?;
        Ok(records
            .into_iter()
            .map(|q| {
                let quote = Quote {
                    close: q.close,
                    pct_chg: q.pct_chg,
                    amount: q.amount,
                    volume: q.volume,
                };
                (q.symbol, quote)
            })
            .collect())
    }
}

#[async_trait]
impl FundamentalsSource for SqliteMarketStore {
    async fn universe(&self, market: Option<&str>, cap: usize) -> Result<Vec<String>> {
        let symbols = SnapshotRepository::new(&self.pool)
            .symbols(market, cap as i64)
            .await?;
        Ok(symbols)
    }

    async fn snapshot(&self, symbol: &str) -> Result<Option<Snapshot>> {
        let record = SnapshotRepository::new(&self.pool).get(symbol).await?;
        Ok(record.map(snapshot_from_record))
    }

    async fn field_statistics(&self, field: &str) -> Result<FieldStatistics> {
        let stats = SnapshotRepository::new(&self.pool)
            .column_statistics(field)
            .await?;
        Ok(FieldStatistics {
            min: stats.min,
            max: stats.max,
            avg: stats.avg,
            count: stats.count,
        })
    }

    async fn distinct_values(&self, field: &str, limit: usize) -> Result<Vec<String>> {
        let values = SnapshotRepository::new(&self.pool)
            .distinct_values(field, limit as i64)
            .await?;
        Ok(values)
    }

    async fn industries(&self) -> Result<Vec<IndustrySummary>> {
        let rows = SnapshotRepository::new(&self.pool).industries().await?;
        Ok(rows
            .into_iter()
            .map(|r| IndustrySummary {
                industry: r.industry,
                count: r.count,
            })
            .collect())
    }
}
