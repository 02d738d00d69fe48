//! Daily bar repository - OHLCV history for the computed screening path

use crate::DbResult;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One daily bar; `trade_date` is `YYYY-MM-DD`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BarRecord {
    pub symbol: String,
    pub trade_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub amount: Option<f64>,
}

pub struct BarRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BarRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a batch of bars in one transaction
    pub async fn upsert_many(&self, bars: &[BarRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO daily_bars (
                    symbol, trade_date, open, high, low, close, volume, amount
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&bar.symbol)
            .bind(&bar.trade_date)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.amount)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Bars for `symbol` with `start <= trade_date <= end`, oldest first
    pub async fn get_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> DbResult<Vec<BarRecord>> {
        let bars = sqlx::query_as::<_, BarRecord>(
            r#"
            SELECT symbol, trade_date, open, high, low, close, volume, amount
            FROM daily_bars
            WHERE symbol = ? AND trade_date >= ? AND trade_date <= ?
            ORDER BY trade_date ASC
            "#,
        )
        .bind(symbol)
        .bind(start.format("%Y-%m-%d").to_string())
        .bind(end.format("%Y-%m-%d").to_string())
        .fetch_all(self.pool)
        .await?;
        Ok(bars)
    }
}
