//! Live quote repository - latest price fields used to refresh screening rows

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct QuoteRecord {
    pub symbol: String,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub pct_chg: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

pub struct QuoteRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> QuoteRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, quote: &QuoteRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO market_quotes (symbol, close, pct_chg, amount, volume, updated_at)
            VALUES (?, ?, ?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(symbol) DO UPDATE SET
                close = excluded.close,
                pct_chg = excluded.pct_chg,
                amount = excluded.amount,
                volume = excluded.volume,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&quote.symbol)
        .bind(quote.close)
        .bind(quote.pct_chg)
        .bind(quote.amount)
        .bind(quote.volume)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Quotes for the given symbols; symbols without a quote are simply absent
    pub async fn batch_get(&self, symbols: &[String]) -> DbResult<Vec<QuoteRecord>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; symbols.len()].join(", ");
        let sql = format!(
            "SELECT symbol, close, pct_chg, amount, volume FROM market_quotes WHERE symbol IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, QuoteRecord>(&sql);
        for s in symbols {
            query = query.bind(s);
        }
        let quotes = query.fetch_all(self.pool).await?;
        Ok(quotes)
    }
}
