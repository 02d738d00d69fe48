//! Snapshot repository - the flat per-symbol view the pushdown path queries

use crate::filter::{order_by_sql, Scalar, StoreFilter, StoreSort};
use crate::schema::is_snapshot_column;
use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

const SNAPSHOT_SELECT: &str = r#"
    SELECT symbol, name, industry, area, market, board, exchange,
           total_mv, circ_mv, pe, pb, pe_ttm, pb_mrq, roe,
           turnover_rate, volume_ratio,
           open, high, low, close, pct_chg, amount, volume,
           trade_date
    FROM stock_snapshots
"#;

/// One row of `stock_snapshots`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SnapshotRecord {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub board: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub total_mv: Option<f64>,
    #[serde(default)]
    pub circ_mv: Option<f64>,
    #[serde(default)]
    pub pe: Option<f64>,
    #[serde(default)]
    pub pb: Option<f64>,
    #[serde(default)]
    pub pe_ttm: Option<f64>,
    #[serde(default)]
    pub pb_mrq: Option<f64>,
    #[serde(default)]
    pub roe: Option<f64>,
    #[serde(default)]
    pub turnover_rate: Option<f64>,
    #[serde(default)]
    pub volume_ratio: Option<f64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub pct_chg: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub trade_date: Option<String>,
}

/// min/max/avg/count over the non-null values of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ColumnStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IndustryCount {
    pub industry: String,
    pub count: i64,
}

/// Repository for the screening snapshot table
pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the snapshot for one symbol
    pub async fn upsert(&self, record: &SnapshotRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_snapshots (
                symbol, name, industry, area, market, board, exchange,
                total_mv, circ_mv, pe, pb, pe_ttm, pb_mrq, roe,
                turnover_rate, volume_ratio,
                open, high, low, close, pct_chg, amount, volume,
                trade_date, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(symbol) DO UPDATE SET
                name = excluded.name,
                industry = excluded.industry,
                area = excluded.area,
                market = excluded.market,
                board = excluded.board,
                exchange = excluded.exchange,
                total_mv = excluded.total_mv,
                circ_mv = excluded.circ_mv,
                pe = excluded.pe,
                pb = excluded.pb,
                pe_ttm = excluded.pe_ttm,
                pb_mrq = excluded.pb_mrq,
                roe = excluded.roe,
                turnover_rate = excluded.turnover_rate,
                volume_ratio = excluded.volume_ratio,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                pct_chg = excluded.pct_chg,
                amount = excluded.amount,
                volume = excluded.volume,
                trade_date = excluded.trade_date,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.name)
        .bind(&record.industry)
        .bind(&record.area)
        .bind(&record.market)
        .bind(&record.board)
        .bind(&record.exchange)
        .bind(record.total_mv)
        .bind(record.circ_mv)
        .bind(record.pe)
        .bind(record.pb)
        .bind(record.pe_ttm)
        .bind(record.pb_mrq)
        .bind(record.roe)
        .bind(record.turnover_rate)
        .bind(record.volume_ratio)
        .bind(record.open)
        .bind(record.high)
        .bind(record.low)
        .bind(record.close)
        .bind(record.pct_chg)
        .bind(record.amount)
        .bind(record.volume)
        .bind(&record.trade_date)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, symbol: &str) -> DbResult<Option<SnapshotRecord>> {
        let sql = format!("{SNAPSHOT_SELECT} WHERE symbol = ?");
        let record = sqlx::query_as::<_, SnapshotRecord>(&sql)
            .bind(symbol)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Filtered, sorted page of snapshots plus the total match count
    pub async fn screen(
        &self,
        filter: &StoreFilter,
        sorts: &[StoreSort],
        limit: i64,
        offset: i64,
    ) -> DbResult<(Vec<SnapshotRecord>, i64)> {
        // SQLite reads a negative LIMIT as unbounded and a negative OFFSET as 0
        if limit < 0 || offset < 0 {
            return Err(DbError::Query(format!(
                "negative page: limit {limit}, offset {offset}"
            )));
        }
        let (where_sql, binds) = filter.to_sql()?;
        let order_sql = order_by_sql(sorts)?;

        // Count total
        let count_sql = format!("SELECT COUNT(*) FROM stock_snapshots WHERE {where_sql}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for b in &binds {
            count_query = match b {
                Scalar::Number(n) => count_query.bind(*n),
                Scalar::Text(t) => count_query.bind(t.as_str()),
            };
        }
        let (total,) = count_query.fetch_one(self.pool).await?;

        let data_sql = format!(
            r#"
            {SNAPSHOT_SELECT}
            WHERE {where_sql}
            ORDER BY {order_sql}
            LIMIT ? OFFSET ?
            "#
        );
        let mut data_query = sqlx::query_as::<_, SnapshotRecord>(&data_sql);
        for b in &binds {
            data_query = match b {
                Scalar::Number(n) => data_query.bind(*n),
                Scalar::Text(t) => data_query.bind(t.as_str()),
            };
        }
        data_query = data_query.bind(limit).bind(offset);

        let records = data_query.fetch_all(self.pool).await?;
        Ok((records, total))
    }

    /// Symbols in a market, ordered by symbol, capped at `limit`
    pub async fn symbols(&self, market: Option<&str>, limit: i64) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = match market {
            Some(m) => {
                sqlx::query_as(
                    "SELECT symbol FROM stock_snapshots WHERE market = ? ORDER BY symbol LIMIT ?",
                )
                .bind(m)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT symbol FROM stock_snapshots ORDER BY symbol LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn column_statistics(&self, column: &str) -> DbResult<ColumnStatistics> {
        if !is_snapshot_column(column) {
            return Err(DbError::UnknownColumn(column.to_string()));
        }
        let sql = format!(
            r#"
            SELECT CAST(MIN({column}) AS REAL) AS min,
                   CAST(MAX({column}) AS REAL) AS max,
                   CAST(AVG({column}) AS REAL) AS avg,
                   COUNT({column}) AS count
            FROM stock_snapshots
            WHERE {column} IS NOT NULL
            "#
        );
        let stats = sqlx::query_as::<_, ColumnStatistics>(&sql)
            .fetch_one(self.pool)
            .await?;
        Ok(stats)
    }

    /// Distinct non-empty values of a text column, alphabetically
    pub async fn distinct_values(&self, column: &str, limit: i64) -> DbResult<Vec<String>> {
        if !is_snapshot_column(column) {
            return Err(DbError::UnknownColumn(column.to_string()));
        }
        let sql = format!(
            "SELECT DISTINCT {column} FROM stock_snapshots \
             WHERE {column} IS NOT NULL AND {column} != '' ORDER BY {column} LIMIT ?"
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Industries with symbol counts, largest first
    pub async fn industries(&self) -> DbResult<Vec<IndustryCount>> {
        let rows = sqlx::query_as::<_, IndustryCount>(
            r#"
            SELECT industry, COUNT(*) AS count
            FROM stock_snapshots
            WHERE industry IS NOT NULL AND industry != ''
            GROUP BY industry
            ORDER BY count DESC, industry ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stock_snapshots")
            .fetch_one(self.pool)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Comparison, Predicate};
    use crate::Database;

    fn record(symbol: &str, industry: &str, total_mv: Option<f64>, pe: Option<f64>) -> SnapshotRecord {
        SnapshotRecord {
            symbol: symbol.to_string(),
            name: Some(format!("Stock {symbol}")),
            industry: Some(industry.to_string()),
            market: Some("CN".to_string()),
            total_mv,
            pe,
            ..Default::default()
        }
    }

    async fn seeded() -> Database {
        let db = Database::in_memory().await.unwrap();
        let repo = SnapshotRepository::new(db.pool());
        repo.upsert(&record("000001", "银行", Some(2500.0), Some(5.2))).await.unwrap();
        repo.upsert(&record("000002", "房地产", Some(900.0), Some(12.0))).await.unwrap();
        repo.upsert(&record("600000", "银行", Some(15.0), None)).await.unwrap();
        repo.upsert(&record("600519", "白酒", None, Some(30.5))).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_screen_range_and_total() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());
        let filter = StoreFilter {
            predicates: vec![Predicate::Range {
                column: "pe".into(),
                lo: 5.0,
                hi: 20.0,
            }],
        };
        let (rows, total) = repo
            .screen(&filter, &[StoreSort::desc("total_mv")], 1, 0)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "000001");
    }

    #[tokio::test]
    async fn test_screen_rejects_negative_page() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());
        let err = repo.screen(&StoreFilter::new(), &[], 10, -1).await.unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
        assert!(repo.screen(&StoreFilter::new(), &[], -1, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_screen_sorts_nulls_last() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());
        let (rows, total) = repo
            .screen(&StoreFilter::new(), &[StoreSort::asc("total_mv")], 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 4);
        let symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["600000", "000002", "000001", "600519"]);
    }

    #[tokio::test]
    async fn test_screen_text_predicates() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());
        let filter = StoreFilter {
            predicates: vec![
                Predicate::Compare {
                    column: "industry".into(),
                    cmp: Comparison::Eq,
                    value: Scalar::Text("银行".into()),
                },
                Predicate::Contains {
                    column: "name".into(),
                    needle: "STOCK 6".into(),
                },
            ],
        };
        let (rows, total) = repo.screen(&filter, &[], 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].symbol, "600000");
    }

    #[tokio::test]
    async fn test_statistics_and_distinct_values() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());

        let stats = repo.column_statistics("total_mv").await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Some(15.0));
        assert_eq!(stats.max, Some(2500.0));

        let industries = repo.distinct_values("industry", 100).await.unwrap();
        assert_eq!(industries.len(), 3);

        let counts = repo.industries().await.unwrap();
        assert_eq!(counts[0].industry, "银行");
        assert_eq!(counts[0].count, 2);

        assert!(repo.column_statistics("rsi14").await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_symbols() {
        let db = seeded().await;
        let repo = SnapshotRepository::new(db.pool());
        repo.upsert(&record("000001", "银行", Some(2600.0), Some(5.0))).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 4);
        assert_eq!(repo.get("000001").await.unwrap().unwrap().total_mv, Some(2600.0));

        let symbols = repo.symbols(Some("CN"), 2).await.unwrap();
        assert_eq!(symbols, vec!["000001", "000002"]);
        assert!(repo.symbols(Some("US"), 10).await.unwrap().is_empty());
    }
}
