//! Persistence layer for the stock screener
//!
//! SQLite storage for the fundamentals snapshot, daily bars and live quotes,
//! plus the store-native filter used by the pushdown screening path.

pub mod filter;
pub mod repository;
pub mod schema;

pub use filter::{Comparison, Predicate, Scalar, SortOrder, StoreFilter, StoreSort};

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Settings applied to every connection, as `(pragma, value)`
const PRAGMAS: &[(&str, &str)] = &[
    // readers keep going while `import` writes
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    // KiB when negative; screening scans the whole snapshot table
    ("cache_size", "-16000"),
];

/// SQLite pool holding the screening tables
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database file at `path`
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.display()), 5).await
    }

    /// Private in-memory database, one connection so every query sees the same data
    pub async fn in_memory() -> DbResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(format!("{url}: {e}")))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.apply_pragmas().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> DbResult<()> {
        for sql in statements(schema::CREATE_TABLES) {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        // ALTER TABLE migrations; a duplicate column means it already ran
        for migration in schema::MIGRATIONS {
            if let Err(e) = sqlx::query(migration).execute(&self.pool).await {
                if !e.to_string().contains("duplicate column name") {
                    return Err(DbError::Migration(format!("{e}: {migration}")));
                }
                debug!(migration, "Migration already applied");
            }
        }
        Ok(())
    }

    async fn apply_pragmas(&self) -> DbResult<()> {
        for (pragma, value) in PRAGMAS {
            sqlx::query(&format!("PRAGMA {pragma}={value}"))
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("PRAGMA {pragma} failed: {e}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned handle for stores that outlive the borrow
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

/// Split a DDL script on `;`, dropping `--` comment lines and empty statements
fn statements(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(|stmt| {
            stmt.lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|sql| !sql.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_creates_schema() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"stock_snapshots"));
        assert!(names.contains(&"daily_bars"));
        assert!(names.contains(&"market_quotes"));
    }

    #[test]
    fn test_statements_skip_comments() {
        let sql = "-- header\nCREATE TABLE a (x INTEGER);\n-- only a comment\n;\nCREATE INDEX i ON a(x);";
        assert_eq!(
            statements(sql),
            vec!["CREATE TABLE a (x INTEGER)", "CREATE INDEX i ON a(x)"]
        );
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }
}
