//! Database schema definitions

/// SQL to create all tables
/// NOTE: Market values are stored in hundred-million units (亿元), prices in 元
pub const CREATE_TABLES: &str = r#"
-- Latest fundamentals/quote snapshot per symbol (the screening view)
CREATE TABLE IF NOT EXISTS stock_snapshots (
    symbol TEXT PRIMARY KEY,
    name TEXT,
    industry TEXT,
    area TEXT,
    market TEXT,
    total_mv REAL,
    circ_mv REAL,
    pe REAL,
    pb REAL,
    pe_ttm REAL,
    pb_mrq REAL,
    roe REAL,
    turnover_rate REAL,
    volume_ratio REAL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    pct_chg REAL,
    amount REAL,
    volume REAL,
    trade_date TEXT,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Daily OHLCV bars (trade_date as YYYY-MM-DD)
CREATE TABLE IF NOT EXISTS daily_bars (
    symbol TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL DEFAULT 0,
    amount REAL,
    PRIMARY KEY (symbol, trade_date)
);

-- Live quotes used to refresh matched rows
CREATE TABLE IF NOT EXISTS market_quotes (
    symbol TEXT PRIMARY KEY,
    close REAL,
    pct_chg REAL,
    amount REAL,
    volume REAL,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_snapshots_market ON stock_snapshots(market);
CREATE INDEX IF NOT EXISTS idx_snapshots_industry ON stock_snapshots(industry);
CREATE INDEX IF NOT EXISTS idx_snapshots_total_mv ON stock_snapshots(total_mv DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_pe ON stock_snapshots(pe);
CREATE INDEX IF NOT EXISTS idx_bars_symbol_date ON daily_bars(symbol, trade_date)
"#;

/// Columns added after the initial release
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE stock_snapshots ADD COLUMN board TEXT",
    "ALTER TABLE stock_snapshots ADD COLUMN exchange TEXT",
];

/// Columns of `stock_snapshots` that may appear in filters and sorts
pub const SNAPSHOT_COLUMNS: &[&str] = &[
    "symbol",
    "name",
    "industry",
    "area",
    "market",
    "board",
    "exchange",
    "total_mv",
    "circ_mv",
    "pe",
    "pb",
    "pe_ttm",
    "pb_mrq",
    "roe",
    "turnover_rate",
    "volume_ratio",
    "open",
    "high",
    "low",
    "close",
    "pct_chg",
    "amount",
    "volume",
    "trade_date",
];

pub fn is_snapshot_column(name: &str) -> bool {
    SNAPSHOT_COLUMNS.contains(&name)
}
