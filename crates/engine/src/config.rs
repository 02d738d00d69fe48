//! Screening configuration, with environment overrides

use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DB_PATH: &str = "data/screener.db";
pub const DEFAULT_LIMIT: u64 = 50;
pub const MAX_LIMIT: u64 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningConfig {
    pub db_path: String,
    /// Max symbols evaluated per computed-path request
    pub universe_cap: usize,
    /// Calendar days of bars fetched before `as_of`
    pub lookback_days: u64,
    /// Symbols evaluated concurrently
    pub concurrency: usize,
    /// Overall budget for the computed path; `None` waits for every symbol
    pub deadline: Option<Duration>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            universe_cap: 120,
            lookback_days: 220,
            concurrency: 8,
            deadline: None,
        }
    }
}

impl ScreeningConfig {
    /// Defaults overridden by `SCREENER_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("SCREENER_DB_PATH") {
            config.db_path = path;
        }
        if let Some(n) = parse_var(&lookup, "SCREENER_UNIVERSE_CAP") {
            config.universe_cap = n;
        }
        if let Some(n) = parse_var(&lookup, "SCREENER_LOOKBACK_DAYS") {
            config.lookback_days = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "SCREENER_CONCURRENCY") {
            config.concurrency = n.max(1);
        }
        if let Some(ms) = parse_var(&lookup, "SCREENER_DEADLINE_MS") {
            config.deadline = Some(Duration::from_millis(ms));
        }
        config
    }

    /// Clamp a requested page to `1..=MAX_LIMIT`; the offset saturates at
    /// `i64::MAX`, the largest SQLite accepts
    pub fn page(limit: Option<u64>, offset: u64) -> (u64, u64) {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        (limit, offset.min(i64::MAX as u64))
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}
