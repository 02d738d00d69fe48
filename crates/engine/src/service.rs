//! Screening service: intake, routing, execution and assembly
//!
//! A request is normalised and validated before any I/O. The planner then
//! picks exactly one path:
//! - **Pushdown**: the flat condition list becomes one store query, sorted
//!   and paginated by the store.
//! - **Computed**: each symbol of a capped universe is evaluated on its own
//!   (bars → indicators → evaluator), fanned out with a concurrency bound.
//!   A symbol that fails to load is skipped, never fatal.
//!
//! Both paths finish by refreshing the returned page from live quotes.

use crate::assembler::{assemble, enrich_with_quotes};
use crate::condition::{deserialize_conditions, Condition};
use crate::config::ScreeningConfig;
use crate::evaluator::{evaluate, EvalContext};
use crate::fields::{
    DataType, FieldCategory, FieldDescriptor, FieldRegistry, ValidationErrors, ValidationReport,
};
use crate::indicators::{compute, pct_change};
use crate::planner::{ConditionAnalysis, QueryPlanner, RoutingDecision};
use crate::providers::{BarProvider, FundamentalsSource, IndustrySummary, QuoteLookup, StoreExecutor};
use crate::store::SqliteMarketStore;
use crate::store_query::{StoreQueryBuilder, StoreQueryError};
use crate::types::{FieldValue, ScreenedRow, Snapshot, SortKey, CLOSE, PCT_CHG};
use chrono::{Days, Local, NaiveDate};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cap on `available_values` listed per text field
const MAX_AVAILABLE_VALUES: usize = 100;

#[derive(Debug, Error)]
pub enum ScreeningError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    StoreQuery(#[from] StoreQueryError),

    #[error("store error: {0}")]
    Store(anyhow::Error),
}

impl ScreeningError {
    /// True when the request itself is at fault
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ScreeningError::Store(_))
    }
}

// ============================================================================
// Request / response
// ============================================================================

fn default_market() -> String {
    "CN".to_string()
}

fn default_true() -> bool {
    true
}

fn match_all() -> Condition {
    Condition::and(vec![])
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreeningRequest {
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default, alias = "date")]
    pub as_of: Option<NaiveDate>,
    #[serde(default = "match_all", deserialize_with = "deserialize_conditions")]
    pub conditions: Condition,
    #[serde(default)]
    pub order_by: Vec<SortKey>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    /// Use the store when every field allows it
    #[serde(default = "default_true", alias = "use_database_optimization")]
    pub prefer_pushdown: bool,
}

impl ScreeningRequest {
    pub fn new(conditions: Condition) -> Self {
        Self {
            market: default_market(),
            as_of: None,
            conditions,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            prefer_pushdown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningResponse {
    /// All matches, not just this page
    pub total: u64,
    pub items: Vec<ScreenedRow>,
    pub routing_used: RoutingDecision,
    pub took_ms: u64,
    /// The deadline expired before every symbol was evaluated
    pub partial: bool,
    pub evaluated: usize,
    pub skipped: usize,
    pub limit: u64,
    pub offset: u64,
}

/// A registry entry with live statistics, for building client forms
#[derive(Debug, Clone, Serialize)]
pub struct FieldInfo {
    #[serde(flatten)]
    pub descriptor: FieldDescriptor,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_values: Vec<String>,
}

enum SymbolOutcome {
    Matched(Box<ScreenedRow>),
    Rejected,
    Skipped,
}

struct ComputedMatches {
    rows: Vec<ScreenedRow>,
    evaluated: usize,
    skipped: usize,
    partial: bool,
}

// ============================================================================
// Service
// ============================================================================

pub struct ScreeningService {
    registry: Arc<FieldRegistry>,
    planner: QueryPlanner,
    builder: StoreQueryBuilder,
    config: ScreeningConfig,
    bars: Arc<dyn BarProvider>,
    store: Arc<dyn StoreExecutor>,
    quotes: Arc<dyn QuoteLookup>,
    fundamentals: Arc<dyn FundamentalsSource>,
}

impl ScreeningService {
    pub fn new(
        registry: Arc<FieldRegistry>,
        config: ScreeningConfig,
        bars: Arc<dyn BarProvider>,
        store: Arc<dyn StoreExecutor>,
        quotes: Arc<dyn QuoteLookup>,
        fundamentals: Arc<dyn FundamentalsSource>,
    ) -> Self {
        Self {
            planner: QueryPlanner::new(registry.clone()),
            builder: StoreQueryBuilder::new(registry.clone()),
            registry,
            config,
            bars,
            store,
            quotes,
            fundamentals,
        }
    }

    /// Built-in registry with every collaborator served by one SQLite store
    pub fn with_sqlite(store: SqliteMarketStore, config: ScreeningConfig) -> Self {
        let store = Arc::new(store);
        Self::new(
            Arc::new(FieldRegistry::builtin()),
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            store,
        )
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ScreeningConfig {
        &self.config
    }

    pub async fn run(&self, request: &ScreeningRequest) -> Result<ScreeningResponse, ScreeningError> {
        let started = Instant::now();

        let conditions = self.registry.normalize(&request.conditions);
        let order_by = self.registry.normalize_sort(&request.order_by);
        self.check(&conditions, &order_by)?;

        let routing = self
            .planner
            .plan_with_hint(&conditions, &order_by, request.prefer_pushdown);
        let (limit, offset) = ScreeningConfig::page(request.limit, request.offset);

        let (mut items, total, evaluated, skipped, partial) = match routing {
            RoutingDecision::Pushdown => {
                let filter = self.builder.build_tree(&conditions)?;
                let sort = self.builder.sort(&order_by);
                let (rows, total) = self
                    .store
                    .query(&filter, &sort, limit, offset)
                    .await
                    .map_err(ScreeningError::Store)?;
                (rows, total, total as usize, 0, false)
            }
            RoutingDecision::Computed => {
                let found = self.run_computed(request, &conditions, &order_by).await?;
                let (page, total) = assemble(found.rows, &order_by, limit, offset);
                (page, total, found.evaluated, found.skipped, found.partial)
            }
        };

        enrich_with_quotes(&mut items, self.quotes.as_ref()).await;

        let took_ms = started.elapsed().as_millis() as u64;
        info!(
            routing = %routing,
            total,
            returned = items.len(),
            evaluated,
            skipped,
            partial,
            took_ms,
            "Screening complete"
        );

        Ok(ScreeningResponse {
            total,
            items,
            routing_used: routing,
            took_ms,
            partial,
            evaluated,
            skipped,
            limit,
            offset,
        })
    }

    /// Validation outcome plus warnings, without running anything
    pub fn validate(&self, conditions: &Condition) -> ValidationReport {
        self.registry.report(&self.registry.normalize(conditions))
    }

    /// Every registry entry with live statistics
    pub async fn field_info(&self) -> Vec<FieldInfo> {
        join_all(self.registry.all().iter().map(|d| self.describe(d))).await
    }

    /// One entry by canonical name or alias
    pub async fn field(&self, name: &str) -> Option<FieldInfo> {
        let descriptor = self.registry.resolve(name)?;
        Some(self.describe(descriptor).await)
    }

    pub async fn industries(&self) -> Result<Vec<IndustrySummary>, ScreeningError> {
        self.fundamentals
            .industries()
            .await
            .map_err(ScreeningError::Store)
    }

    fn check(&self, conditions: &Condition, order_by: &[SortKey]) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        if let Err(ValidationErrors(e)) = self.registry.validate(conditions) {
            errors.extend(e);
        }
        if let Err(ValidationErrors(e)) = self.registry.validate_sort(order_by) {
            errors.extend(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    async fn describe(&self, descriptor: &FieldDescriptor) -> FieldInfo {
        let mut info = FieldInfo {
            descriptor: descriptor.clone(),
            available_values: Vec::new(),
        };
        if descriptor.category == FieldCategory::Technical {
            return info;
        }

        match descriptor.data_type {
            DataType::Number => match self.fundamentals.field_statistics(&descriptor.name).await {
                Ok(stats) => info.descriptor.statistics = Some(stats),
                Err(e) => debug!(field = %descriptor.name, error = %e, "No statistics for field"),
            },
            DataType::String | DataType::Date => {
                match self
                    .fundamentals
                    .distinct_values(&descriptor.name, MAX_AVAILABLE_VALUES)
                    .await
                {
                    Ok(values) => info.available_values = values,
                    Err(e) => debug!(field = %descriptor.name, error = %e, "No values for field"),
                }
            }
        }
        info
    }

    // ========================================================================
    // Computed path
    // ========================================================================

    async fn run_computed(
        &self,
        request: &ScreeningRequest,
        conditions: &Condition,
        order_by: &[SortKey],
    ) -> Result<ComputedMatches, ScreeningError> {
        let analysis = self.planner.analyze(conditions, order_by);

        let market = Some(request.market.as_str())
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("all"));
        let universe = self
            .fundamentals
            .universe(market, self.config.universe_cap)
            .await
            .map_err(ScreeningError::Store)?;

        let end = request.as_of.unwrap_or_else(|| Local::now().date_naive());
        let start = end
            .checked_sub_days(Days::new(self.config.lookback_days))
            .unwrap_or(NaiveDate::MIN);

        debug!(
            universe = universe.len(),
            needs_series = analysis.needs_series,
            indicators = analysis.indicator_specs.len(),
            %start,
            %end,
            "Evaluating computed path"
        );

        let deadline = self
            .config
            .deadline
            .map(|d| tokio::time::Instant::now() + d);
        let pending: Vec<futures_util::future::BoxFuture<'_, SymbolOutcome>> = universe
            .iter()
            .map(|symbol| self.evaluate_symbol(symbol, conditions, &analysis, start, end).boxed())
            .collect();
        let mut outcomes =
            std::pin::pin!(stream::iter(pending).buffered(self.config.concurrency.max(1)));

        let mut found = ComputedMatches {
            rows: Vec::new(),
            evaluated: 0,
            skipped: 0,
            partial: false,
        };
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, outcomes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            evaluated = found.evaluated,
                            universe = universe.len(),
                            "Deadline reached, returning partial result"
                        );
                        found.partial = true;
                        break;
                    }
                },
                None => outcomes.next().await,
            };
            match next {
                Some(SymbolOutcome::Matched(row)) => {
                    found.evaluated += 1;
                    found.rows.push(*row);
                }
                Some(SymbolOutcome::Rejected) => found.evaluated += 1,
                Some(SymbolOutcome::Skipped) => found.skipped += 1,
                None => break,
            }
        }
        Ok(found)
    }

    async fn evaluate_symbol(
        &self,
        symbol: &str,
        conditions: &Condition,
        analysis: &ConditionAnalysis,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SymbolOutcome {
        let snapshot = match self.fundamentals.snapshot(symbol).await {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol, error = %e, "Failed to load snapshot");
                None
            }
        };

        if !analysis.needs_series {
            let Some(snapshot) = snapshot else {
                debug!(symbol, "No snapshot, skipping");
                return SymbolOutcome::Skipped;
            };
            if !evaluate(conditions, &EvalContext::Snapshot(&snapshot)) {
                return SymbolOutcome::Rejected;
            }
            return SymbolOutcome::Matched(Box::new(row_from_snapshot(symbol, Some(&snapshot))));
        }

        let Some(mut series) = self.bars.fetch(symbol, start, end).await else {
            debug!(symbol, "No bars, skipping");
            return SymbolOutcome::Skipped;
        };
        if let Some(close) = series.column(CLOSE) {
            let changes = pct_change(close);
            series.insert(PCT_CHG, changes);
        }

        let enriched = match compute(&series, &analysis.indicator_specs) {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol, error = %e, "Indicator computation failed, skipping");
                return SymbolOutcome::Skipped;
            }
        };

        let ctx = EvalContext::Series {
            series: &enriched,
            snapshot: snapshot.as_ref(),
        };
        if !evaluate(conditions, &ctx) {
            return SymbolOutcome::Rejected;
        }

        let mut row = row_from_snapshot(symbol, snapshot.as_ref());
        for column in enriched.column_names() {
            if let Some(v) = enriched.value_from_end(&column, 0) {
                row.set(&column, FieldValue::Number(v));
            }
        }
        if let Some(date) = enriched.dates().last() {
            row.set("trade_date", FieldValue::Text(date.format("%Y-%m-%d").to_string()));
        }
        SymbolOutcome::Matched(Box::new(row))
    }
}

fn row_from_snapshot(symbol: &str, snapshot: Option<&Snapshot>) -> ScreenedRow {
    let mut row = ScreenedRow::new(symbol);
    if let Some(snapshot) = snapshot {
        for (k, v) in snapshot.iter().filter(|(k, _)| k.as_str() != "symbol") {
            row.set(k, v.clone());
        }
    }
    row
}
