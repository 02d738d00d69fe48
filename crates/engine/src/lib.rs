//! Stock screening engine
//!
//! Screens a universe of equities with a boolean tree of field comparisons.
//! Provides:
//! - Field registry and condition model with validation
//! - Planner choosing between store pushdown and per-symbol evaluation
//! - Technical indicator library (MA, EMA, MACD, RSI, BOLL, ATR, KDJ)
//! - Condition evaluator with cross-over semantics
//! - Screening service over pluggable data collaborators, SQLite-backed by default

pub mod assembler;
pub mod condition;
pub mod config;
pub mod evaluator;
pub mod fields;
pub mod indicators;
pub mod planner;
pub mod providers;
pub mod service;
pub mod store;
pub mod store_query;
pub mod types;

// Re-exports for convenience
pub use condition::{Condition, Group, Leaf, Logic, Operand, Operator, Value};
pub use config::ScreeningConfig;
pub use evaluator::{evaluate, EvalContext};
pub use fields::{
    FieldCategory, FieldDescriptor, FieldRegistry, ValidationError, ValidationErrors,
    ValidationIssue, ValidationReport,
};
pub use indicators::{compute, IndicatorError, IndicatorName, IndicatorSpec, RsiMethod};
pub use planner::{QueryPlanner, RoutingDecision};
pub use providers::{BarProvider, FundamentalsSource, IndustrySummary, Quote, QuoteLookup, StoreExecutor};
pub use service::{FieldInfo, ScreeningError, ScreeningRequest, ScreeningResponse, ScreeningService};
pub use store::SqliteMarketStore;
pub use store_query::{StoreQueryBuilder, StoreQueryError};
pub use types::*;
