//! Field registry - the catalog of screenable fields
//!
//! Every condition is checked against this catalog before anything runs, and
//! the planner routes requests by the categories recorded here. The registry
//! is built once at startup and shared behind an `Arc`; it is never mutated.

use crate::condition::{Condition, Leaf, Operand, Operator, Value};
use crate::types::SortKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Legacy client field names → canonical names
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("market_cap", "total_mv"),
    ("pe_ratio", "pe"),
    ("pb_ratio", "pb"),
    ("turnover", "turnover_rate"),
    ("change_percent", "pct_chg"),
    ("price", "close"),
    ("code", "symbol"),
    ("vol", "volume"),
];

/// Legacy field whose values arrive in ten-thousand units (万元)
const LEGACY_MARKET_CAP: &str = "market_cap";
/// 万元 → 亿元
const MARKET_CAP_UNIT_DIVISOR: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldCategory {
    Basic,
    Fundamental,
    Technical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    String,
    Date,
}

/// min/max/avg/count over a field's current values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: FieldCategory,
    pub data_type: DataType,
    pub supported_operators: Vec<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<FieldStatistics>,
}

impl FieldDescriptor {
    pub fn supports(&self, op: Operator) -> bool {
        self.supported_operators.contains(&op)
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type == DataType::Number
    }
}

// ============================================================================
// Validation errors
// ============================================================================

/// A single rejected condition; `path` locates it in the request tree
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{path}: unknown field '{field}'")]
    UnknownField { path: String, field: String },

    #[error("{path}: operator '{op}' is not supported for field '{field}'")]
    UnsupportedOperator {
        path: String,
        field: String,
        op: Operator,
    },

    #[error("{path}: 'between' on '{field}' needs exactly two numeric bounds")]
    MalformedBetween { path: String, field: String },

    #[error("{path}: '{field}' needs a numeric value")]
    NonNumericValue { path: String, field: String },

    #[error("{path}: '{op}' on '{field}' needs a list value")]
    ExpectedList {
        path: String,
        field: String,
        op: Operator,
    },

    #[error("{path}: '{op}' on '{field}' needs a text value")]
    ExpectedText {
        path: String,
        field: String,
        op: Operator,
    },

    #[error("{path}: right-hand field '{right_field}' cannot be compared with '{field}'")]
    InvalidRightField {
        path: String,
        field: String,
        right_field: String,
    },
}

impl ValidationError {
    pub fn path(&self) -> &str {
        match self {
            ValidationError::UnknownField { path, .. }
            | ValidationError::UnsupportedOperator { path, .. }
            | ValidationError::MalformedBetween { path, .. }
            | ValidationError::NonNumericValue { path, .. }
            | ValidationError::ExpectedList { path, .. }
            | ValidationError::ExpectedText { path, .. }
            | ValidationError::InvalidRightField { path, .. } => path,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ValidationError::UnknownField { field, .. }
            | ValidationError::UnsupportedOperator { field, .. }
            | ValidationError::MalformedBetween { field, .. }
            | ValidationError::NonNumericValue { field, .. }
            | ValidationError::ExpectedList { field, .. }
            | ValidationError::ExpectedText { field, .. }
            | ValidationError::InvalidRightField { field, .. } => field,
        }
    }
}

/// Every problem found in one request
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} invalid condition(s): {}", .0.len(), join_messages(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Serialisable form, one entry per error
    pub fn issues(&self) -> Vec<ValidationIssue> {
        self.0
            .iter()
            .map(|e| ValidationIssue {
                path: e.path().to_string(),
                field: e.field().to_string(),
                message: e.to_string(),
            })
            .collect()
    }
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub field: String,
    pub message: String,
}

/// Serialisable outcome of `FieldRegistry::report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

// ============================================================================
// Registry
// ============================================================================

pub struct FieldRegistry {
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
    aliases: HashMap<&'static str, &'static str>,
}

impl FieldRegistry {
    pub fn from_descriptors(fields: Vec<FieldDescriptor>) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            fields,
            index,
            aliases: FIELD_ALIASES.iter().copied().collect(),
        }
    }

    /// The built-in A-share catalog
    pub fn builtin() -> Self {
        use FieldCategory::*;

        let text = |name: &str, display: &str, desc: &str| {
            descriptor(name, display, desc, Basic, DataType::String, Operator::TEXT, None)
        };
        let fundamental = |name: &str, display: &str, desc: &str, unit: &str| {
            descriptor(name, display, desc, Fundamental, DataType::Number, Operator::NUMERIC, Some(unit))
        };
        let technical = |name: &str, display: &str, desc: &str, unit: Option<&str>| {
            descriptor(name, display, desc, Technical, DataType::Number, Operator::TECHNICAL, unit)
        };

        Self::from_descriptors(vec![
            text("symbol", "股票代码", "6-digit exchange code"),
            text("name", "股票名称", "Company short name"),
            text("industry", "所属行业", "Industry classification"),
            text("area", "所属地区", "Registered region"),
            text("market", "所属市场", "Market the symbol trades in"),
            fundamental("total_mv", "总市值", "Total market capitalisation", "亿元"),
            fundamental("circ_mv", "流通市值", "Free-float market capitalisation", "亿元"),
            fundamental("pe", "市盈率", "Price to earnings", "倍"),
            fundamental("pb", "市净率", "Price to book", "倍"),
            fundamental("pe_ttm", "市盈率TTM", "Trailing twelve month price to earnings", "倍"),
            fundamental("pb_mrq", "市净率MRQ", "Most recent quarter price to book", "倍"),
            fundamental("roe", "净资产收益率", "Return on equity", "%"),
            fundamental("turnover_rate", "换手率", "Daily turnover rate", "%"),
            fundamental("volume_ratio", "量比", "Volume relative to the recent average", "倍"),
            fundamental("open", "开盘价", "Latest open", "元"),
            fundamental("high", "最高价", "Latest high", "元"),
            fundamental("low", "最低价", "Latest low", "元"),
            fundamental("close", "收盘价", "Latest close", "元"),
            fundamental("pct_chg", "涨跌幅", "Latest change in percent", "%"),
            fundamental("amount", "成交额", "Latest traded value", "元"),
            fundamental("volume", "成交量", "Latest traded volume", "手"),
            technical("ma5", "5日均线", "5-day simple moving average", Some("元")),
            technical("ma10", "10日均线", "10-day simple moving average", Some("元")),
            technical("ma20", "20日均线", "20-day simple moving average", Some("元")),
            technical("ma60", "60日均线", "60-day simple moving average", Some("元")),
            technical("ema12", "12日指数均线", "12-day exponential moving average", Some("元")),
            technical("ema26", "26日指数均线", "26-day exponential moving average", Some("元")),
            technical("dif", "MACD DIF", "EMA12 - EMA26", None),
            technical("dea", "MACD DEA", "9-day EMA of DIF", None),
            technical("macd_hist", "MACD柱", "DIF - DEA", None),
            technical("rsi6", "RSI(6)", "6-day relative strength index", None),
            technical("rsi14", "RSI(14)", "14-day relative strength index", None),
            technical("boll_mid", "布林中轨", "20-day Bollinger middle band", Some("元")),
            technical("boll_upper", "布林上轨", "Middle band + 2 standard deviations", Some("元")),
            technical("boll_lower", "布林下轨", "Middle band - 2 standard deviations", Some("元")),
            technical("atr14", "ATR(14)", "14-day average true range", Some("元")),
            technical("kdj_k", "KDJ-K", "Stochastic K (9,3,3)", None),
            technical("kdj_d", "KDJ-D", "Stochastic D (9,3,3)", None),
            technical("kdj_j", "KDJ-J", "3K - 2D", None),
        ])
    }

    /// Look up a field by canonical name or legacy alias
    pub fn resolve(&self, name: &str) -> Option<&FieldDescriptor> {
        let name = self.canonical_name(name);
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).copied().unwrap_or(name)
    }

    pub fn category_of(&self, name: &str) -> Option<FieldCategory> {
        self.resolve(name).map(|f| f.category)
    }

    pub fn all(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Rewrite legacy names to canonical ones.
    ///
    /// Values written against the legacy `market_cap` name are in 万元 and
    /// are divided by 10,000 to match `total_mv` (亿元).
    pub fn normalize(&self, condition: &Condition) -> Condition {
        condition.map_leaves(&|leaf| self.normalize_leaf(leaf))
    }

    pub fn normalize_leaf(&self, leaf: &Leaf) -> Leaf {
        let rhs = match &leaf.rhs {
            Operand::Value(v) if leaf.field == LEGACY_MARKET_CAP => {
                Operand::Value(v.map_numbers(|n| n / MARKET_CAP_UNIT_DIVISOR))
            }
            Operand::Value(v) => Operand::Value(v.clone()),
            Operand::Field(f) => Operand::Field(self.canonical_name(f).to_string()),
        };
        Leaf {
            field: self.canonical_name(&leaf.field).to_string(),
            op: leaf.op,
            rhs,
        }
    }

    pub fn normalize_sort(&self, keys: &[SortKey]) -> Vec<SortKey> {
        keys.iter()
            .map(|k| SortKey {
                field: self.canonical_name(&k.field).to_string(),
                direction: k.direction,
            })
            .collect()
    }

    /// Check every leaf; all problems are collected, not just the first
    pub fn validate(&self, condition: &Condition) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        self.validate_node(condition, "conditions", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    pub fn validate_sort(&self, keys: &[SortKey]) -> Result<(), ValidationErrors> {
        let errors: Vec<ValidationError> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| self.resolve(&k.field).is_none())
            .map(|(i, k)| ValidationError::UnknownField {
                path: format!("order_by[{i}]"),
                field: k.field.clone(),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    /// Validation outcome plus non-fatal warnings, for the validate endpoint
    pub fn report(&self, condition: &Condition) -> ValidationReport {
        let errors = match self.validate(condition) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.issues(),
        };

        let warnings = condition
            .fields()
            .into_iter()
            .filter(|f| self.category_of(f) == Some(FieldCategory::Technical))
            .map(|f| format!("technical field '{f}' forces per-symbol evaluation over a capped universe"))
            .collect();

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn validate_node(&self, node: &Condition, path: &str, errors: &mut Vec<ValidationError>) {
        match node {
            Condition::Group(group) => {
                for (i, child) in group.children.iter().enumerate() {
                    self.validate_node(child, &format!("{path}.children[{i}]"), errors);
                }
            }
            Condition::Leaf(leaf) => {
                if let Err(e) = self.validate_leaf(leaf, path) {
                    errors.push(e);
                }
            }
        }
    }

    fn validate_leaf(&self, leaf: &Leaf, path: &str) -> Result<(), ValidationError> {
        let field = || leaf.field.clone();
        let path = || path.to_string();

        let descriptor = self
            .resolve(&leaf.field)
            .ok_or_else(|| ValidationError::UnknownField {
                path: path(),
                field: field(),
            })?;

        if !descriptor.supports(leaf.op) {
            return Err(ValidationError::UnsupportedOperator {
                path: path(),
                field: field(),
                op: leaf.op,
            });
        }

        match &leaf.rhs {
            Operand::Field(right) => {
                let comparable = self
                    .resolve(right)
                    .map(|r| r.data_type == descriptor.data_type)
                    .unwrap_or(false);
                if !comparable || leaf.op.takes_list() || leaf.op == Operator::Contains {
                    return Err(ValidationError::InvalidRightField {
                        path: path(),
                        field: field(),
                        right_field: right.clone(),
                    });
                }
            }
            Operand::Value(value) => match leaf.op {
                Operator::Between => {
                    if value.numeric_pair().is_none() {
                        return Err(ValidationError::MalformedBetween {
                            path: path(),
                            field: field(),
                        });
                    }
                }
                Operator::In | Operator::NotIn => {
                    let Some(items) = value.as_list() else {
                        return Err(ValidationError::ExpectedList {
                            path: path(),
                            field: field(),
                            op: leaf.op,
                        });
                    };
                    if let Some(bad) = items.iter().find(|v| !literal_fits(descriptor, v)) {
                        return Err(literal_mismatch(descriptor, leaf, bad, path()));
                    }
                }
                Operator::Contains => {
                    if value.as_text().is_none() {
                        return Err(ValidationError::ExpectedText {
                            path: path(),
                            field: field(),
                            op: leaf.op,
                        });
                    }
                }
                _ => {
                    if !literal_fits(descriptor, value) {
                        return Err(literal_mismatch(descriptor, leaf, value, path()));
                    }
                }
            },
        }

        Ok(())
    }
}

/// Numeric fields take numbers (or numeric text); text fields take text only,
/// so `symbol = 1` is rejected rather than matching "000001" numerically
fn literal_fits(descriptor: &FieldDescriptor, value: &Value) -> bool {
    match value {
        Value::List(_) => false,
        _ if descriptor.is_numeric() => value.as_f64().is_some(),
        Value::Text(_) => true,
        Value::Number(_) => false,
    }
}

fn literal_mismatch(
    descriptor: &FieldDescriptor,
    leaf: &Leaf,
    value: &Value,
    path: String,
) -> ValidationError {
    if descriptor.is_numeric() && !matches!(value, Value::List(_)) {
        ValidationError::NonNumericValue {
            path,
            field: leaf.field.clone(),
        }
    } else {
        ValidationError::ExpectedText {
            path,
            field: leaf.field.clone(),
            op: leaf.op,
        }
    }
}

fn descriptor(
    name: &str,
    display_name: &str,
    description: &str,
    category: FieldCategory,
    data_type: DataType,
    operators: &[Operator],
    unit: Option<&str>,
) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        display_name: display_name.to_string(),
        description: description.to_string(),
        category,
        data_type,
        supported_operators: operators.to_vec(),
        unit: unit.map(str::to_string),
        statistics: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator::*;

    fn registry() -> FieldRegistry {
        FieldRegistry::builtin()
    }

    #[test]
    fn test_resolve_canonical_and_alias() {
        let reg = registry();
        assert_eq!(reg.resolve("pe").unwrap().category, FieldCategory::Fundamental);
        assert_eq!(reg.resolve("pe_ratio").unwrap().name, "pe");
        assert_eq!(reg.resolve("rsi14").unwrap().category, FieldCategory::Technical);
        assert_eq!(reg.resolve("industry").unwrap().data_type, DataType::String);
        assert!(reg.resolve("no_such_field").is_none());
    }

    #[test]
    fn test_names_are_unique() {
        let reg = registry();
        assert_eq!(reg.index.len(), reg.all().len());
    }

    #[test]
    fn test_accepts_valid_tree() {
        let tree = Condition::and(vec![
            Condition::leaf("pe", Between, vec![5.0, 30.0]),
            Condition::leaf("industry", In, vec!["银行", "保险"]),
            Condition::leaf("name", Contains, "平安"),
            Condition::against("ma5", CrossUp, "ma20"),
            Condition::or(vec![]),
        ]);
        assert_eq!(registry().validate(&tree), Ok(()));
    }

    #[test]
    fn test_collects_every_error_with_paths() {
        let tree = Condition::and(vec![
            Condition::leaf("bogus", Gt, 1.0),
            Condition::or(vec![
                Condition::leaf("industry", Gt, 1.0),
                Condition::leaf("pe", Between, vec![1.0, 2.0, 3.0]),
            ]),
        ]);
        let ValidationErrors(errors) = registry().validate(&tree).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(matches!(&errors[0], ValidationError::UnknownField { path, .. } if path == "conditions.children[0]"));
        assert!(matches!(&errors[1], ValidationError::UnsupportedOperator { op: Gt, .. }));
        assert_eq!(errors[2].path(), "conditions.children[1].children[1]");
        assert!(matches!(&errors[2], ValidationError::MalformedBetween { .. }));
    }

    #[test]
    fn test_value_shape_checks() {
        let reg = registry();
        let bad = [
            Condition::leaf("pe", Gt, "cheap"),
            Condition::leaf("pe", Between, vec!["a", "b"]),
            Condition::leaf("industry", In, "银行"),
            Condition::leaf("name", Contains, 5.0),
            Condition::against("pe", Gt, "industry"),
            Condition::against("pe", Gt, "nope"),
            Condition::leaf("total_mv", CrossUp, 1.0),
            Condition::leaf("symbol", Eq, 1.0),
            Condition::leaf("symbol", Ne, 1.0),
            Condition::leaf("industry", In, vec![Value::Text("银行".into()), Value::Number(1.0)]),
            Condition::leaf("pe", Eq, vec![1.0]),
        ];
        for cond in &bad {
            assert!(reg.validate(cond).is_err(), "{cond:?} should be rejected");
        }
        assert!(reg.validate(&Condition::leaf("pe", Lt, "15")).is_ok());
        assert!(reg.validate(&Condition::leaf("symbol", Eq, "000001")).is_ok());

        let ValidationErrors(errors) = reg.validate(&Condition::leaf("symbol", Eq, 1.0)).unwrap_err();
        assert!(matches!(&errors[0], ValidationError::ExpectedText { op: Eq, .. }));
    }

    #[test]
    fn test_normalize_aliases_and_market_cap_units() {
        let reg = registry();
        let tree = Condition::and(vec![
            Condition::leaf("market_cap", Between, vec![5_000_000.0, 10_000_000.0]),
            Condition::leaf("pe_ratio", Lt, 20.0),
            Condition::leaf("total_mv", Gte, 100.0),
            Condition::against("price", Gt, "ma20"),
        ]);
        let normalized = reg.normalize(&tree);
        assert_eq!(
            normalized,
            Condition::and(vec![
                Condition::leaf("total_mv", Between, vec![500.0, 1000.0]),
                Condition::leaf("pe", Lt, 20.0),
                Condition::leaf("total_mv", Gte, 100.0),
                Condition::against("close", Gt, "ma20"),
            ])
        );
        // idempotent once canonical
        assert_eq!(reg.normalize(&normalized), normalized);
    }

    #[test]
    fn test_sort_validation() {
        let reg = registry();
        assert!(reg.validate_sort(&[SortKey::desc("total_mv")]).is_ok());
        let err = reg.validate_sort(&[SortKey::asc("pe"), SortKey::asc("zzz")]).unwrap_err();
        assert_eq!(err.0[0].path(), "order_by[1]");
    }

    #[test]
    fn test_report_warns_on_technical_fields() {
        let reg = registry();
        let report = reg.report(&Condition::and(vec![
            Condition::leaf("pe", Lt, 20.0),
            Condition::leaf("rsi14", Lt, 30.0),
        ]));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("rsi14"));

        let report = reg.report(&Condition::leaf("pe", Between, 3.0));
        assert!(!report.valid);
        assert_eq!(report.errors[0].field, "pe");
        assert_eq!(report.errors[0].path, "conditions");
    }
}
