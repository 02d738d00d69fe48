//! Condition evaluator for the computed path
//!
//! Evaluates a condition tree against one symbol: either the last row (or
//! last two rows, for cross-overs) of an indicator-enriched series, or a flat
//! fundamentals snapshot. Comparison failures are explicit `ComparisonError`s
//! internally and collapse to a non-match at the leaf.

use crate::condition::{Condition, Leaf, Logic, Operand, Operator, Value};
use crate::types::{FieldValue, Series, Snapshot};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComparisonError {
    #[error("'{0}' is not numeric")]
    NotNumeric(String),

    #[error("between needs two numeric bounds")]
    MalformedBetween,

    #[error("{0} needs a list value")]
    ExpectedList(Operator),

    #[error("{0} needs text on both sides")]
    ExpectedText(Operator),

    #[error("text '{0}' is never equal to a number")]
    TextAgainstNumber(String),

    #[error("cross-over operators are evaluated over two rows")]
    CrossOver,
}

/// What a condition is evaluated against
#[derive(Debug, Clone, Copy)]
pub enum EvalContext<'a> {
    /// Enriched series; fields missing from the series fall back to the
    /// snapshot for the last row
    Series {
        series: &'a Series,
        snapshot: Option<&'a Snapshot>,
    },
    /// Fundamentals only; cross-overs never match
    Snapshot(&'a Snapshot),
}

impl<'a> EvalContext<'a> {
    pub fn series(series: &'a Series) -> Self {
        EvalContext::Series {
            series,
            snapshot: None,
        }
    }

    /// Value of `field` on the last row
    pub fn current(&self, field: &str) -> Option<FieldValue> {
        match self {
            EvalContext::Series { series, snapshot } => {
                if series.has_column(field) {
                    series.value_from_end(field, 0).map(FieldValue::Number)
                } else {
                    snapshot.and_then(|s| s.get(field).cloned())
                }
            }
            EvalContext::Snapshot(snapshot) => snapshot.get(field).cloned(),
        }
    }

    /// Numeric value of a series column `back` rows before the last
    fn historical(&self, field: &str, back: usize) -> Option<f64> {
        match self {
            EvalContext::Series { series, .. } => series.value_from_end(field, back),
            EvalContext::Snapshot(_) => None,
        }
        .filter(|v| !v.is_nan())
    }
}

/// Evaluate a condition tree. An empty AND is true, an empty OR is false.
pub fn evaluate(node: &Condition, ctx: &EvalContext<'_>) -> bool {
    match node {
        Condition::Group(group) => match group.logic {
            Logic::And => group.children.iter().all(|c| evaluate(c, ctx)),
            Logic::Or => group.children.iter().any(|c| evaluate(c, ctx)),
        },
        Condition::Leaf(leaf) if leaf.op.is_cross() => evaluate_cross(leaf, ctx),
        Condition::Leaf(leaf) => match evaluate_leaf(leaf, ctx) {
            Ok(matched) => matched,
            Err(e) => {
                trace!(field = %leaf.field, op = %leaf.op, error = %e, "Comparison failed, treating as no match");
                false
            }
        },
    }
}

fn evaluate_leaf(leaf: &Leaf, ctx: &EvalContext<'_>) -> Result<bool, ComparisonError> {
    let Some(left) = ctx.current(&leaf.field).filter(|v| !v.is_nan()) else {
        return Ok(false);
    };

    let right = match &leaf.rhs {
        Operand::Value(v) => v.clone(),
        Operand::Field(f) => match ctx.current(f).filter(|v| !v.is_nan()) {
            Some(FieldValue::Number(n)) => Value::Number(n),
            Some(FieldValue::Text(s)) => Value::Text(s),
            None => return Ok(false),
        },
    };

    compare(&left, leaf.op, &right)
}

/// Apply a non-cross operator to a left value and a right literal
pub fn compare(left: &FieldValue, op: Operator, right: &Value) -> Result<bool, ComparisonError> {
    match op {
        Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
            let l = numeric_left(left)?;
            let r = numeric_right(right)?;
            Ok(match op {
                Operator::Gt => l > r,
                Operator::Lt => l < r,
                Operator::Gte => l >= r,
                _ => l <= r,
            })
        }
        Operator::Eq => scalar_eq(left, right),
        Operator::Ne => scalar_eq(left, right).map(|eq| !eq),
        Operator::Between => {
            let (lo, hi) = right
                .numeric_pair()
                .ok_or(ComparisonError::MalformedBetween)?;
            let v = numeric_left(left)?;
            Ok(lo <= v && v <= hi)
        }
        Operator::In | Operator::NotIn => {
            let items = right.as_list().ok_or(ComparisonError::ExpectedList(op))?;
            let mut found = false;
            for item in items {
                // mismatched item types simply don't match
                if scalar_eq(left, item).unwrap_or(false) {
                    found = true;
                    break;
                }
            }
            Ok(if op == Operator::In { found } else { !found })
        }
        // ASCII-only case folding, the same rule as SQLite's LOWER and LIKE
        Operator::Contains => match (left.as_text(), right.as_text()) {
            (Some(haystack), Some(needle)) => Ok(haystack
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase())),
            _ => Err(ComparisonError::ExpectedText(op)),
        },
        Operator::CrossUp | Operator::CrossDown => Err(ComparisonError::CrossOver),
    }
}

fn numeric_left(v: &FieldValue) -> Result<f64, ComparisonError> {
    v.as_f64()
        .ok_or_else(|| ComparisonError::NotNumeric(format!("{v:?}")))
}

fn numeric_right(v: &Value) -> Result<f64, ComparisonError> {
    v.as_f64()
        .ok_or_else(|| ComparisonError::NotNumeric(format!("{v:?}")))
}

/// Text compares exactly and only with text; a number field also accepts
/// numeric text on the right. Anything else fails.
fn scalar_eq(left: &FieldValue, right: &Value) -> Result<bool, ComparisonError> {
    match (left, right) {
        (_, Value::List(_)) => Err(ComparisonError::NotNumeric(format!("{right:?}"))),
        (FieldValue::Text(l), Value::Text(r)) => Ok(l == r),
        (FieldValue::Text(l), Value::Number(_)) => {
            Err(ComparisonError::TextAgainstNumber(l.clone()))
        }
        (FieldValue::Number(_), _) => Ok(numeric_left(left)? == numeric_right(right)?),
    }
}

/// `CrossUp ⇔ a1 ≤ b1 ∧ a0 > b0`, `CrossDown ⇔ a1 ≥ b1 ∧ a0 < b0`, where
/// index 1 is the prior row. A literal right side is a constant line.
fn evaluate_cross(leaf: &Leaf, ctx: &EvalContext<'_>) -> bool {
    if matches!(ctx, EvalContext::Snapshot(_)) {
        return false;
    }

    let right = |back: usize| match &leaf.rhs {
        Operand::Field(f) => ctx.historical(f, back),
        Operand::Value(v) => v.as_f64().filter(|n| !n.is_nan()),
    };

    let (Some(a1), Some(b1), Some(a0), Some(b0)) = (
        ctx.historical(&leaf.field, 1),
        right(1),
        ctx.historical(&leaf.field, 0),
        right(0),
    ) else {
        return false;
    };

    match leaf.op {
        Operator::CrossUp => a1 <= b1 && a0 > b0,
        Operator::CrossDown => a1 >= b1 && a0 < b0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator::*;
    use chrono::NaiveDate;

    fn series(columns: &[(&str, &[f64])]) -> Series {
        let len = columns.first().map(|c| c.1.len()).unwrap_or(0);
        let dates = (0..len)
            .map(|i| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(i as u64))
            .collect();
        columns
            .iter()
            .fold(Series::new(dates), |s, (name, values)| {
                s.with_column(name, values.to_vec())
            })
    }

    fn snapshot(pairs: &[(&str, FieldValue)]) -> Snapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_group_vacuity() {
        let s = series(&[("close", &[1.0])]);
        let snap = Snapshot::new();
        for ctx in [EvalContext::series(&s), EvalContext::Snapshot(&snap)] {
            assert!(evaluate(&Condition::and(vec![]), &ctx));
            assert!(!evaluate(&Condition::or(vec![]), &ctx));
        }
    }

    #[test]
    fn test_cross_over_two_rows() {
        let s = series(&[("a", &[5.0, 7.0]), ("b", &[6.0, 6.0])]);
        let ctx = EvalContext::series(&s);
        assert!(evaluate(&Condition::against("a", CrossUp, "b"), &ctx));
        assert!(!evaluate(&Condition::against("a", CrossDown, "b"), &ctx));
        assert!(evaluate(&Condition::against("b", CrossDown, "a"), &ctx));
    }

    #[test]
    fn test_cross_over_edge_cases() {
        // touching on the prior row still counts
        let s = series(&[("a", &[6.0, 7.0]), ("b", &[6.0, 6.0])]);
        assert!(evaluate(&Condition::against("a", CrossUp, "b"), &EvalContext::series(&s)));

        // constant threshold
        let s = series(&[("rsi14", &[28.0, 31.0])]);
        assert!(evaluate(&Condition::leaf("rsi14", CrossUp, 30.0), &EvalContext::series(&s)));

        // single row, NaN and missing columns never cross
        let one = series(&[("a", &[7.0]), ("b", &[6.0])]);
        assert!(!evaluate(&Condition::against("a", CrossUp, "b"), &EvalContext::series(&one)));
        let nan = series(&[("a", &[f64::NAN, 7.0]), ("b", &[6.0, 6.0])]);
        assert!(!evaluate(&Condition::against("a", CrossUp, "b"), &EvalContext::series(&nan)));
        assert!(!evaluate(&Condition::against("a", CrossUp, "zz"), &EvalContext::series(&s)));
    }

    #[test]
    fn test_snapshot_mode_never_crosses() {
        let snap = snapshot(&[("a", 7.0.into()), ("b", 6.0.into())]);
        let ctx = EvalContext::Snapshot(&snap);
        assert!(!evaluate(&Condition::against("a", CrossUp, "b"), &ctx));
        assert!(evaluate(&Condition::against("a", Gt, "b"), &ctx));
    }

    #[test]
    fn test_last_row_comparisons() {
        let s = series(&[("close", &[1.0, 12.0]), ("ma20", &[2.0, 10.0])]);
        let ctx = EvalContext::series(&s);
        assert!(evaluate(&Condition::leaf("close", Gt, 11.0), &ctx));
        assert!(evaluate(&Condition::leaf("close", Between, vec![12.0, 13.0]), &ctx));
        assert!(evaluate(&Condition::against("close", Gte, "ma20"), &ctx));
        assert!(!evaluate(&Condition::leaf("close", Ne, 12.0), &ctx));
        assert!(evaluate(&Condition::leaf("close", In, vec![1.0, 12.0]), &ctx));
        assert!(!evaluate(&Condition::leaf("close", NotIn, vec![12.0]), &ctx));
    }

    #[test]
    fn test_missing_and_nan_left_is_false() {
        let s = series(&[("rsi14", &[f64::NAN])]);
        let ctx = EvalContext::series(&s);
        assert!(!evaluate(&Condition::leaf("rsi14", Lt, 30.0), &ctx));
        assert!(!evaluate(&Condition::leaf("rsi14", Ne, 30.0), &ctx));
        assert!(!evaluate(&Condition::leaf("pe", Lt, 30.0), &ctx));
    }

    #[test]
    fn test_coercion_failure_is_local() {
        let snap = snapshot(&[("name", "平安银行".into()), ("pe", 8.0.into())]);
        let ctx = EvalContext::Snapshot(&snap);
        // text vs number fails closed without affecting siblings
        let tree = Condition::or(vec![
            Condition::leaf("name", Gt, 3.0),
            Condition::leaf("pe", Lt, 10.0),
        ]);
        assert!(evaluate(&tree, &ctx));
        assert!(!evaluate(&Condition::leaf("name", Gt, 3.0), &ctx));
        assert!(!evaluate(&Condition::leaf("name", Ne, 3.0), &ctx));
        assert_eq!(
            compare(&"000001".into(), Eq, &Value::Number(1.0)),
            Err(ComparisonError::TextAgainstNumber("000001".into()))
        );
        assert_eq!(compare(&1.5.into(), Eq, &Value::Text("1.5".into())), Ok(true));
        assert_eq!(
            compare(&"abc".into(), Gt, &Value::Number(1.0)),
            Err(ComparisonError::NotNumeric("Text(\"abc\")".into()))
        );
        assert_eq!(
            compare(&1.0.into(), Between, &Value::Number(1.0)),
            Err(ComparisonError::MalformedBetween)
        );
    }

    #[test]
    fn test_text_operators() {
        let snap = snapshot(&[("industry", "银行".into()), ("name", "Ping An Bank".into())]);
        let ctx = EvalContext::Snapshot(&snap);
        assert!(evaluate(&Condition::leaf("industry", Eq, "银行"), &ctx));
        assert!(evaluate(&Condition::leaf("industry", In, vec!["保险", "银行"]), &ctx));
        assert!(evaluate(&Condition::leaf("industry", NotIn, vec!["保险"]), &ctx));
        assert!(evaluate(&Condition::leaf("name", Contains, "ping an"), &ctx));
        assert!(!evaluate(&Condition::leaf("name", Contains, "tencent"), &ctx));
    }

    #[test]
    fn test_contains_folds_ascii_only() {
        let snap = snapshot(&[("name", "Ärzte Holding".into())]);
        let ctx = EvalContext::Snapshot(&snap);
        assert!(evaluate(&Condition::leaf("name", Contains, "HOLDING"), &ctx));
        assert!(evaluate(&Condition::leaf("name", Contains, "Ärzte"), &ctx));
        assert!(!evaluate(&Condition::leaf("name", Contains, "ärzte"), &ctx));
    }

    #[test]
    fn test_series_falls_back_to_snapshot() {
        let s = series(&[("rsi14", &[40.0, 25.0])]);
        let snap = snapshot(&[("pe", 12.0.into())]);
        let ctx = EvalContext::Series {
            series: &s,
            snapshot: Some(&snap),
        };
        let tree = Condition::and(vec![
            Condition::leaf("pe", Between, vec![5.0, 30.0]),
            Condition::leaf("rsi14", Lt, 30.0),
        ]);
        assert!(evaluate(&tree, &ctx));
        assert!(!evaluate(&tree, &EvalContext::series(&s)));
    }

    #[test]
    fn test_nested_groups() {
        let snap = snapshot(&[("pe", 12.0.into()), ("pb", 0.8.into())]);
        let ctx = EvalContext::Snapshot(&snap);
        let tree = Condition::and(vec![
            Condition::leaf("pe", Lt, 20.0),
            Condition::or(vec![
                Condition::leaf("pb", Gt, 5.0),
                Condition::and(vec![Condition::leaf("pb", Lt, 1.0)]),
            ]),
        ]);
        assert!(evaluate(&tree, &ctx));
    }
}
