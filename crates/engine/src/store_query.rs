//! Store query builder for the pushdown path
//!
//! Translates a flat list of leaves into a `StoreFilter`. Legacy names and
//! the `market_cap` unit conversion are applied before each predicate is
//! built. Groups are not expressible here; a tree must be a single leaf or an
//! AND of leaves.

use crate::assembler::DEFAULT_SORT_FIELD;
use crate::condition::{Condition, Leaf, Operand, Operator, Value};
use crate::fields::{FieldCategory, FieldDescriptor, FieldRegistry};
use crate::types::{SortDirection, SortKey};
use persistence::{Comparison, Predicate, Scalar, StoreFilter, StoreSort};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreQueryError {
    #[error("nested or OR-ed condition groups cannot be pushed down to the store")]
    GroupNotSupported,

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{0}' is computed from bars and is not stored")]
    NotStored(String),

    #[error("operator '{op}' on '{field}' has no store equivalent")]
    UnsupportedOperator { field: String, op: Operator },

    #[error("invalid value for '{op}' on '{field}'")]
    InvalidValue { field: String, op: Operator },
}

pub struct StoreQueryBuilder {
    registry: Arc<FieldRegistry>,
}

impl StoreQueryBuilder {
    pub fn new(registry: Arc<FieldRegistry>) -> Self {
        Self { registry }
    }

    /// Build a filter from a whole tree, if it is flat
    pub fn build_tree(&self, condition: &Condition) -> Result<StoreFilter, StoreQueryError> {
        let leaves: Vec<Leaf> = condition
            .flat_leaves()
            .ok_or(StoreQueryError::GroupNotSupported)?
            .into_iter()
            .cloned()
            .collect();
        self.build(&leaves)
    }

    /// Build an AND-ed filter from leaves
    pub fn build(&self, leaves: &[Leaf]) -> Result<StoreFilter, StoreQueryError> {
        let mut filter = StoreFilter::new();
        for leaf in leaves {
            let leaf = self.registry.normalize_leaf(leaf);
            filter.push(self.predicate(&leaf)?);
        }
        debug!(filter = %filter.to_document(), "Built store filter");
        Ok(filter)
    }

    /// Store sort for the given keys; `total_mv` descending when empty
    pub fn sort(&self, keys: &[SortKey]) -> Vec<StoreSort> {
        if keys.is_empty() {
            return vec![StoreSort::desc(DEFAULT_SORT_FIELD)];
        }
        self.registry
            .normalize_sort(keys)
            .into_iter()
            .map(|k| match k.direction {
                SortDirection::Asc => StoreSort::asc(k.field),
                SortDirection::Desc => StoreSort::desc(k.field),
            })
            .collect()
    }

    fn stored_field(&self, name: &str) -> Result<&FieldDescriptor, StoreQueryError> {
        let descriptor = self
            .registry
            .resolve(name)
            .ok_or_else(|| StoreQueryError::UnknownField(name.to_string()))?;
        if descriptor.category == FieldCategory::Technical {
            return Err(StoreQueryError::NotStored(name.to_string()));
        }
        Ok(descriptor)
    }

    fn predicate(&self, leaf: &Leaf) -> Result<Predicate, StoreQueryError> {
        let descriptor = self.stored_field(&leaf.field)?;
        let column = descriptor.name.clone();
        let invalid = || StoreQueryError::InvalidValue {
            field: leaf.field.clone(),
            op: leaf.op,
        };

        let value = match &leaf.rhs {
            Operand::Field(other) => {
                let cmp = comparison(leaf.op).ok_or_else(|| StoreQueryError::UnsupportedOperator {
                    field: leaf.field.clone(),
                    op: leaf.op,
                })?;
                let other = self.stored_field(other)?.name.clone();
                return Ok(Predicate::CompareColumns { column, cmp, other });
            }
            Operand::Value(v) => v,
        };

        match leaf.op {
            Operator::Between => {
                let (lo, hi) = value.numeric_pair().ok_or_else(invalid)?;
                Ok(Predicate::Range { column, lo, hi })
            }
            Operator::In | Operator::NotIn => {
                let values = value
                    .as_list()
                    .ok_or_else(invalid)?
                    .iter()
                    .map(|v| scalar(descriptor, v))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(invalid)?;
                Ok(if leaf.op == Operator::In {
                    Predicate::In { column, values }
                } else {
                    Predicate::NotIn { column, values }
                })
            }
            Operator::Contains => {
                let needle = value.as_text().ok_or_else(invalid)?.to_string();
                Ok(Predicate::Contains { column, needle })
            }
            op => {
                let cmp = comparison(op).ok_or_else(|| StoreQueryError::UnsupportedOperator {
                    field: leaf.field.clone(),
                    op,
                })?;
                let value = scalar(descriptor, value).ok_or_else(invalid)?;
                Ok(Predicate::Compare { column, cmp, value })
            }
        }
    }
}

fn comparison(op: Operator) -> Option<Comparison> {
    match op {
        Operator::Gt => Some(Comparison::Gt),
        Operator::Lt => Some(Comparison::Lt),
        Operator::Gte => Some(Comparison::Gte),
        Operator::Lte => Some(Comparison::Lte),
        Operator::Eq => Some(Comparison::Eq),
        Operator::Ne => Some(Comparison::Ne),
        _ => None,
    }
}

/// Bind value typed after the column; numeric text is parsed for number
/// columns so `"100"` and `100` filter the same. Text columns take text only.
fn scalar(descriptor: &FieldDescriptor, value: &Value) -> Option<Scalar> {
    match value {
        Value::List(_) => None,
        _ if descriptor.is_numeric() => value.as_f64().map(Scalar::Number),
        Value::Text(s) => Some(Scalar::Text(s.clone())),
        Value::Number(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator::*;
    use serde_json::json;

    fn builder() -> StoreQueryBuilder {
        StoreQueryBuilder::new(Arc::new(FieldRegistry::builtin()))
    }

    #[test]
    fn test_gte_emits_document_shape() {
        let filter = builder()
            .build(&[Leaf::new("total_mv", Gte, 100.0)])
            .unwrap();
        assert_eq!(filter.to_document(), json!({ "total_mv": { "$gte": 100.0 } }));
    }

    #[test]
    fn test_aliases_and_market_cap_units() {
        let filter = builder()
            .build(&[
                Leaf::new("market_cap", Between, vec![1_000_000.0, 2_000_000.0]),
                Leaf::new("pe_ratio", Lt, 15.0),
            ])
            .unwrap();
        assert_eq!(
            filter.predicates,
            vec![
                Predicate::Range {
                    column: "total_mv".into(),
                    lo: 100.0,
                    hi: 200.0
                },
                Predicate::Compare {
                    column: "pe".into(),
                    cmp: Comparison::Lt,
                    value: Scalar::Number(15.0)
                },
            ]
        );
    }

    #[test]
    fn test_membership_contains_and_columns() {
        let filter = builder()
            .build(&[
                Leaf::new("industry", NotIn, vec!["银行", "保险"]),
                Leaf::new("name", Contains, "科技"),
                Leaf::against("close", Gt, "open"),
                Leaf::new("pb", Eq, "1.5"),
            ])
            .unwrap();
        assert_eq!(
            filter.to_document(),
            json!({
                "industry": { "$nin": ["银行", "保险"] },
                "name": { "$regex": "科技", "$options": "i" },
                "close": { "$expr": { "$gt": ["$close", "$open"] } },
                "pb": { "$eq": 1.5 },
            })
        );
    }

    #[test]
    fn test_groups_rejected() {
        let b = builder();
        let nested = Condition::and(vec![Condition::or(vec![
            Condition::leaf("pe", Lt, 10.0),
            Condition::leaf("pb", Lt, 1.0),
        ])]);
        assert_eq!(b.build_tree(&nested), Err(StoreQueryError::GroupNotSupported));

        let flat = Condition::and(vec![
            Condition::leaf("pe", Lt, 10.0),
            Condition::leaf("pb", Lt, 1.0),
        ]);
        assert_eq!(b.build_tree(&flat).unwrap().predicates.len(), 2);
        assert!(b.build_tree(&Condition::and(vec![])).unwrap().is_empty());
    }

    #[test]
    fn test_unpushable_leaves() {
        let b = builder();
        assert_eq!(
            b.build(&[Leaf::new("rsi14", Lt, 30.0)]),
            Err(StoreQueryError::NotStored("rsi14".into()))
        );
        assert_eq!(
            b.build(&[Leaf::new("bogus", Lt, 30.0)]),
            Err(StoreQueryError::UnknownField("bogus".into()))
        );
        assert_eq!(
            b.build(&[Leaf::new("pe", Gt, "cheap")]),
            Err(StoreQueryError::InvalidValue {
                field: "pe".into(),
                op: Gt
            })
        );
        assert_eq!(
            b.build(&[Leaf::new("symbol", Eq, 1.0)]),
            Err(StoreQueryError::InvalidValue {
                field: "symbol".into(),
                op: Eq
            })
        );
        assert!(matches!(
            b.build(&[Leaf::against("close", CrossUp, "open")]),
            Err(StoreQueryError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_sort_defaults_and_aliases() {
        let b = builder();
        assert_eq!(b.sort(&[]), vec![StoreSort::desc("total_mv")]);
        assert_eq!(
            b.sort(&[SortKey::asc("pe_ratio"), SortKey::desc("market_cap")]),
            vec![StoreSort::asc("pe"), StoreSort::desc("total_mv")]
        );
    }
}
