//! Store-native screening filter
//!
//! A `StoreFilter` is a flat list of column predicates that are implicitly
//! AND-ed together. It renders to a parameterised SQL `WHERE` body for SQLite
//! and to a document-style JSON form (`{"total_mv": {"$gte": 100}}`) that is
//! used for logging and diagnostics.

use crate::schema::is_snapshot_column;
use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A bindable literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    fn to_json(&self) -> Value {
        match self {
            Scalar::Number(n) => json!(n),
            Scalar::Text(s) => json!(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Ne,
}

impl Comparison {
    fn sql(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
            Comparison::Eq => "=",
            Comparison::Ne => "!=",
        }
    }

    fn doc_key(&self) -> &'static str {
        match self {
            Comparison::Gt => "$gt",
            Comparison::Lt => "$lt",
            Comparison::Gte => "$gte",
            Comparison::Lte => "$lte",
            Comparison::Eq => "$eq",
            Comparison::Ne => "$ne",
        }
    }
}

/// One column predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        cmp: Comparison,
        value: Scalar,
    },
    /// Column-to-column comparison, e.g. `close > open`
    CompareColumns {
        column: String,
        cmp: Comparison,
        other: String,
    },
    /// Inclusive range: `column >= lo AND column <= hi`
    Range { column: String, lo: f64, hi: f64 },
    In { column: String, values: Vec<Scalar> },
    NotIn { column: String, values: Vec<Scalar> },
    /// Case-insensitive substring match
    Contains { column: String, needle: String },
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::CompareColumns { column, .. }
            | Predicate::Range { column, .. }
            | Predicate::In { column, .. }
            | Predicate::NotIn { column, .. }
            | Predicate::Contains { column, .. } => column,
        }
    }
}

/// Flat, AND-ed list of predicates over `stock_snapshots`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreFilter {
    pub predicates: Vec<Predicate>,
}

impl StoreFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Render to a `WHERE` body and its bind values, in placeholder order.
    ///
    /// Every column is checked against the snapshot column whitelist, so the
    /// resulting SQL never interpolates caller-controlled identifiers.
    pub fn to_sql(&self) -> DbResult<(String, Vec<Scalar>)> {
        let mut where_clauses: Vec<String> = vec!["1=1".to_string()];
        let mut binds: Vec<Scalar> = Vec::new();

        for predicate in &self.predicates {
            let column = checked_column(predicate.column())?;
            match predicate {
                Predicate::Compare { cmp, value, .. } => {
                    where_clauses.push(format!("{column} {} ?", cmp.sql()));
                    binds.push(value.clone());
                }
                Predicate::CompareColumns { cmp, other, .. } => {
                    let other = checked_column(other)?;
                    where_clauses.push(format!("{column} {} {other}", cmp.sql()));
                }
                Predicate::Range { lo, hi, .. } => {
                    where_clauses.push(format!("{column} >= ? AND {column} <= ?"));
                    binds.push(Scalar::Number(*lo));
                    binds.push(Scalar::Number(*hi));
                }
                Predicate::In { values, .. } => {
                    if values.is_empty() {
                        where_clauses.push("0=1".to_string());
                    } else {
                        where_clauses.push(format!("{column} IN ({})", placeholders(values.len())));
                        binds.extend(values.iter().cloned());
                    }
                }
                Predicate::NotIn { values, .. } => {
                    if values.is_empty() {
                        where_clauses.push(format!("{column} IS NOT NULL"));
                    } else {
                        where_clauses
                            .push(format!("{column} NOT IN ({})", placeholders(values.len())));
                        binds.extend(values.iter().cloned());
                    }
                }
                // LOWER and LIKE fold ASCII only; the needle is folded the same way
                Predicate::Contains { needle, .. } => {
                    where_clauses.push(format!("LOWER({column}) LIKE ? ESCAPE '\\'"));
                    binds.push(Scalar::Text(format!(
                        "%{}%",
                        escape_like(&needle.to_ascii_lowercase())
                    )));
                }
            }
        }

        Ok((where_clauses.join(" AND "), binds))
    }

    /// Document-style rendering; predicates on the same column are merged
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        for predicate in &self.predicates {
            let ops = match predicate {
                Predicate::Compare { cmp, value, .. } => json!({ cmp.doc_key(): value.to_json() }),
                Predicate::CompareColumns { cmp, other, .. } => {
                    json!({ "$expr": { cmp.doc_key(): [format!("${}", predicate.column()), format!("${other}")] } })
                }
                Predicate::Range { lo, hi, .. } => json!({ "$gte": lo, "$lte": hi }),
                Predicate::In { values, .. } => {
                    json!({ "$in": values.iter().map(Scalar::to_json).collect::<Vec<_>>() })
                }
                Predicate::NotIn { values, .. } => {
                    json!({ "$nin": values.iter().map(Scalar::to_json).collect::<Vec<_>>() })
                }
                Predicate::Contains { needle, .. } => {
                    json!({ "$regex": escape_regex(needle), "$options": "i" })
                }
            };

            match doc.get_mut(predicate.column()) {
                Some(Value::Object(existing)) => {
                    if let Value::Object(new_ops) = ops {
                        existing.extend(new_ops);
                    }
                }
                _ => {
                    doc.insert(predicate.column().to_string(), ops);
                }
            }
        }
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSort {
    pub column: String,
    pub order: SortOrder,
}

impl StoreSort {
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Asc,
        }
    }
}

/// `ORDER BY` body with NULLs last in both directions; `symbol` breaks ties
pub fn order_by_sql(sorts: &[StoreSort]) -> DbResult<String> {
    let mut parts = Vec::with_capacity(sorts.len() * 2 + 1);
    for sort in sorts {
        let column = checked_column(&sort.column)?;
        let dir = match sort.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        parts.push(format!("{column} IS NULL"));
        parts.push(format!("{column} {dir}"));
    }
    parts.push("symbol ASC".to_string());
    Ok(parts.join(", "))
}

fn checked_column(name: &str) -> DbResult<&str> {
    if is_snapshot_column(name) {
        Ok(name)
    } else {
        Err(DbError::UnknownColumn(name.to_string()))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
