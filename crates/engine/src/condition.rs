//! Screening condition model
//!
//! A condition is either a single comparison (`Leaf`) or an AND/OR `Group`.
//! On the wire a group is recognised by its `children` key:
//!
//! ```json
//! {"logic": "AND", "children": [
//!     {"field": "pe", "op": "between", "value": [5, 30]},
//!     {"field": "ma5", "op": "cross_up", "right_field": "ma20"}
//! ]}
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Operator
// ============================================================================

/// Comparison operators. Both the symbolic form and the legacy spelled-out
/// form (`gt`, `lte`, ...) are accepted on input; symbols are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "==", alias = "eq", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in", alias = "nin")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "cross_up")]
    CrossUp,
    #[serde(rename = "cross_down")]
    CrossDown,
}

impl Operator {
    /// Operators legal on numeric fundamentals
    pub const NUMERIC: &'static [Operator] = &[
        Operator::Gt,
        Operator::Lt,
        Operator::Gte,
        Operator::Lte,
        Operator::Eq,
        Operator::Ne,
        Operator::Between,
    ];

    /// Operators legal on text fields
    pub const TEXT: &'static [Operator] = &[
        Operator::Eq,
        Operator::Ne,
        Operator::In,
        Operator::NotIn,
        Operator::Contains,
    ];

    /// Numeric operators plus cross-overs, for indicator columns
    pub const TECHNICAL: &'static [Operator] = &[
        Operator::Gt,
        Operator::Lt,
        Operator::Gte,
        Operator::Lte,
        Operator::Eq,
        Operator::Ne,
        Operator::Between,
        Operator::CrossUp,
        Operator::CrossDown,
    ];

    pub fn is_cross(&self) -> bool {
        matches!(self, Operator::CrossUp | Operator::CrossDown)
    }

    /// Operators whose value must be a list
    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::Between | Operator::In | Operator::NotIn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Between => "between",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::CrossUp => "cross_up",
            Operator::CrossDown => "cross_down",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Logic
// ============================================================================

/// Group combinator. Parsed case-insensitively; anything other than `or`
/// is treated as AND.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl Serialize for Logic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        })
    }
}

impl<'de> Deserialize<'de> for Logic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw.eq_ignore_ascii_case("or") {
            Logic::Or
        } else {
            Logic::And
        })
    }
}

// ============================================================================
// Values and operands
// ============================================================================

/// Literal right-hand side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Numeric view; numeric text counts, lists never do
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::List(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// `[lo, hi]` when this is exactly a two-element numeric list
    pub fn numeric_pair(&self) -> Option<(f64, f64)> {
        match self.as_list()? {
            [lo, hi] => Some((lo.as_f64()?, hi.as_f64()?)),
            _ => None,
        }
    }

    /// Apply `f` to every number, recursing into lists
    pub fn map_numbers(&self, f: impl Fn(f64) -> f64 + Copy) -> Value {
        match self {
            Value::Number(n) => Value::Number(f(*n)),
            Value::List(items) => Value::List(items.iter().map(|v| v.map_numbers(f)).collect()),
            Value::Text(_) => self.clone(),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Right-hand side: a literal or another field of the same row
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Field(String),
}

// ============================================================================
// Condition tree
// ============================================================================

/// A single comparison `field op rhs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLeaf", into = "RawLeaf")]
pub struct Leaf {
    pub field: String,
    pub op: Operator,
    pub rhs: Operand,
}

/// Wire shape of a leaf; `right_field` wins when both sides are given
#[derive(Serialize, Deserialize)]
struct RawLeaf {
    field: String,
    #[serde(alias = "operator")]
    op: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    right_field: Option<String>,
}

impl TryFrom<RawLeaf> for Leaf {
    type Error = String;

    fn try_from(raw: RawLeaf) -> Result<Self, Self::Error> {
        let rhs = match (raw.right_field, raw.value) {
            (Some(field), _) => Operand::Field(field),
            (None, Some(value)) => Operand::Value(value),
            (None, None) => {
                return Err(format!(
                    "condition on '{}' needs a value or a right_field",
                    raw.field
                ))
            }
        };
        Ok(Leaf {
            field: raw.field,
            op: raw.op,
            rhs,
        })
    }
}

impl From<Leaf> for RawLeaf {
    fn from(leaf: Leaf) -> Self {
        let (value, right_field) = match leaf.rhs {
            Operand::Value(v) => (Some(v), None),
            Operand::Field(f) => (None, Some(f)),
        };
        RawLeaf {
            field: leaf.field,
            op: leaf.op,
            value,
            right_field,
        }
    }
}

impl Leaf {
    pub fn new(field: &str, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op,
            rhs: Operand::Value(value.into()),
        }
    }

    /// Compare against another field, e.g. `ma5 cross_up ma20`
    pub fn against(field: &str, op: Operator, right_field: &str) -> Self {
        Self {
            field: field.to_string(),
            op,
            rhs: Operand::Field(right_field.to_string()),
        }
    }

    pub fn right_field(&self) -> Option<&str> {
        match &self.rhs {
            Operand::Field(f) => Some(f),
            Operand::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.rhs {
            Operand::Value(v) => Some(v),
            Operand::Field(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub logic: Logic,
    pub children: Vec<Condition>,
}

/// A screening condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(Group),
    Leaf(Leaf),
}

impl Condition {
    pub fn and(children: Vec<Condition>) -> Self {
        Condition::Group(Group {
            logic: Logic::And,
            children,
        })
    }

    pub fn or(children: Vec<Condition>) -> Self {
        Condition::Group(Group {
            logic: Logic::Or,
            children,
        })
    }

    pub fn leaf(field: &str, op: Operator, value: impl Into<Value>) -> Self {
        Condition::Leaf(Leaf::new(field, op, value))
    }

    pub fn against(field: &str, op: Operator, right_field: &str) -> Self {
        Condition::Leaf(Leaf::against(field, op, right_field))
    }

    /// Every field name referenced, including right-hand field references
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for leaf in self.leaves() {
            out.insert(leaf.field.clone());
            if let Some(right) = leaf.right_field() {
                out.insert(right.to_string());
            }
        }
        out
    }

    /// All leaves, depth first
    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Leaf>) {
        match self {
            Condition::Leaf(leaf) => out.push(leaf),
            Condition::Group(group) => {
                for child in &group.children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    /// The leaves of a flat tree: a single leaf, or an AND group whose
    /// children are all leaves. `None` for anything nested or OR-ed.
    pub fn flat_leaves(&self) -> Option<Vec<&Leaf>> {
        match self {
            Condition::Leaf(leaf) => Some(vec![leaf]),
            Condition::Group(group) if group.logic == Logic::And => group
                .children
                .iter()
                .map(|c| match c {
                    Condition::Leaf(leaf) => Some(leaf),
                    Condition::Group(_) => None,
                })
                .collect(),
            Condition::Group(_) => None,
        }
    }

    /// Rewrite every leaf, keeping the tree shape
    pub fn map_leaves(&self, f: &impl Fn(&Leaf) -> Leaf) -> Condition {
        match self {
            Condition::Leaf(leaf) => Condition::Leaf(f(leaf)),
            Condition::Group(group) => Condition::Group(Group {
                logic: group.logic,
                children: group.children.iter().map(|c| c.map_leaves(f)).collect(),
            }),
        }
    }
}

impl From<Leaf> for Condition {
    fn from(leaf: Leaf) -> Self {
        Condition::Leaf(leaf)
    }
}

/// Accept either a condition tree or a bare list of conditions (AND-ed)
pub fn deserialize_conditions<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Condition, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Input {
        Tree(Condition),
        List(Vec<Condition>),
    }

    Ok(match Input::deserialize(deserializer)? {
        Input::Tree(condition) => condition,
        Input::List(children) => Condition::and(children),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_and_group_detection() {
        let parsed: Condition = serde_json::from_value(json!({
            "logic": "or",
            "children": [
                {"field": "pe", "op": "between", "value": [5, 30]},
                {"field": "ma5", "op": "cross_up", "right_field": "ma20"}
            ]
        }))
        .unwrap();

        let Condition::Group(group) = &parsed else {
            panic!("expected a group");
        };
        assert_eq!(group.logic, Logic::Or);
        assert_eq!(group.children.len(), 2);
        assert_eq!(
            group.children[0],
            Condition::leaf("pe", Operator::Between, vec![5.0, 30.0])
        );
        assert_eq!(
            group.children[1],
            Condition::against("ma5", Operator::CrossUp, "ma20")
        );
    }

    #[test]
    fn test_legacy_operator_names() {
        for (raw, op) in [
            ("gt", Operator::Gt),
            (">", Operator::Gt),
            ("lte", Operator::Lte),
            ("eq", Operator::Eq),
            ("ne", Operator::Ne),
            ("nin", Operator::NotIn),
        ] {
            let leaf: Leaf =
                serde_json::from_value(json!({"field": "pe", "op": raw, "value": 1})).unwrap();
            assert_eq!(leaf.op, op, "{raw}");
        }
        let leaf: Leaf =
            serde_json::from_value(json!({"field": "pe", "operator": ">=", "value": 1})).unwrap();
        assert_eq!(leaf.op, Operator::Gte);
    }

    #[test]
    fn test_unknown_logic_defaults_to_and() {
        let parsed: Condition =
            serde_json::from_value(json!({"logic": "XOR", "children": []})).unwrap();
        assert_eq!(parsed, Condition::and(vec![]));
        let parsed: Condition = serde_json::from_value(json!({"children": []})).unwrap();
        assert_eq!(parsed, Condition::and(vec![]));
    }

    #[test]
    fn test_leaf_without_rhs_is_rejected() {
        let err = serde_json::from_value::<Condition>(json!({"field": "pe", "op": ">"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_leaf_serializes_back_to_wire_shape() {
        let leaf = Condition::against("dif", Operator::CrossDown, "dea");
        assert_eq!(
            serde_json::to_value(&leaf).unwrap(),
            json!({"field": "dif", "op": "cross_down", "right_field": "dea"})
        );
    }

    #[test]
    fn test_fields_and_flat_leaves() {
        let tree = Condition::and(vec![
            Condition::leaf("pe", Operator::Lt, 30.0),
            Condition::against("close", Operator::Gt, "ma20"),
        ]);
        let fields: Vec<String> = tree.fields().into_iter().collect();
        assert_eq!(fields, vec!["close", "ma20", "pe"]);
        assert_eq!(tree.flat_leaves().map(|l| l.len()), Some(2));

        let nested = Condition::and(vec![Condition::or(vec![Condition::leaf(
            "pe",
            Operator::Lt,
            30.0,
        )])]);
        assert!(nested.flat_leaves().is_none());
        assert!(Condition::or(vec![]).flat_leaves().is_none());
    }

    #[test]
    fn test_list_input_becomes_and_group() {
        #[derive(Deserialize)]
        struct Req {
            #[serde(deserialize_with = "deserialize_conditions")]
            conditions: Condition,
        }
        let req: Req = serde_json::from_value(json!({
            "conditions": [{"field": "pe", "op": "<", "value": 10}]
        }))
        .unwrap();
        assert_eq!(
            req.conditions,
            Condition::and(vec![Condition::leaf("pe", Operator::Lt, 10.0)])
        );
    }

    #[test]
    fn test_numeric_pair() {
        assert_eq!(Value::from(vec![1.0, 2.0]).numeric_pair(), Some((1.0, 2.0)));
        assert_eq!(Value::from(vec![1.0]).numeric_pair(), None);
        assert_eq!(Value::from(vec!["a", "b"]).numeric_pair(), None);
        assert_eq!(Value::Number(3.0).numeric_pair(), None);
    }
}
