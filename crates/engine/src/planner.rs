//! Backend query planner
//!
//! Decides, from the fields a request references, whether it can be pushed
//! down to the store as a filter or must be evaluated per symbol over an
//! indicator-enriched series. The decision is binary: one technical field
//! anywhere sends the whole request down the computed path.

use crate::condition::Condition;
use crate::fields::{FieldCategory, FieldRegistry};
use crate::indicators::{dedup_specs, display_specs, IndicatorSpec};
use crate::types::SortKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    Pushdown,
    Computed,
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingDecision::Pushdown => write!(f, "pushdown"),
            RoutingDecision::Computed => write!(f, "computed"),
        }
    }
}

/// What the computed path needs to evaluate a request
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionAnalysis {
    /// Canonical names of every field in the conditions and sort keys
    pub fields: BTreeSet<String>,
    pub technical: BTreeSet<String>,
    /// Bars must be fetched; otherwise the snapshot alone is enough
    pub needs_series: bool,
    /// Indicators to compute, referenced ones first then the display set
    pub indicator_specs: Vec<IndicatorSpec>,
}

pub struct QueryPlanner {
    registry: Arc<FieldRegistry>,
}

impl QueryPlanner {
    pub fn new(registry: Arc<FieldRegistry>) -> Self {
        Self { registry }
    }

    /// Route a request. Unknown fields cannot be pushed down, so they route
    /// to `Computed`; validation normally rejects them before this point.
    pub fn plan(&self, condition: &Condition, sort_keys: &[SortKey]) -> RoutingDecision {
        let fields = self.referenced_fields(condition, sort_keys);
        let pushable = fields.iter().all(|f| {
            matches!(
                self.registry.category_of(f),
                Some(FieldCategory::Basic | FieldCategory::Fundamental)
            )
        });

        let decision = if pushable {
            RoutingDecision::Pushdown
        } else {
            RoutingDecision::Computed
        };
        debug!(fields = ?fields, decision = %decision, "Planned screening request");
        decision
    }

    /// Like `plan`, but a caller that declines pushdown always gets `Computed`
    pub fn plan_with_hint(
        &self,
        condition: &Condition,
        sort_keys: &[SortKey],
        prefer_pushdown: bool,
    ) -> RoutingDecision {
        if prefer_pushdown {
            self.plan(condition, sort_keys)
        } else {
            RoutingDecision::Computed
        }
    }

    pub fn analyze(&self, condition: &Condition, sort_keys: &[SortKey]) -> ConditionAnalysis {
        let fields = self.referenced_fields(condition, sort_keys);
        let technical: BTreeSet<String> = fields
            .iter()
            .filter(|f| self.registry.category_of(f) == Some(FieldCategory::Technical))
            .cloned()
            .collect();

        let mut specs: Vec<IndicatorSpec> = technical
            .iter()
            .filter_map(|f| IndicatorSpec::for_field(f))
            .collect();
        if !technical.is_empty() {
            specs.extend(display_specs());
        }

        ConditionAnalysis {
            needs_series: !technical.is_empty(),
            indicator_specs: dedup_specs(&specs),
            fields,
            technical,
        }
    }

    fn referenced_fields(&self, condition: &Condition, sort_keys: &[SortKey]) -> BTreeSet<String> {
        condition
            .fields()
            .iter()
            .map(String::as_str)
            .chain(sort_keys.iter().map(|k| k.field.as_str()))
            .map(|f| self.registry.canonical_name(f).to_string())
            .collect()
    }
}
