//! The ordered resolution pipeline.
//!
//! Strategies are tried cheapest-first for every target: scan the facts
//! already in hand, derive locally via a declared formula, call an operation
//! whose inputs are all present, push constraints down to a query-capable
//! operation, and only then run a full graph discovery. The first strategy
//! that resolves a target wins; in gather mode every strategy contributes.

pub mod calculated;
pub mod direct_invocation;
pub mod fact_scan;
pub mod graph_discovery;
pub mod query_invocation;

use async_trait::async_trait;
use weft_schema::{Constraint, QualifiedName, TypedInstance};

use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;

pub use calculated::CalculatedFieldStrategy;
pub use direct_invocation::DirectInvocationStrategy;
pub use fact_scan::FactScanStrategy;
pub use graph_discovery::GraphDiscoveryStrategy;
pub use query_invocation::QueryOperationStrategy;

/// One resolution target: the requested type plus any constraints attached
/// to it.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationConstraints {
    pub target: QualifiedName,
    pub constraints: Vec<Constraint>,
}

impl InvocationConstraints {
    pub fn unconstrained(target: impl Into<QualifiedName>) -> Self {
        Self {
            target: target.into(),
            constraints: Vec::new(),
        }
    }

    pub fn constrained(
        target: impl Into<QualifiedName>,
        constraints: Vec<Constraint>,
    ) -> Self {
        Self {
            target: target.into(),
            constraints,
        }
    }

    pub fn is_constrained(&self) -> bool {
        !self.constraints.is_empty()
    }
}

/// What one strategy produced for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyResult {
    Resolved(Vec<TypedInstance>),
    NotFound,
}

impl StrategyResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, StrategyResult::Resolved(matches) if !matches.is_empty())
    }
}

#[async_trait]
pub trait QueryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError>;
}

/// Local constraint evaluation against a resolved instance. Collections
/// match when any item matches. Missing fields never match.
pub fn satisfies(instance: &TypedInstance, constraints: &[Constraint]) -> bool {
    if constraints.is_empty() {
        return true;
    }
    if let Some(items) = instance.items() {
        return items.iter().any(|item| satisfies(item, constraints));
    }
    constraints.iter().all(|constraint| {
        let Some(field_value) = instance.attribute(constraint.field()) else {
            return false;
        };
        let raw = field_value.to_raw();
        match constraint {
            Constraint::Equals { value, .. } => &raw == value,
            Constraint::OneOf { values, .. } => values.contains(&raw),
            Constraint::Range { min, max, .. } => {
                in_range(&raw, min, max).unwrap_or(false)
            }
        }
    })
}

fn in_range(
    value: &serde_json::Value,
    min: &serde_json::Value,
    max: &serde_json::Value,
) -> Option<bool> {
    let v = value.as_f64()?;
    let lo = min.as_f64()?;
    let hi = max.as_f64()?;
    Some(lo <= v && v <= hi)
}

/// Filters collections down to matching items; passes scalars/objects
/// through only when they match.
pub fn filter_matches(instance: TypedInstance, constraints: &[Constraint]) -> Option<TypedInstance> {
    if constraints.is_empty() {
        return Some(instance);
    }
    match instance {
        TypedInstance::Collection {
            type_name,
            items,
            source,
        } => {
            let kept: Vec<TypedInstance> = items
                .into_iter()
                .filter(|item| satisfies(item, constraints))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(TypedInstance::Collection {
                    type_name,
                    items: kept,
                    source,
                })
            }
        }
        other if satisfies(&other, constraints) => Some(other),
        _ => None,
    }
}
