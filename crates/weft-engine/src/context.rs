//! Per-query execution state.
//!
//! A [`QueryContext`] travels with one query: the fact bag, cooperative
//! cancellation, the operations this query has sworn off, and a recursion
//! budget for nested discovery. Branching a context forks the facts while
//! sharing the cancellation flag and exclusions, so cancelling the root query
//! stops every branch.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;
use weft_schema::{QualifiedName, Schema, TypedInstance};

use crate::config::EngineConfig;
use crate::error::InvocationError;
use crate::facts::{FactBag, FactLookup};

/// The seam through which edge evaluation re-enters the engine: resolving an
/// operation parameter may itself require a full discovery search.
#[async_trait]
pub trait NestedFactResolver: Send + Sync {
    /// Attempts to discover a fact of `target` within the given context.
    /// `Ok(None)` means "searched and found nothing" — not an error.
    async fn discover(
        &self,
        context: &QueryContext,
        target: &QualifiedName,
    ) -> Result<Option<TypedInstance>, InvocationError>;
}

/// A resolver that never discovers anything. Contexts built with it can still
/// answer from facts already in the bag.
pub struct NullResolver;

#[async_trait]
impl NestedFactResolver for NullResolver {
    async fn discover(
        &self,
        _context: &QueryContext,
        _target: &QualifiedName,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct QueryContext {
    schema: Arc<Schema>,
    facts: FactBag,
    query_id: Uuid,
    depth: usize,
    max_depth: usize,
    cancelled: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
    excluded_operations: Arc<RwLock<BTreeSet<QualifiedName>>>,
    active_invocations: Arc<RwLock<BTreeSet<QualifiedName>>>,
    under_construction: Arc<RwLock<BTreeSet<QualifiedName>>>,
    resolver: Arc<dyn NestedFactResolver>,
}

impl QueryContext {
    pub fn new(
        schema: Arc<Schema>,
        facts: FactBag,
        config: &EngineConfig,
        resolver: Arc<dyn NestedFactResolver>,
    ) -> Self {
        Self {
            schema,
            facts,
            query_id: Uuid::new_v4(),
            depth: 0,
            max_depth: config.max_query_depth,
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
            excluded_operations: Arc::new(RwLock::new(BTreeSet::new())),
            active_invocations: Arc::new(RwLock::new(BTreeSet::new())),
            under_construction: Arc::new(RwLock::new(BTreeSet::new())),
            resolver,
        }
    }

    /// A context without nested discovery, seeded from the given facts.
    pub fn standalone(
        schema: Arc<Schema>,
        facts: impl IntoIterator<Item = TypedInstance>,
        config: &EngineConfig,
    ) -> Self {
        let bag = FactBag::with_facts(Arc::clone(&schema), facts);
        Self::new(schema, bag, config, Arc::new(NullResolver))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn facts(&self) -> &FactBag {
        &self.facts
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    // ------------------------------------------------------------------
    // Branching & nesting
    // ------------------------------------------------------------------

    /// Forks the facts; cancellation and exclusions stay shared.
    pub fn branch(&self) -> QueryContext {
        QueryContext {
            facts: self.facts.branch(),
            ..self.clone()
        }
    }

    /// A branch whose bag holds only the given fact. Used for per-item
    /// projection.
    pub fn only(&self, fact: TypedInstance) -> QueryContext {
        QueryContext {
            facts: self.facts.only(fact),
            ..self.clone()
        }
    }

    /// A child context for a nested discovery, sharing the fact bag so the
    /// sub-query's findings remain available to the parent. `None` when the
    /// recursion budget is spent.
    pub fn nested(&self) -> Option<QueryContext> {
        if self.depth + 1 > self.max_depth {
            debug!(depth = self.depth, "nested query depth exhausted");
            return None;
        }
        Some(QueryContext {
            depth: self.depth + 1,
            ..self.clone()
        })
    }

    /// Runs a nested discovery for `target` if the budget allows.
    pub async fn discover_nested(
        &self,
        target: &QualifiedName,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        let Some(nested) = self.nested() else {
            return Ok(None);
        };
        let resolver = Arc::clone(&self.resolver);
        resolver.discover(&nested, target).await
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Sets a wall-clock deadline. Past the deadline the query behaves
    /// exactly as if cancelled.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Utc::now() > deadline)
    }

    pub fn check_cancelled(&self) -> Result<(), InvocationError> {
        if self.is_cancelled() {
            Err(InvocationError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Operation exclusions
    // ------------------------------------------------------------------

    /// Removes an operation from consideration for the rest of this query,
    /// across all branches.
    pub fn exclude_operation(&self, operation: QualifiedName) {
        debug!(%operation, "operation excluded");
        self.excluded_operations.write().insert(operation);
    }

    pub fn is_excluded(&self, operation: &QualifiedName) -> bool {
        self.excluded_operations.read().contains(operation)
    }

    pub fn excluded_operations(&self) -> BTreeSet<QualifiedName> {
        self.excluded_operations.read().clone()
    }

    /// Exclusions plus operations currently mid-invocation. Discovery uses
    /// this set so resolving an operation's parameters never re-enters the
    /// same operation.
    pub fn discovery_exclusions(&self) -> BTreeSet<QualifiedName> {
        let mut all = self.excluded_operations.read().clone();
        all.extend(self.active_invocations.read().iter().cloned());
        all
    }

    /// Marks an operation as mid-invocation. Returns `false` if it already
    /// is, which signals an invocation cycle.
    pub fn begin_invocation(&self, operation: &QualifiedName) -> bool {
        self.active_invocations.write().insert(operation.clone())
    }

    pub fn end_invocation(&self, operation: &QualifiedName) {
        self.active_invocations.write().remove(operation);
    }

    // ------------------------------------------------------------------
    // Parameter-object construction guard
    // ------------------------------------------------------------------

    /// Marks a parameter type as under construction. Returns `false` if it
    /// already is, which signals a construction cycle.
    pub fn begin_construction(&self, type_name: &QualifiedName) -> bool {
        self.under_construction.write().insert(type_name.clone())
    }

    pub fn end_construction(&self, type_name: &QualifiedName) {
        self.under_construction.write().remove(type_name);
    }

    // ------------------------------------------------------------------
    // Fact shortcuts
    // ------------------------------------------------------------------

    pub fn has_fact(&self, type_name: &QualifiedName, lookup: FactLookup) -> bool {
        self.facts.has_fact_of_type(type_name, lookup)
    }

    pub fn get_fact(&self, type_name: &QualifiedName, lookup: FactLookup) -> Option<TypedInstance> {
        self.facts.get_fact(type_name, lookup)
    }

    pub fn add_fact(&self, fact: TypedInstance) -> bool {
        self.facts.add(fact)
    }
}
