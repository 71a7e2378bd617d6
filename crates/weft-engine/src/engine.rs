//! The query engine.
//!
//! [`DefaultQueryEngine`] wires the strategy pipeline, the invocation chain
//! and the projection provider together behind one entry point: hand it a
//! [`QuerySpec`] and the facts you already hold, get back a [`QueryResult`]
//! with one value per resolved target, the targets that could not be
//! resolved, and a trace of which strategy settled each one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use weft_schema::{Constraint, Provenance, QualifiedName, Schema, TypedInstance};

use crate::config::EngineConfig;
use crate::context::{NestedFactResolver, QueryContext};
use crate::error::InvocationError;
use crate::facts::FactBag;
use crate::invocation::{
    invocation_chain, InvocationService, OperationInvoker, OperationPolicy,
};
use crate::projection::{LocalProjectionProvider, ProjectionProvider};
use crate::strategy::{
    CalculatedFieldStrategy, DirectInvocationStrategy, FactScanStrategy, GraphDiscoveryStrategy,
    InvocationConstraints, QueryOperationStrategy, QueryStrategy, StrategyResult,
};

// ============================================================================
// Query specification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Find one value per target.
    Discover,
    /// Collect every reachable value per target into a collection.
    Gather,
}

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub targets: Vec<InvocationConstraints>,
    pub mode: QueryMode,
    /// When set, every resolved value is reshaped into this type.
    pub projection: Option<QualifiedName>,
}

impl QuerySpec {
    pub fn discover(target: impl Into<QualifiedName>) -> Self {
        Self {
            targets: vec![InvocationConstraints::unconstrained(target)],
            mode: QueryMode::Discover,
            projection: None,
        }
    }

    pub fn gather(target: impl Into<QualifiedName>) -> Self {
        Self {
            targets: vec![InvocationConstraints::unconstrained(target)],
            mode: QueryMode::Gather,
            projection: None,
        }
    }

    /// Adds another target resolved within the same query (and fact bag).
    pub fn and_find(mut self, target: impl Into<QualifiedName>) -> Self {
        self.targets
            .push(InvocationConstraints::unconstrained(target));
        self
    }

    /// Attaches constraints to the most recently added target.
    pub fn with_constraints(mut self, constraints: Vec<Constraint>) -> Self {
        if let Some(last) = self.targets.last_mut() {
            last.constraints = constraints;
        }
        self
    }

    pub fn project_to(mut self, target: impl Into<QualifiedName>) -> Self {
        self.projection = Some(target.into());
        self
    }
}

// ============================================================================
// Query result
// ============================================================================

/// One strategy's attempt at one target, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub target: QualifiedName,
    pub strategy: String,
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub results: BTreeMap<QualifiedName, TypedInstance>,
    pub unresolved: Vec<QualifiedName>,
    pub attempts: Vec<StrategyAttempt>,
    pub completed_at: DateTime<Utc>,
}

impl QueryResult {
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn get(&self, target: &QualifiedName) -> Option<&TypedInstance> {
        self.results.get(target)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct DefaultQueryEngine {
    schema: Arc<Schema>,
    config: EngineConfig,
    strategies: Vec<Arc<dyn QueryStrategy>>,
    invocation: Arc<dyn InvocationService>,
    projection: Arc<dyn ProjectionProvider>,
}

impl DefaultQueryEngine {
    pub fn builder(schema: Arc<Schema>) -> QueryEngineBuilder {
        QueryEngineBuilder::new(schema)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// A fresh context whose nested discoveries route back through this
    /// engine. Useful for hosts that want to drive cancellation themselves.
    pub fn new_context(
        self: &Arc<Self>,
        facts: impl IntoIterator<Item = TypedInstance>,
    ) -> QueryContext {
        let bag = FactBag::with_facts(Arc::clone(&self.schema), facts);
        let resolver: Arc<dyn NestedFactResolver> = Arc::clone(self) as _;
        QueryContext::new(Arc::clone(&self.schema), bag, &self.config, resolver)
    }

    /// Invokes a single operation through the engine's decorator chain,
    /// bypassing discovery. Arguments must already be in positional order.
    pub async fn invoke_operation(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        self.invocation.invoke(operation, arguments, context).await
    }

    /// Runs a query over a fresh context seeded with the given facts.
    pub async fn query(
        self: &Arc<Self>,
        spec: QuerySpec,
        facts: Vec<TypedInstance>,
    ) -> Result<QueryResult, InvocationError> {
        let context = self.new_context(facts);
        self.execute(spec, &context).await
    }

    /// Runs a query over an existing context.
    #[instrument(skip_all, fields(query_id = %context.query_id()))]
    pub async fn execute(
        &self,
        spec: QuerySpec,
        context: &QueryContext,
    ) -> Result<QueryResult, InvocationError> {
        let mut attempts = Vec::new();
        let mut results = BTreeMap::new();
        let mut unresolved = Vec::new();

        for target in &spec.targets {
            context.check_cancelled()?;
            let matches = self
                .resolve_target(target, context, spec.mode, &mut attempts)
                .await?;
            let value = match (spec.mode, matches) {
                (_, None) => None,
                (QueryMode::Discover, Some(matches)) => matches.into_iter().next(),
                (QueryMode::Gather, Some(matches)) => {
                    Some(flatten_gathered(&target.target, matches))
                }
            };
            match value {
                Some(value) => {
                    let value = match &spec.projection {
                        Some(shape) => {
                            self.projection.project(value, shape, context).await?
                        }
                        None => value,
                    };
                    results.insert(target.target.clone(), value);
                }
                None => unresolved.push(target.target.clone()),
            }
        }

        info!(
            resolved = results.len(),
            unresolved = unresolved.len(),
            "query finished"
        );
        Ok(QueryResult {
            query_id: context.query_id(),
            results,
            unresolved,
            attempts,
            completed_at: Utc::now(),
        })
    }

    async fn resolve_target(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        mode: QueryMode,
        attempts: &mut Vec<StrategyAttempt>,
    ) -> Result<Option<Vec<TypedInstance>>, InvocationError> {
        let mut gathered: Vec<TypedInstance> = Vec::new();
        for strategy in &self.strategies {
            context.check_cancelled()?;
            let outcome = match strategy.find(target, context, mode).await {
                Ok(StrategyResult::Resolved(matches)) if !matches.is_empty() => Some(matches),
                Ok(_) => None,
                Err(err) if err.is_fatal() || matches!(err, InvocationError::Cancelled) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(strategy = strategy.name(), error = %err, "strategy errored");
                    None
                }
            };
            attempts.push(StrategyAttempt {
                target: target.target.clone(),
                strategy: strategy.name().to_string(),
                resolved: outcome.is_some(),
            });
            match (mode, outcome) {
                (QueryMode::Discover, Some(matches)) => return Ok(Some(matches)),
                (QueryMode::Gather, Some(matches)) => gathered.extend(matches),
                (_, None) => {}
            }
        }
        if gathered.is_empty() {
            Ok(None)
        } else {
            Ok(Some(gathered))
        }
    }
}

/// Gathered matches become one collection: inner collections are unwrapped
/// and duplicates (by value) dropped, preserving first-seen order.
fn flatten_gathered(target: &QualifiedName, matches: Vec<TypedInstance>) -> TypedInstance {
    let mut items: Vec<TypedInstance> = Vec::new();
    let mut push = |item: TypedInstance, items: &mut Vec<TypedInstance>| {
        if !items.contains(&item) {
            items.push(item);
        }
    };
    for matched in matches {
        match matched {
            TypedInstance::Collection { items: inner, .. } => {
                for item in inner {
                    push(item, &mut items);
                }
            }
            other => push(other, &mut items),
        }
    }
    let source = items
        .first()
        .map(|i| i.source().clone())
        .unwrap_or(Provenance::Provided);
    TypedInstance::collection(target.clone(), items, source)
}

/// Nested discoveries run the same strategy pipeline within the caller's
/// context; the depth budget on the context bounds the recursion.
#[async_trait]
impl NestedFactResolver for DefaultQueryEngine {
    async fn discover(
        &self,
        context: &QueryContext,
        target: &QualifiedName,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        let constraints = InvocationConstraints::unconstrained(target.clone());
        let mut attempts = Vec::new();
        let found = self
            .resolve_target(&constraints, context, QueryMode::Discover, &mut attempts)
            .await?;
        Ok(found.and_then(|matches| matches.into_iter().next()))
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct QueryEngineBuilder {
    schema: Arc<Schema>,
    config: EngineConfig,
    invokers: Vec<Arc<dyn OperationInvoker>>,
    policies: Vec<Arc<dyn OperationPolicy>>,
    projection: Option<Arc<dyn ProjectionProvider>>,
}

impl QueryEngineBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            config: EngineConfig::default(),
            invokers: Vec::new(),
            policies: Vec::new(),
            projection: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn OperationInvoker>) -> Self {
        self.invokers.push(invoker);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn OperationPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_projection_provider(mut self, provider: Arc<dyn ProjectionProvider>) -> Self {
        self.projection = Some(provider);
        self
    }

    pub fn build(self) -> Arc<DefaultQueryEngine> {
        let invocation: Arc<dyn InvocationService> = invocation_chain(
            self.invokers,
            self.policies,
            self.config.invocation_cache_size,
        );
        let strategies: Vec<Arc<dyn QueryStrategy>> = vec![
            Arc::new(FactScanStrategy),
            Arc::new(CalculatedFieldStrategy),
            Arc::new(DirectInvocationStrategy::new(Arc::clone(&invocation))),
            Arc::new(QueryOperationStrategy::new(Arc::clone(&invocation))),
            Arc::new(GraphDiscoveryStrategy::new(
                Arc::clone(&self.schema),
                Arc::clone(&invocation),
                &self.config,
            )),
        ];
        let projection = self.projection.unwrap_or_else(|| {
            Arc::new(LocalProjectionProvider::new(
                self.config.projection_concurrency,
            ))
        });
        Arc::new(DefaultQueryEngine {
            schema: self.schema,
            config: self.config,
            strategies,
            invocation,
            projection,
        })
    }
}
