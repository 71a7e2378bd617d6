//! Full multi-hop discovery over the type/operation graph.
//!
//! The most expensive strategy, tried last. For each fact in hand it builds
//! the search graph, proposes the cheapest path to the target, and walks it
//! with the edge evaluators. A failed walk penalizes the offending edge and
//! searches again; the attempt loop ends on success, on a duplicate proposal,
//! on an exhausted budget, or when no path exists at all. (Start, target)
//! pairs proven pathless on the full graph are remembered so later queries
//! skip them outright; verdicts reached with operations excluded reflect
//! this query's failures, not the schema, and are never cached.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use weft_schema::{QualifiedName, Schema, TypedInstance};

use super::{filter_matches, InvocationConstraints, QueryStrategy, StrategyResult};
use crate::config::EngineConfig;
use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;
use crate::graph::evaluators::{PathEvaluator, PathOutcome};
use crate::graph::{Element, GraphBuilder, GraphSearcher, PathPenalties};
use crate::invocation::InvocationService;
use crate::util::BoundedCache;

pub struct GraphDiscoveryStrategy {
    builder: GraphBuilder,
    evaluator: PathEvaluator,
    max_attempts: usize,
    /// (start type, target type) pairs known to have no path.
    no_path_cache: BoundedCache<(QualifiedName, QualifiedName), ()>,
}

impl GraphDiscoveryStrategy {
    pub fn new(
        schema: Arc<Schema>,
        invocation: Arc<dyn InvocationService>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            builder: GraphBuilder::new(schema, config),
            evaluator: PathEvaluator::new(invocation),
            max_attempts: config.max_search_attempts,
            no_path_cache: BoundedCache::new(config.search_exclusion_cache_size),
        }
    }

    #[instrument(skip_all, fields(start = %start.type_name(), target = %target.target))]
    async fn search_from(
        &self,
        start: &TypedInstance,
        target: &InvocationConstraints,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        let cache_key = (start.type_name().clone(), target.target.clone());
        if self.no_path_cache.contains(&cache_key) {
            return Ok(None);
        }

        let target_node = Element::type_node(&target.target);
        let start_node = Element::provided_instance(start.type_name());
        let mut penalties = PathPenalties::new();
        let mut proposed: HashSet<Vec<u64>> = HashSet::new();

        for attempt in 0..self.max_attempts {
            context.check_cancelled()?;
            let fact_types: BTreeSet<QualifiedName> = context
                .facts()
                .root_facts()
                .iter()
                .map(|f| f.type_name().clone())
                .collect();
            let exclusions = context.discovery_exclusions();
            let graph = self.builder.build(&fact_types, &exclusions)?;
            let searcher = GraphSearcher::new(graph, start_node.clone(), target_node.clone());

            let Some(path) = searcher.find_path(&penalties) else {
                // Only a full-graph verdict is a fact about the schema; an
                // excluded operation may carry the sole route and recover
                // by the next query.
                if attempt == 0 && exclusions.is_empty() {
                    self.no_path_cache.insert(cache_key, ());
                }
                return Ok(None);
            };
            if !proposed.insert(path.signature()) {
                debug!("duplicate path proposed; abandoning search");
                return Ok(None);
            }
            debug!(attempt, path = %path.description(), "evaluating path");

            match self
                .evaluator
                .evaluate(&path, start.clone(), context)
                .await?
            {
                PathOutcome::Resolved(value) => {
                    let assignable = context
                        .schema()
                        .is_assignable(value.type_name(), &target.target)
                        .unwrap_or(false);
                    if assignable {
                        if let Some(matched) = filter_matches(value, &target.constraints) {
                            return Ok(Some(matched));
                        }
                    }
                    // Wrong type or constraint mismatch: treat like a failure
                    // of the final hop and search on.
                    penalties.record_failure(&path, path.edges.len().saturating_sub(1));
                }
                PathOutcome::Failed {
                    failed_index,
                    message,
                } => {
                    debug!(failed_index, %message, "path failed");
                    penalties.record_failure(&path, failed_index);
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl QueryStrategy for GraphDiscoveryStrategy {
    fn name(&self) -> &'static str {
        "graph-discovery"
    }

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        _mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError> {
        context.schema().type_named(&target.target)?;

        for start in context.facts().root_facts() {
            if let Some(found) = self.search_from(&start, target, context).await? {
                context.add_fact(found.clone());
                return Ok(StrategyResult::Resolved(vec![found]));
            }
        }
        Ok(StrategyResult::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::invocation::{invocation_chain, InstanceStream, OperationInvoker};
    use futures::{stream, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_schema::{OperationDef, ParameterDef, Provenance, ServiceDef, TypeDef};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.AccountId"))
                .with_type(TypeDef::scalar("demo.Balance"))
                .with_operation(
                    "demo.Accounts",
                    "accountFor",
                    vec![ParameterDef {
                        name: "customer".into(),
                        type_name: "demo.CustomerId".into(),
                    }],
                    "demo.AccountId",
                )
                .with_operation(
                    "demo.Accounts",
                    "balanceFor",
                    vec![ParameterDef {
                        name: "account".into(),
                        type_name: "demo.AccountId".into(),
                    }],
                    "demo.Balance",
                )
                .build()
                .unwrap(),
        )
    }

    struct ChainInvoker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OperationInvoker for ChainInvoker {
        fn supports(&self, _s: &ServiceDef, _o: &OperationDef) -> bool {
            true
        }

        async fn invoke(
            &self,
            _s: &ServiceDef,
            operation: &OperationDef,
            _args: Vec<TypedInstance>,
            _context: &QueryContext,
        ) -> Result<InstanceStream, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = match operation.qualified_name.short_name() {
                "accountFor" => TypedInstance::value("demo.AccountId", "acc-1", Provenance::Provided),
                _ => TypedInstance::value("demo.Balance", 250, Provenance::Provided),
            };
            Ok(stream::iter(vec![Ok(value)]).boxed())
        }
    }

    #[tokio::test]
    async fn chains_two_operations_to_reach_the_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = invocation_chain(
            vec![Arc::new(ChainInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            0,
        );
        let config = EngineConfig::default();
        let strategy = GraphDiscoveryStrategy::new(schema(), chain, &config);
        let ctx = QueryContext::standalone(
            schema(),
            vec![TypedInstance::value(
                "demo.CustomerId",
                1,
                Provenance::Provided,
            )],
            &config,
        );
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        match result {
            StrategyResult::Resolved(matches) => {
                assert_eq!(matches[0].to_raw(), serde_json::json!(250));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exclusion_shaped_misses_do_not_blind_later_queries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = invocation_chain(
            vec![Arc::new(ChainInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            0,
        );
        let config = EngineConfig::default();
        let strategy = GraphDiscoveryStrategy::new(schema(), chain, &config);
        let customer = TypedInstance::value("demo.CustomerId", 1, Provenance::Provided);

        // Query 1: the sole first hop was excluded after a transient
        // failure elsewhere in the pipeline, so discovery finds nothing.
        let outage = QueryContext::standalone(schema(), vec![customer.clone()], &config);
        outage.exclude_operation(QualifiedName::operation("demo.Accounts", "accountFor"));
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &outage,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);

        // Query 2 on the same strategy instance: the operation is back
        // and the route must be found again.
        let recovered = QueryContext::standalone(schema(), vec![customer], &config);
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &recovered,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert!(result.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_targets_resolve_to_not_found() {
        let chain = invocation_chain(vec![], vec![], 0);
        let config = EngineConfig::default();
        let strategy = GraphDiscoveryStrategy::new(schema(), chain, &config);
        let ctx = QueryContext::standalone(
            schema(),
            vec![TypedInstance::value(
                "demo.Balance",
                9,
                Provenance::Provided,
            )],
            &config,
        );
        // Nothing produces a CustomerId from a Balance.
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.CustomerId"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
    }
}
