//! Single-hop invocation: call an operation whose inputs are all in hand.
//!
//! Candidates are operations whose return type is assignable to the target
//! and whose every parameter is satisfiable from top-level facts. No nested
//! discovery happens here; that is graph discovery's job. A failed candidate
//! is excluded for the rest of the query and the next candidate is tried.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use weft_schema::{OperationDef, TypedInstance};

use super::{filter_matches, InvocationConstraints, QueryStrategy, StrategyResult};
use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;
use crate::facts::FactLookup;
use crate::invocation::InvocationService;

pub struct DirectInvocationStrategy {
    invocation: Arc<dyn InvocationService>,
}

impl DirectInvocationStrategy {
    pub fn new(invocation: Arc<dyn InvocationService>) -> Self {
        Self { invocation }
    }

    fn gather_arguments(
        &self,
        operation: &OperationDef,
        context: &QueryContext,
    ) -> Option<Vec<TypedInstance>> {
        operation
            .parameters
            .iter()
            .map(|param| context.get_fact(&param.type_name, FactLookup::TopLevelOnly))
            .collect()
    }
}

#[async_trait]
impl QueryStrategy for DirectInvocationStrategy {
    fn name(&self) -> &'static str {
        "direct-invocation"
    }

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError> {
        let mut resolved: Vec<TypedInstance> = Vec::new();
        let candidates: Vec<OperationDef> = context
            .schema()
            .operations()
            .filter(|(_, op)| !op.is_query_operation())
            .filter(|(_, op)| !context.is_excluded(&op.qualified_name))
            .filter(|(_, op)| {
                context
                    .schema()
                    .is_assignable(&op.return_type, &target.target)
                    .unwrap_or(false)
            })
            .map(|(_, op)| op.clone())
            .collect();

        for operation in candidates {
            context.check_cancelled()?;
            let Some(arguments) = self.gather_arguments(&operation, context) else {
                continue;
            };
            match self
                .invocation
                .invoke(&operation.qualified_name, arguments, context)
                .await
            {
                Ok(results) => {
                    for result in &results {
                        context.add_fact(result.clone());
                    }
                    resolved.extend(
                        results
                            .into_iter()
                            .filter_map(|r| filter_matches(r, &target.constraints)),
                    );
                    if !resolved.is_empty() && mode == QueryMode::Discover {
                        debug!(
                            target = %target.target,
                            operation = %operation.qualified_name,
                            "resolved by direct invocation"
                        );
                        return Ok(StrategyResult::Resolved(resolved));
                    }
                }
                Err(err) if err.is_fatal() || matches!(err, InvocationError::Cancelled) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        operation = %operation.qualified_name,
                        error = %err,
                        "direct invocation failed; excluding operation"
                    );
                    context.exclude_operation(operation.qualified_name.clone());
                }
            }
        }

        if resolved.is_empty() {
            Ok(StrategyResult::NotFound)
        } else {
            Ok(StrategyResult::Resolved(resolved))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::invocation::{invocation_chain, InstanceStream, OperationInvoker};
    use futures::{stream, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_schema::{ParameterDef, Provenance, QualifiedName, Schema, ServiceDef, TypeDef};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.Balance"))
                .with_operation(
                    "demo.Accounts",
                    "balance",
                    vec![ParameterDef {
                        name: "id".into(),
                        type_name: "demo.CustomerId".into(),
                    }],
                    "demo.Balance",
                )
                .build()
                .unwrap(),
        )
    }

    struct BalanceInvoker {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl OperationInvoker for BalanceInvoker {
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
            if self.fail {
                return Err(InvocationError::Failed {
                    operation: operation.qualified_name.clone(),
                    message: "boom".into(),
                    arguments: vec![],
                });
            }
            Ok(stream::iter(vec![Ok(TypedInstance::value(
                operation.return_type.clone(),
                100,
                Provenance::Provided,
            ))])
            .boxed())
        }
    }

    fn ctx(facts: Vec<TypedInstance>) -> QueryContext {
        QueryContext::standalone(schema(), facts, &EngineConfig::default())
    }

    #[tokio::test]
    async fn invokes_when_every_parameter_is_in_hand() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = DirectInvocationStrategy::new(invocation_chain(
            vec![Arc::new(BalanceInvoker {
                calls: Arc::clone(&calls),
                fail: false,
            })],
            vec![],
            0,
        ));
        let ctx = ctx(vec![TypedInstance::value(
            "demo.CustomerId",
            1,
            Provenance::Provided,
        )]);
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert!(result.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.has_fact(&"demo.Balance".into(), FactLookup::TopLevelOnly));
    }

    #[tokio::test]
    async fn skips_operations_with_missing_parameters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = DirectInvocationStrategy::new(invocation_chain(
            vec![Arc::new(BalanceInvoker {
                calls: Arc::clone(&calls),
                fail: false,
            })],
            vec![],
            0,
        ));
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &ctx(vec![]),
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_operations_are_excluded_for_the_query() {
        let strategy = DirectInvocationStrategy::new(invocation_chain(
            vec![Arc::new(BalanceInvoker {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: true,
            })],
            vec![],
            0,
        ));
        let ctx = ctx(vec![TypedInstance::value(
            "demo.CustomerId",
            1,
            Provenance::Provided,
        )]);
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Balance"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
        assert!(ctx.is_excluded(&QualifiedName::operation("demo.Accounts", "balance")));
    }
}
