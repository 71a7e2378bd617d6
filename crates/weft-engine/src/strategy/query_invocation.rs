//! Constraint push-down to query-capable operations.
//!
//! An operation declaring `filter_params` is a filterable finder: it accepts
//! the filter value as a parameter and returns only matching results. When a
//! target carries constraints whose fields all map onto one operation's
//! filter params, the constraints travel to the provider instead of being
//! applied to a locally gathered superset.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use weft_schema::{Constraint, OperationDef, Provenance, TypedInstance};

use super::{filter_matches, InvocationConstraints, QueryStrategy, StrategyResult};
use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;
use crate::facts::FactLookup;
use crate::invocation::InvocationService;

pub struct QueryOperationStrategy {
    invocation: Arc<dyn InvocationService>,
}

impl QueryOperationStrategy {
    pub fn new(invocation: Arc<dyn InvocationService>) -> Self {
        Self { invocation }
    }

    /// Builds the argument list, mapping constraint values onto their
    /// declared filter parameters and filling the rest from facts. `None`
    /// when the operation cannot serve these constraints.
    fn plan_arguments(
        &self,
        operation: &OperationDef,
        constraints: &[Constraint],
        context: &QueryContext,
    ) -> Option<Vec<TypedInstance>> {
        // Every constraint field must be filterable on this operation, and
        // only equality filters can be expressed as a single parameter value.
        let mut by_param: std::collections::BTreeMap<&str, serde_json::Value> =
            std::collections::BTreeMap::new();
        for constraint in constraints {
            let param_name = operation.filter_params.get(constraint.field())?;
            match constraint {
                Constraint::Equals { value, .. } => {
                    by_param.insert(param_name.as_str(), value.clone());
                }
                _ => return None,
            }
        }

        operation
            .parameters
            .iter()
            .map(|param| {
                if let Some(value) = by_param.get(param.name.as_str()) {
                    Some(TypedInstance::value(
                        param.type_name.clone(),
                        value.clone(),
                        Provenance::Provided,
                    ))
                } else {
                    context.get_fact(&param.type_name, FactLookup::TopLevelOnly)
                }
            })
            .collect()
    }
}

#[async_trait]
impl QueryStrategy for QueryOperationStrategy {
    fn name(&self) -> &'static str {
        "query-operation"
    }

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        _mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError> {
        if !target.is_constrained() {
            return Ok(StrategyResult::NotFound);
        }

        let candidates: Vec<OperationDef> = context
            .schema()
            .operations()
            .filter(|(_, op)| op.is_query_operation())
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
            let Some(arguments) =
                self.plan_arguments(&operation, &target.constraints, context)
            else {
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
                    // Providers are trusted to filter, but verify locally so a
                    // sloppy provider can't smuggle non-matching results in.
                    let matches: Vec<TypedInstance> = results
                        .into_iter()
                        .filter_map(|r| filter_matches(r, &target.constraints))
                        .collect();
                    if !matches.is_empty() {
                        debug!(
                            target = %target.target,
                            operation = %operation.qualified_name,
                            "resolved by query operation"
                        );
                        return Ok(StrategyResult::Resolved(matches));
                    }
                }
                Err(err) if err.is_fatal() || matches!(err, InvocationError::Cancelled) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        operation = %operation.qualified_name,
                        error = %err,
                        "query operation failed; excluding"
                    );
                    context.exclude_operation(operation.qualified_name.clone());
                }
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
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_schema::{ParameterDef, QualifiedName, Schema, ServiceDef, TypeDef};

    fn schema() -> Arc<Schema> {
        let mut filter_params = BTreeMap::new();
        filter_params.insert("email".to_string(), "email".to_string());
        Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.Email"))
                .with_type(
                    TypeDef::scalar("demo.Customer")
                        .with_attribute("id", "demo.CustomerId")
                        .with_attribute("email", "demo.Email"),
                )
                .with_operation_def(
                    "demo.Search",
                    weft_schema::OperationDef {
                        qualified_name: QualifiedName::operation("demo.Search", "byEmail"),
                        parameters: vec![ParameterDef {
                            name: "email".into(),
                            type_name: "demo.Email".into(),
                        }],
                        return_type: "demo.Customer".into(),
                        metadata: BTreeMap::new(),
                        filter_params,
                    },
                )
                .build()
                .unwrap(),
        )
    }

    struct FilteringInvoker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OperationInvoker for FilteringInvoker {
        fn supports(&self, _s: &ServiceDef, _o: &OperationDef) -> bool {
            true
        }

        async fn invoke(
            &self,
            _s: &ServiceDef,
            operation: &OperationDef,
            args: Vec<TypedInstance>,
            _context: &QueryContext,
        ) -> Result<InstanceStream, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let email = args[0].to_raw();
            let mut fields = BTreeMap::new();
            fields.insert(
                "id".to_string(),
                TypedInstance::value("demo.CustomerId", 9, Provenance::Provided),
            );
            fields.insert(
                "email".to_string(),
                TypedInstance::value("demo.Email", email, Provenance::Provided),
            );
            Ok(stream::iter(vec![Ok(TypedInstance::object(
                operation.return_type.clone(),
                fields,
                Provenance::Provided,
            ))])
            .boxed())
        }
    }

    fn ctx() -> QueryContext {
        QueryContext::standalone(schema(), [], &EngineConfig::default())
    }

    fn email_constraint() -> Vec<Constraint> {
        vec![Constraint::Equals {
            field: "email".into(),
            value: serde_json::json!("a@b.c"),
        }]
    }

    #[tokio::test]
    async fn constraints_travel_as_filter_parameters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = QueryOperationStrategy::new(invocation_chain(
            vec![Arc::new(FilteringInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            0,
        ));
        let result = strategy
            .find(
                &InvocationConstraints::constrained("demo.Customer", email_constraint()),
                &ctx(),
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert!(result.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconstrained_targets_are_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = QueryOperationStrategy::new(invocation_chain(
            vec![Arc::new(FilteringInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            0,
        ));
        let result = strategy
            .find(
                &InvocationConstraints::unconstrained("demo.Customer"),
                &ctx(),
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmappable_constraints_skip_the_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = QueryOperationStrategy::new(invocation_chain(
            vec![Arc::new(FilteringInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            0,
        ));
        let result = strategy
            .find(
                &InvocationConstraints::constrained(
                    "demo.Customer",
                    vec![Constraint::Equals {
                        field: "id".into(),
                        value: serde_json::json!(1),
                    }],
                ),
                &ctx(),
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
