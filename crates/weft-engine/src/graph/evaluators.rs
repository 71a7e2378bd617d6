//! Runtime semantics for discovered paths.
//!
//! A discovered [`SearchPath`] is only a proposal; the [`PathEvaluator`]
//! walks it edge by edge, carrying the value currently in hand. Structural
//! edges pass the value through unchanged; attribute edges project a field
//! out of an object; synonym edges remap enum values; `PROVIDES` edges gather
//! arguments and actually invoke the operation.
//!
//! Non-fatal failures (a missing attribute, an unresolvable parameter, a
//! failed call) surface as a [`PathOutcome::Failed`] with the index of the
//! offending edge so the caller can penalize it and search again. Schema
//! errors and cancellation propagate as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};
use weft_schema::{
    OperationDef, Provenance, QualifiedName, Schema, TypedInstance,
};

use super::element::ElementKind;
use super::relationship::{Edge, Relationship};
use super::search::SearchPath;
use crate::context::QueryContext;
use crate::error::InvocationError;
use crate::facts::FactLookup;
use crate::invocation::InvocationService;

/// The result of walking one path.
#[derive(Debug)]
pub enum PathOutcome {
    Resolved(TypedInstance),
    Failed {
        failed_index: usize,
        message: String,
    },
}

pub struct PathEvaluator {
    invocation: Arc<dyn InvocationService>,
}

impl PathEvaluator {
    pub fn new(invocation: Arc<dyn InvocationService>) -> Self {
        Self { invocation }
    }

    /// Walks the path starting from `start`, the fact sitting on the path's
    /// first node.
    #[instrument(skip_all, fields(hops = path.edges.len()))]
    pub async fn evaluate(
        &self,
        path: &SearchPath,
        start: TypedInstance,
        context: &QueryContext,
    ) -> Result<PathOutcome, InvocationError> {
        let mut current = Some(start);
        for (index, edge) in path.edges.iter().enumerate() {
            context.check_cancelled()?;
            match self.evaluate_edge(edge, current.take(), context).await {
                Ok(next) => current = next,
                Err(err) if err.is_fatal() || matches!(err, InvocationError::Cancelled) => {
                    return Err(err);
                }
                Err(err) => {
                    debug!(edge = %edge.description(), error = %err, "edge failed");
                    return Ok(PathOutcome::Failed {
                        failed_index: index,
                        message: err.to_string(),
                    });
                }
            }
        }
        match current {
            Some(value) => Ok(PathOutcome::Resolved(value)),
            None => Ok(PathOutcome::Failed {
                failed_index: path.edges.len().saturating_sub(1),
                message: "path ended without a value".to_string(),
            }),
        }
    }

    async fn evaluate_edge(
        &self,
        edge: &Edge,
        current: Option<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        match edge.relationship {
            // Structural edges carry the value through unchanged.
            Relationship::IsTypeOf
            | Relationship::HasAttribute
            | Relationship::ExtendsType
            | Relationship::IsInstanceOf
            | Relationship::CanPopulate
            | Relationship::IsParameterOn
            | Relationship::RequiresParameter => Ok(current),

            // Member -> owner (type layer) or member -> member instance
            // (provided layer): either way the value in hand continues.
            Relationship::IsAttributeOf => Ok(current),

            Relationship::InstanceHasAttribute => {
                self.project_attribute(edge, current, context)
            }

            Relationship::IsSynonymOf => self.map_synonym(edge, current, context),

            Relationship::Provides => self.invoke_provider(edge, current, context).await,
        }
    }

    /// `instance -[instance has attribute]-> member`: project the field out
    /// of the object in hand (or out of a matching fact).
    fn project_attribute(
        &self,
        edge: &Edge,
        current: Option<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        let Some((owner_type, attribute)) = edge.target.member_parts() else {
            return Err(InvocationError::Failed {
                operation: QualifiedName::new(edge.target.value.clone()),
                message: "malformed member node".to_string(),
                arguments: vec![],
            });
        };
        let holder = match current {
            Some(instance) if instance.attribute(attribute).is_some() => instance,
            _ => context
                .get_fact(&owner_type, FactLookup::TopLevelOnly)
                .ok_or_else(|| InvocationError::UnresolvedParameters {
                    operation: QualifiedName::new(edge.target.value.clone()),
                    message: format!("no instance of {owner_type} holds '{attribute}'"),
                })?,
        };
        let value = holder.attribute(attribute).cloned().ok_or_else(|| {
            InvocationError::UnresolvedParameters {
                operation: QualifiedName::new(edge.target.value.clone()),
                message: format!("attribute '{attribute}' is absent"),
            }
        })?;
        if !value.is_populated() {
            return Err(InvocationError::UnresolvedParameters {
                operation: QualifiedName::new(edge.target.value.clone()),
                message: format!("attribute '{attribute}' is unpopulated"),
            });
        }
        Ok(Some(value))
    }

    /// `enumA -[is synonym of]-> enumB`: remap the value in hand using the
    /// synonym declarations (searched in both directions).
    fn map_synonym(
        &self,
        edge: &Edge,
        current: Option<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        let from = edge.source.qualified_name();
        let to = edge.target.qualified_name();
        let value = current
            .filter(|v| v.is_populated())
            .or_else(|| context.get_fact(&from, FactLookup::TopLevelOnly))
            .ok_or_else(|| InvocationError::UnresolvedParameters {
                operation: from.clone(),
                message: format!("no {from} value to map to {to}"),
            })?;
        let raw = value.to_raw();
        let Some(name) = raw.as_str() else {
            return Err(InvocationError::UnresolvedParameters {
                operation: from.clone(),
                message: "synonym mapping requires an enum value".to_string(),
            });
        };
        let mapped = synonym_value(context.schema(), &from, name, &to)?.ok_or_else(|| {
            InvocationError::UnresolvedParameters {
                operation: from.clone(),
                message: format!("'{name}' has no declared synonym on {to}"),
            }
        })?;
        Ok(Some(TypedInstance::value(
            to,
            mapped,
            Provenance::MappedSynonym { from_type: from },
        )))
    }

    /// `operation -[provides]-> instance`: gather arguments, invoke, and
    /// feed the results back into the fact bag.
    async fn invoke_provider(
        &self,
        edge: &Edge,
        current: Option<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        debug_assert_eq!(edge.source.kind, ElementKind::Operation);
        let operation_name = edge.source.qualified_name();
        if context.is_excluded(&operation_name) {
            return Err(InvocationError::UnresolvedParameters {
                operation: operation_name.clone(),
                message: "operation is excluded for this query".to_string(),
            });
        }
        let (_, operation) = context.schema().operation(&operation_name)?;
        let operation = operation.clone();

        if !context.begin_invocation(&operation_name) {
            return Err(InvocationError::UnresolvedParameters {
                operation: operation_name.clone(),
                message: "operation is already being invoked on this path".to_string(),
            });
        }
        let gathered = ParameterResolver::new(Arc::clone(&self.invocation))
            .gather(&operation, current.as_ref(), context)
            .await;
        context.end_invocation(&operation_name);
        let arguments = gathered?;

        let results = self
            .invocation
            .invoke(&operation_name, arguments, context)
            .await?;
        if results.is_empty() {
            return Err(InvocationError::Failed {
                operation: operation_name,
                message: "operation returned no results".to_string(),
                arguments: vec![],
            });
        }
        for result in &results {
            context.add_fact(result.clone());
        }
        let value = if results.len() == 1 {
            results.into_iter().next()
        } else {
            let source = results[0].source().clone();
            Some(TypedInstance::collection(
                operation.return_type.clone(),
                results,
                source,
            ))
        };
        Ok(value)
    }
}

/// Looks up the synonym declared between two enum types for a specific value,
/// in either direction.
pub fn synonym_value(
    schema: &Schema,
    from: &QualifiedName,
    value: &str,
    to: &QualifiedName,
) -> Result<Option<String>, InvocationError> {
    let from_ty = schema.type_named(from)?;
    if let Some(enum_value) = from_ty.enum_value(value) {
        if let Some(syn) = enum_value.synonyms.iter().find(|s| &s.enum_type == to) {
            return Ok(Some(syn.value.clone()));
        }
    }
    // Reverse direction: the target enum declares the synonym pointing back.
    let to_ty = schema.type_named(to)?;
    for enum_value in &to_ty.enum_values {
        if enum_value
            .synonyms
            .iter()
            .any(|s| &s.enum_type == from && s.value == value)
        {
            return Ok(Some(enum_value.name.clone()));
        }
    }
    Ok(None)
}

// ============================================================================
// Parameter resolution
// ============================================================================

/// Gathers arguments for an operation call. Candidates are tried in a fixed
/// order: the value in hand, a top-level fact, a unique any-depth fact, a
/// nested discovery, and finally field-by-field construction for declared
/// parameter types.
pub struct ParameterResolver {
    invocation: Arc<dyn InvocationService>,
}

impl ParameterResolver {
    pub fn new(invocation: Arc<dyn InvocationService>) -> Self {
        Self { invocation }
    }

    pub async fn gather(
        &self,
        operation: &OperationDef,
        hint: Option<&TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        let mut arguments = Vec::with_capacity(operation.parameters.len());
        for parameter in &operation.parameters {
            let argument = self
                .resolve(&operation.qualified_name, &parameter.type_name, hint, context)
                .await?;
            arguments.push(argument);
        }
        Ok(arguments)
    }

    async fn resolve(
        &self,
        operation: &QualifiedName,
        type_name: &QualifiedName,
        hint: Option<&TypedInstance>,
        context: &QueryContext,
    ) -> Result<TypedInstance, InvocationError> {
        if let Some(hint) = hint {
            if hint.is_populated()
                && context
                    .schema()
                    .is_assignable(hint.type_name(), type_name)?
            {
                return Ok(hint.clone());
            }
        }
        if let Some(fact) = context.get_fact(type_name, FactLookup::TopLevelOnly) {
            return Ok(fact);
        }
        if let Some(fact) = context.get_fact(type_name, FactLookup::AnyDepthExpectOneDistinct) {
            return Ok(fact);
        }
        if let Some(found) = context.discover_nested(type_name).await? {
            return Ok(found);
        }

        let ty = context.schema().type_named(type_name)?;
        if ty.parameter_type && !ty.is_scalar() {
            if let Some(built) = self.construct(operation, type_name, context).await? {
                return Ok(built);
            }
        }

        Err(InvocationError::UnresolvedParameters {
            operation: operation.clone(),
            message: format!("no candidate for parameter of type {type_name}"),
        })
    }

    /// Builds a parameter-type instance field by field. Returns `Ok(None)`
    /// when a construction cycle is detected.
    async fn construct(
        &self,
        operation: &QualifiedName,
        type_name: &QualifiedName,
        context: &QueryContext,
    ) -> Result<Option<TypedInstance>, InvocationError> {
        if !context.begin_construction(type_name) {
            return Ok(None);
        }
        let result = self
            .construct_fields(operation, type_name, context)
            .await;
        context.end_construction(type_name);
        result.map(Some)
    }

    async fn construct_fields(
        &self,
        operation: &QualifiedName,
        type_name: &QualifiedName,
        context: &QueryContext,
    ) -> Result<TypedInstance, InvocationError> {
        let ty = context.schema().type_named(type_name)?.clone();
        let mut fields = BTreeMap::new();
        for (name, field) in &ty.attributes {
            let value = Box::pin(self.resolve(operation, &field.type_name, None, context)).await;
            match value {
                Ok(value) => {
                    fields.insert(name.clone(), value);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) if field.nullable => {
                    fields.insert(
                        name.clone(),
                        TypedInstance::null(field.type_name.clone(), Provenance::Calculated),
                    );
                }
                Err(err) => return Err(err),
            }
        }
        debug!(%type_name, "constructed parameter object");
        Ok(TypedInstance::object(
            type_name.clone(),
            fields,
            Provenance::Calculated,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::invocation::{
        invocation_chain, InstanceStream, OperationInvoker,
    };
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::sync::Arc;
    use weft_schema::{
        EnumSynonym, EnumValueDef, ParameterDef, Provenance, Schema, ServiceDef, TypeDef,
    };

    fn schema() -> Arc<Schema> {
        let mut country = TypeDef::scalar("banking.CountryCode");
        country.enum_values.push(EnumValueDef {
            name: "DE".into(),
            synonyms: vec![EnumSynonym {
                enum_type: "iso.Alpha3".into(),
                value: "DEU".into(),
            }],
        });
        let mut alpha3 = TypeDef::scalar("iso.Alpha3");
        alpha3.enum_values.push(EnumValueDef {
            name: "DEU".into(),
            synonyms: vec![],
        });
        Arc::new(
            Schema::builder()
                .with_type(country)
                .with_type(alpha3)
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.Email"))
                .with_type(
                    TypeDef::scalar("demo.Customer")
                        .with_attribute("id", "demo.CustomerId")
                        .with_attribute("email", "demo.Email"),
                )
                .with_type(
                    TypeDef::scalar("demo.LookupRequest")
                        .with_attribute("id", "demo.CustomerId")
                        .as_parameter_type(),
                )
                .with_operation(
                    "demo.Svc",
                    "byRequest",
                    vec![ParameterDef {
                        name: "req".into(),
                        type_name: "demo.LookupRequest".into(),
                    }],
                    "demo.Customer",
                )
                .build()
                .unwrap(),
        )
    }

    struct EchoInvoker;

    #[async_trait]
    impl OperationInvoker for EchoInvoker {
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
            let mut fields = BTreeMap::new();
            fields.insert(
                "id".to_string(),
                TypedInstance::value("demo.CustomerId", 7, Provenance::Provided),
            );
            fields.insert(
                "email".to_string(),
                TypedInstance::value("demo.Email", "x@y.z", Provenance::Provided),
            );
            Ok(stream::iter(vec![Ok(TypedInstance::object(
                operation.return_type.clone(),
                fields,
                Provenance::Provided,
            ))])
            .boxed())
        }
    }

    fn evaluator() -> PathEvaluator {
        PathEvaluator::new(invocation_chain(vec![Arc::new(EchoInvoker)], vec![], 0))
    }

    fn ctx(facts: Vec<TypedInstance>) -> QueryContext {
        QueryContext::standalone(schema(), facts, &EngineConfig::default())
    }

    #[test]
    fn synonym_values_map_in_both_directions() {
        let schema = schema();
        assert_eq!(
            synonym_value(&schema, &"banking.CountryCode".into(), "DE", &"iso.Alpha3".into())
                .unwrap(),
            Some("DEU".to_string())
        );
        assert_eq!(
            synonym_value(&schema, &"iso.Alpha3".into(), "DEU", &"banking.CountryCode".into())
                .unwrap(),
            Some("DE".to_string())
        );
    }

    #[tokio::test]
    async fn parameter_objects_are_built_from_facts() {
        let ctx = ctx(vec![TypedInstance::value(
            "demo.CustomerId",
            7,
            Provenance::Provided,
        )]);
        let chain = invocation_chain(vec![Arc::new(EchoInvoker)], vec![], 0);
        let (_, op) = schema()
            .operation(&QualifiedName::operation("demo.Svc", "byRequest"))
            .map(|(s, o)| (s.clone(), o.clone()))
            .unwrap();
        let args = ParameterResolver::new(chain)
            .gather(&op, None, &ctx)
            .await
            .unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(
            args[0].attribute("id").unwrap().to_raw(),
            serde_json::json!(7)
        );
    }

    #[tokio::test]
    async fn unresolvable_parameters_fail_the_edge_not_the_query() {
        let ctx = ctx(vec![]);
        let mut graph = super::super::relationship::SearchGraph::new();
        let op_node =
            super::super::element::Element::operation(&QualifiedName::operation("demo.Svc", "byRequest"));
        let target =
            super::super::element::Element::provided_instance(&"demo.Customer".into());
        graph.connect(op_node.clone(), target, Relationship::Provides);
        let path = SearchPath {
            edges: graph.outgoing(&op_node).to_vec(),
            cost: 100,
        };
        let outcome = evaluator()
            .evaluate(
                &path,
                TypedInstance::null("demo.Email", Provenance::Provided),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PathOutcome::Failed { failed_index: 0, .. }));
    }

    #[tokio::test]
    async fn provider_results_land_in_the_fact_bag() {
        let ctx = ctx(vec![TypedInstance::value(
            "demo.CustomerId",
            7,
            Provenance::Provided,
        )]);
        let mut graph = super::super::relationship::SearchGraph::new();
        let op_node =
            super::super::element::Element::operation(&QualifiedName::operation("demo.Svc", "byRequest"));
        let target =
            super::super::element::Element::provided_instance(&"demo.Customer".into());
        graph.connect(op_node.clone(), target, Relationship::Provides);
        let path = SearchPath {
            edges: graph.outgoing(&op_node).to_vec(),
            cost: 100,
        };
        let outcome = evaluator()
            .evaluate(
                &path,
                TypedInstance::value("demo.CustomerId", 7, Provenance::Provided),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PathOutcome::Resolved(_)));
        assert!(ctx.has_fact(&"demo.Customer".into(), FactLookup::TopLevelOnly));
    }
}
