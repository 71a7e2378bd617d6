//! Per-query graph construction.
//!
//! The builder makes every feasible transformation and invocation path
//! explicit as edges:
//!
//! - types: `EXTENDS_TYPE` to supertypes, `HAS_ATTRIBUTE`/`IS_ATTRIBUTE_OF`
//!   between a type and its member nodes, member `IS_TYPE_OF` its declared
//!   type, enum values `IS_SYNONYM_OF` each other (both directions);
//! - operations: `REQUIRES_PARAMETER`/`IS_PARAMETER_ON` through parameter
//!   connector nodes, attribute back-links for constructible parameter
//!   types, and `PROVIDES` into the provided-instance scaffold of the return
//!   type;
//! - known facts: provided-instance nodes wired with `IS_INSTANCE_OF`,
//!   `CAN_POPULATE` (covering inherited and structurally compatible types)
//!   and `INSTANCE_HAS_ATTRIBUTE` for their populated members.
//!
//! Graphs are cached: the schema-only base graph keyed by the excluded
//! operations, the fact overlay keyed by (fact types, excluded operations)
//! on top of it. Both caches are explicit, size-bounded and owned by this
//! builder.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;
use weft_schema::{QualifiedName, Schema, SchemaError};

use super::element::Element;
use super::relationship::{Relationship, SearchGraph};
use crate::config::EngineConfig;
use crate::util::BoundedCache;

type OverlayKey = (BTreeSet<QualifiedName>, BTreeSet<QualifiedName>);

pub struct GraphBuilder {
    schema: Arc<Schema>,
    base_cache: BoundedCache<BTreeSet<QualifiedName>, Arc<SearchGraph>>,
    overlay_cache: BoundedCache<OverlayKey, Arc<SearchGraph>>,
}

impl GraphBuilder {
    pub fn new(schema: Arc<Schema>, config: &EngineConfig) -> Self {
        Self {
            schema,
            base_cache: BoundedCache::new(config.graph_cache_size),
            overlay_cache: BoundedCache::new(config.graph_cache_size),
        }
    }

    /// Builds the search graph for the given known fact types, excluding the
    /// named operations entirely.
    pub fn build(
        &self,
        fact_types: &BTreeSet<QualifiedName>,
        excluded_operations: &BTreeSet<QualifiedName>,
    ) -> Result<Arc<SearchGraph>, SchemaError> {
        let overlay_key = (fact_types.clone(), excluded_operations.clone());
        if let Some(graph) = self.overlay_cache.get(&overlay_key) {
            return Ok(graph);
        }

        let base = self.base_graph(excluded_operations)?;
        let mut graph = (*base).clone();
        for fact_type in fact_types {
            self.append_provided_instance(&mut graph, fact_type, None)?;
        }
        trace!(
            edges = graph.edge_count(),
            facts = fact_types.len(),
            "built search graph"
        );
        let graph = Arc::new(graph);
        self.overlay_cache.insert(overlay_key, Arc::clone(&graph));
        Ok(graph)
    }

    fn base_graph(
        &self,
        excluded_operations: &BTreeSet<QualifiedName>,
    ) -> Result<Arc<SearchGraph>, SchemaError> {
        if let Some(graph) = self.base_cache.get(excluded_operations) {
            return Ok(graph);
        }
        let mut graph = SearchGraph::new();
        self.append_types(&mut graph)?;
        self.append_services(&mut graph, excluded_operations)?;
        let graph = Arc::new(graph);
        self.base_cache
            .insert(excluded_operations.clone(), Arc::clone(&graph));
        Ok(graph)
    }

    fn append_types(&self, graph: &mut SearchGraph) -> Result<(), SchemaError> {
        for ty in self.schema.types() {
            let type_node = Element::type_node(&ty.name);

            for parent in &ty.inherits {
                self.schema.type_named(parent)?;
                graph.connect(
                    type_node.clone(),
                    Element::type_node(parent),
                    Relationship::ExtendsType,
                );
            }

            if !ty.closed {
                for (attribute, field) in &ty.attributes {
                    self.schema.type_named(&field.type_name)?;
                    let member = Element::member(&ty.name, attribute);
                    graph.connect(
                        type_node.clone(),
                        member.clone(),
                        Relationship::HasAttribute,
                    );
                    graph.connect(
                        member.clone(),
                        type_node.clone(),
                        Relationship::IsAttributeOf,
                    );
                    graph.connect(
                        member,
                        Element::type_node(&field.type_name),
                        Relationship::IsTypeOf,
                    );
                }
            }

            for enum_value in &ty.enum_values {
                for synonym in &enum_value.synonyms {
                    self.schema.type_named(&synonym.enum_type)?;
                    let other = Element::type_node(&synonym.enum_type);
                    graph.connect(
                        type_node.clone(),
                        other.clone(),
                        Relationship::IsSynonymOf,
                    );
                    graph.connect(other, type_node.clone(), Relationship::IsSynonymOf);
                }
            }
        }
        Ok(())
    }

    fn append_services(
        &self,
        graph: &mut SearchGraph,
        excluded_operations: &BTreeSet<QualifiedName>,
    ) -> Result<(), SchemaError> {
        for (_, operation) in self.schema.operations() {
            if excluded_operations.contains(&operation.qualified_name) {
                continue;
            }
            let operation_node = Element::operation(&operation.qualified_name);

            for parameter in &operation.parameters {
                let param_type = self.schema.type_named(&parameter.type_name)?;
                let param_node = Element::parameter(&parameter.type_name);
                graph.connect(
                    operation_node.clone(),
                    param_node.clone(),
                    Relationship::RequiresParameter,
                );
                graph.connect(
                    param_node.clone(),
                    operation_node.clone(),
                    Relationship::IsParameterOn,
                );

                if param_type.parameter_type {
                    // Constructible request objects: anything that can
                    // populate one of their fields links back to the
                    // parameter node, so discovered values can feed new
                    // instances.
                    for field in param_type.attributes.values() {
                        self.schema.type_named(&field.type_name)?;
                        graph.connect(
                            Element::parameter(&field.type_name),
                            param_node.clone(),
                            Relationship::IsParameterOn,
                        );
                    }
                }
            }

            self.append_provided_instance(
                graph,
                &operation.return_type,
                Some(&operation_node),
            )?;
        }
        Ok(())
    }

    /// Wires the provided-instance scaffold for a value of `type_name` —
    /// either one we already hold (`provider` is `None`) or one an operation
    /// will return.
    fn append_provided_instance(
        &self,
        graph: &mut SearchGraph,
        type_name: &QualifiedName,
        provider: Option<&Element>,
    ) -> Result<(), SchemaError> {
        let ty = self.schema.type_named(type_name)?;
        let instance = Element::provided_instance(type_name);

        if let Some(provider) = provider {
            graph.connect(provider.clone(), instance.clone(), Relationship::Provides);
        }

        graph.connect(
            instance.clone(),
            Element::type_node(type_name),
            Relationship::IsInstanceOf,
        );
        graph.connect(
            instance.clone(),
            Element::parameter(type_name),
            Relationship::CanPopulate,
        );

        // The instance can stand in for anything it inherits from, and for
        // structurally compatible parameter slots across type names.
        for inherited in self.schema.inheritance_closure(type_name)? {
            if &inherited != type_name {
                graph.connect(
                    instance.clone(),
                    Element::parameter(&inherited),
                    Relationship::CanPopulate,
                );
            }
        }
        if !ty.is_scalar() {
            for other in self.schema.types() {
                if other.name != *type_name
                    && !other.is_scalar()
                    && self.schema.structurally_compatible(type_name, &other.name)?
                {
                    graph.connect(
                        instance.clone(),
                        Element::parameter(&other.name),
                        Relationship::CanPopulate,
                    );
                }
            }
        }

        if !ty.closed {
            for (attribute, field) in &ty.attributes {
                self.schema.type_named(&field.type_name)?;
                let member = Element::provided_instance_member(type_name, attribute);
                graph.connect(
                    instance.clone(),
                    member.clone(),
                    Relationship::InstanceHasAttribute,
                );
                let member_instance = Element::provided_instance(&field.type_name);
                graph.connect(
                    member.clone(),
                    member_instance.clone(),
                    Relationship::IsAttributeOf,
                );
                graph.connect(
                    member_instance.clone(),
                    Element::parameter(&field.type_name),
                    Relationship::CanPopulate,
                );
                graph.connect(
                    member_instance,
                    Element::type_node(&field.type_name),
                    Relationship::IsInstanceOf,
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_schema::{ParameterDef, TypeDef};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.Email"))
                .with_type(
                    TypeDef::scalar("demo.Customer")
                        .with_attribute("id", "demo.CustomerId")
                        .with_attribute("email", "demo.Email"),
                )
                .with_operation(
                    "demo.Svc",
                    "findCustomer",
                    vec![ParameterDef {
                        name: "id".into(),
                        type_name: "demo.CustomerId".into(),
                    }],
                    "demo.Customer",
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn operations_provide_their_return_type_scaffold() {
        let builder = GraphBuilder::new(schema(), &EngineConfig::default());
        let graph = builder
            .build(&BTreeSet::new(), &BTreeSet::new())
            .unwrap();
        let op = Element::operation(&QualifiedName::operation("demo.Svc", "findCustomer"));
        let provides: Vec<_> = graph
            .outgoing(&op)
            .iter()
            .filter(|e| e.relationship == Relationship::Provides)
            .collect();
        assert_eq!(provides.len(), 1);
        assert_eq!(
            provides[0].target,
            Element::provided_instance(&"demo.Customer".into())
        );
    }

    #[test]
    fn excluded_operations_leave_no_trace() {
        let builder = GraphBuilder::new(schema(), &EngineConfig::default());
        let excluded: BTreeSet<QualifiedName> =
            [QualifiedName::operation("demo.Svc", "findCustomer")].into();
        let graph = builder.build(&BTreeSet::new(), &excluded).unwrap();
        let op = Element::operation(&QualifiedName::operation("demo.Svc", "findCustomer"));
        assert!(graph.outgoing(&op).is_empty());
    }

    #[test]
    fn fact_instances_can_populate_matching_parameters() {
        let builder = GraphBuilder::new(schema(), &EngineConfig::default());
        let facts: BTreeSet<QualifiedName> = ["demo.CustomerId".into()].into();
        let graph = builder.build(&facts, &BTreeSet::new()).unwrap();
        let instance = Element::provided_instance(&"demo.CustomerId".into());
        assert!(graph
            .outgoing(&instance)
            .iter()
            .any(|e| e.relationship == Relationship::CanPopulate
                && e.target == Element::parameter(&"demo.CustomerId".into())));
    }

    #[test]
    fn caches_never_alias_distinct_exclusion_sets() {
        let builder = GraphBuilder::new(schema(), &EngineConfig::default());
        let op = QualifiedName::operation("demo.Svc", "findCustomer");
        let excluded: BTreeSet<QualifiedName> = [op.clone()].into();

        let with = builder.build(&BTreeSet::new(), &excluded).unwrap();
        let without = builder.build(&BTreeSet::new(), &BTreeSet::new()).unwrap();

        assert!(!Arc::ptr_eq(&with, &without));
        assert!(with.outgoing(&Element::operation(&op)).is_empty());
        assert!(!without.outgoing(&Element::operation(&op)).is_empty());
    }

    #[test]
    fn rebuilds_are_cache_hits() {
        let builder = GraphBuilder::new(schema(), &EngineConfig::default());
        let facts: BTreeSet<QualifiedName> = ["demo.CustomerId".into()].into();
        let first = builder.build(&facts, &BTreeSet::new()).unwrap();
        let second = builder.build(&facts, &BTreeSet::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
