//! Schema snapshot: types, services, operations.
//!
//! A [`Schema`] is an immutable model of everything the engine can reason
//! about: object types and their fields, inheritance, enum values with
//! declared synonyms, and services exposing operations. It is handed to the
//! engine fully built and never mutated afterwards, so it can be shared
//! freely across concurrent queries behind an `Arc`.
//!
//! Lookups return `Result`: a relationship referencing a type or operation
//! that is absent from the schema is a [`SchemaError`] — corrupt input, not a
//! per-query condition — and propagates fatally.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Name = String;

// ============================================================================
// Errors
// ============================================================================

/// Fatal schema inconsistencies. These indicate corrupt input (an edge or
/// operation referencing something that doesn't exist) and are never
/// downgraded to an unresolved target.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema has no type named '{0}'")]
    UnknownType(QualifiedName),

    #[error("schema has no operation named '{0}'")]
    UnknownOperation(QualifiedName),

    #[error("operation '{operation}' has no parameter at index {index}")]
    UnknownParameter {
        operation: QualifiedName,
        index: usize,
    },
}

// ============================================================================
// Names
// ============================================================================

/// A fully-qualified name, e.g. `demo.Customer` or `demo.CustomerService@@findCustomer`.
///
/// Operations are qualified as `<service>@@<operation>` so that a single
/// string identifies them unambiguously in graph nodes and caches.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct QualifiedName(pub String);

impl QualifiedName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins a service and operation name into the canonical operation id.
    pub fn operation(service: &str, operation: &str) -> Self {
        Self(format!("{service}@@{operation}"))
    }

    /// Splits a canonical operation id back into (service, operation).
    pub fn split_operation(&self) -> Option<(&str, &str)> {
        self.0.split_once("@@")
    }

    /// The trailing segment, used for display.
    pub fn short_name(&self) -> &str {
        self.0
            .rsplit_once("@@")
            .map(|(_, op)| op)
            .or_else(|| self.0.rsplit_once('.').map(|(_, n)| n))
            .unwrap_or(&self.0)
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QualifiedName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for QualifiedName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Types
// ============================================================================

/// A field declared on an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub type_name: QualifiedName,
    #[serde(default)]
    pub nullable: bool,
}

/// A declared enum value, optionally carrying synonym declarations that make
/// it interchangeable with values of other enum types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValueDef {
    pub name: Name,
    #[serde(default)]
    pub synonyms: Vec<EnumSynonym>,
}

/// Declares that an enum value is equivalent to `value` on `enum_type`.
/// Synonyms are symmetric: declaring one direction is enough, the engine
/// resolves both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumSynonym {
    pub enum_type: QualifiedName,
    pub value: Name,
}

/// A deterministic local derivation: a type whose value can be computed from
/// facts of the operand types without any remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub operator: FormulaOperator,
    pub operand_types: Vec<QualifiedName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
}

/// A type in the schema.
///
/// Scalar types have no attributes; object types declare fields. A
/// `parameter_type` is a type the engine is allowed to construct field by
/// field when no instance exists (request objects, typically). A `closed`
/// type is opaque: its attributes are not traversed during graph building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: QualifiedName,
    #[serde(default)]
    pub attributes: BTreeMap<Name, FieldDef>,
    #[serde(default)]
    pub inherits: Vec<QualifiedName>,
    #[serde(default)]
    pub enum_values: Vec<EnumValueDef>,
    #[serde(default)]
    pub metadata: BTreeMap<Name, serde_json::Value>,
    #[serde(default)]
    pub parameter_type: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<Formula>,
}

impl TypeDef {
    pub fn scalar(name: impl Into<QualifiedName>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            inherits: Vec::new(),
            enum_values: Vec::new(),
            metadata: BTreeMap::new(),
            parameter_type: false,
            closed: false,
            formula: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<Name>, ty: impl Into<QualifiedName>) -> Self {
        self.attributes.insert(
            name.into(),
            FieldDef {
                type_name: ty.into(),
                nullable: false,
            },
        );
        self
    }

    pub fn with_inherits(mut self, ty: impl Into<QualifiedName>) -> Self {
        self.inherits.push(ty.into());
        self
    }

    pub fn with_formula(mut self, formula: Formula) -> Self {
        self.formula = Some(formula);
        self
    }

    pub fn as_parameter_type(mut self) -> Self {
        self.parameter_type = true;
        self
    }

    pub fn is_scalar(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn is_enum(&self) -> bool {
        !self.enum_values.is_empty()
    }

    pub fn enum_value(&self, name: &str) -> Option<&EnumValueDef> {
        self.enum_values.iter().find(|v| v.name == name)
    }
}

// ============================================================================
// Services & operations
// ============================================================================

/// A parameter an operation requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: Name,
    pub type_name: QualifiedName,
}

/// A per-field filter attached to a query target, pruned locally or passed
/// through to query-capable operations that support it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Constraint {
    Equals {
        field: Name,
        value: serde_json::Value,
    },
    OneOf {
        field: Name,
        values: Vec<serde_json::Value>,
    },
    Range {
        field: Name,
        min: serde_json::Value,
        max: serde_json::Value,
    },
}

impl Constraint {
    pub fn field(&self) -> &str {
        match self {
            Constraint::Equals { field, .. }
            | Constraint::OneOf { field, .. }
            | Constraint::Range { field, .. } => field,
        }
    }
}

/// An operation exposed by a service.
///
/// `filter_params` declares query-capability: a mapping from a filterable
/// field on the return type to the parameter that carries the filter value.
/// An operation with filter params is a "query operation" (a filterable
/// finder) and is only invoked by the query-operation strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDef {
    /// Canonical id: `<service>@@<name>`.
    pub qualified_name: QualifiedName,
    pub parameters: Vec<ParameterDef>,
    pub return_type: QualifiedName,
    #[serde(default)]
    pub metadata: BTreeMap<Name, serde_json::Value>,
    #[serde(default)]
    pub filter_params: BTreeMap<Name, Name>,
}

impl OperationDef {
    pub fn is_query_operation(&self) -> bool {
        !self.filter_params.is_empty()
    }

    pub fn parameter(&self, index: usize) -> Result<&ParameterDef, SchemaError> {
        self.parameters
            .get(index)
            .ok_or_else(|| SchemaError::UnknownParameter {
                operation: self.qualified_name.clone(),
                index,
            })
    }

    pub fn parameter_named(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// A service: a named owner of operations. Transport details live on the
/// invoker side; the schema only records metadata invokers may inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: QualifiedName,
    pub operations: Vec<OperationDef>,
    #[serde(default)]
    pub metadata: BTreeMap<Name, serde_json::Value>,
}

// ============================================================================
// Schema
// ============================================================================

/// Immutable snapshot of all types and services known to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    types: BTreeMap<QualifiedName, TypeDef>,
    services: BTreeMap<QualifiedName, ServiceDef>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDef> {
        self.services.values()
    }

    /// All operations across all services, in deterministic (service, decl)
    /// order.
    pub fn operations(&self) -> impl Iterator<Item = (&ServiceDef, &OperationDef)> {
        self.services
            .values()
            .flat_map(|svc| svc.operations.iter().map(move |op| (svc, op)))
    }

    pub fn has_type(&self, name: &QualifiedName) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_named(&self, name: &QualifiedName) -> Result<&TypeDef, SchemaError> {
        self.types
            .get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.clone()))
    }

    /// Resolves a canonical operation id to its (service, operation) pair.
    pub fn operation(
        &self,
        name: &QualifiedName,
    ) -> Result<(&ServiceDef, &OperationDef), SchemaError> {
        let (service_name, _) = name
            .split_operation()
            .ok_or_else(|| SchemaError::UnknownOperation(name.clone()))?;
        let service = self
            .services
            .get(&QualifiedName::new(service_name))
            .ok_or_else(|| SchemaError::UnknownOperation(name.clone()))?;
        let operation = service
            .operations
            .iter()
            .find(|op| &op.qualified_name == name)
            .ok_or_else(|| SchemaError::UnknownOperation(name.clone()))?;
        Ok((service, operation))
    }

    /// The type plus every supertype reachable through `inherits`,
    /// deduplicated, nearest first.
    pub fn inheritance_closure(
        &self,
        name: &QualifiedName,
    ) -> Result<Vec<QualifiedName>, SchemaError> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let mut stack = vec![name.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let ty = self.type_named(&current)?;
            ordered.push(current);
            for parent in &ty.inherits {
                stack.push(parent.clone());
            }
        }
        Ok(ordered)
    }

    /// Whether a value of type `from` can be used where `to` is expected:
    /// either the same type, or `to` is a (transitive) supertype of `from`.
    pub fn is_assignable(
        &self,
        from: &QualifiedName,
        to: &QualifiedName,
    ) -> Result<bool, SchemaError> {
        if from == to {
            return Ok(true);
        }
        Ok(self.inheritance_closure(from)?.contains(to))
    }

    /// Structural compatibility, used by CAN_POPULATE edges: a value of
    /// `from` may populate a slot of `to` even across differently-named
    /// types, when assignable or when `to`'s declared fields are a subset of
    /// `from`'s with matching types.
    pub fn structurally_compatible(
        &self,
        from: &QualifiedName,
        to: &QualifiedName,
    ) -> Result<bool, SchemaError> {
        if self.is_assignable(from, to)? {
            return Ok(true);
        }
        let from_ty = self.type_named(from)?;
        let to_ty = self.type_named(to)?;
        if from_ty.is_scalar() || to_ty.is_scalar() {
            return Ok(false);
        }
        Ok(to_ty.attributes.iter().all(|(name, field)| {
            from_ty
                .attributes
                .get(name)
                .is_some_and(|f| f.type_name == field.type_name)
        }))
    }
}

/// Incremental schema construction, mostly for wiring and tests. The built
/// schema is validated so dangling references fail here rather than at query
/// time.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: BTreeMap<QualifiedName, TypeDef>,
    services: BTreeMap<QualifiedName, ServiceDef>,
}

impl SchemaBuilder {
    pub fn with_type(mut self, ty: TypeDef) -> Self {
        self.types.insert(ty.name.clone(), ty);
        self
    }

    pub fn with_service(mut self, service: ServiceDef) -> Self {
        self.services.insert(service.name.clone(), service);
        self
    }

    /// Convenience: a single-operation service named after the operation.
    pub fn with_operation(
        self,
        service: &str,
        name: &str,
        parameters: Vec<ParameterDef>,
        return_type: impl Into<QualifiedName>,
    ) -> Self {
        let qualified_name = QualifiedName::operation(service, name);
        let operation = OperationDef {
            qualified_name,
            parameters,
            return_type: return_type.into(),
            metadata: BTreeMap::new(),
            filter_params: BTreeMap::new(),
        };
        self.with_operation_def(service, operation)
    }

    pub fn with_operation_def(mut self, service: &str, operation: OperationDef) -> Self {
        let service_name = QualifiedName::new(service);
        let entry = self
            .services
            .entry(service_name.clone())
            .or_insert_with(|| ServiceDef {
                name: service_name,
                operations: Vec::new(),
                metadata: BTreeMap::new(),
            });
        entry.operations.push(operation);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let schema = Schema {
            types: self.types,
            services: self.services,
        };
        schema.validate()?;
        Ok(schema)
    }
}

impl Schema {
    fn validate(&self) -> Result<(), SchemaError> {
        for ty in self.types.values() {
            for parent in &ty.inherits {
                self.type_named(parent)?;
            }
            for field in ty.attributes.values() {
                self.type_named(&field.type_name)?;
            }
            for value in &ty.enum_values {
                for synonym in &value.synonyms {
                    let target = self.type_named(&synonym.enum_type)?;
                    if target.enum_value(&synonym.value).is_none() {
                        return Err(SchemaError::UnknownType(QualifiedName::new(format!(
                            "{}::{}",
                            synonym.enum_type, synonym.value
                        ))));
                    }
                }
            }
            if let Some(formula) = &ty.formula {
                for operand in &formula.operand_types {
                    self.type_named(operand)?;
                }
            }
        }
        for (_, operation) in self.operations() {
            self.type_named(&operation.return_type)?;
            for param in &operation.parameters {
                self.type_named(&param.type_name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::builder()
            .with_type(TypeDef::scalar("demo.CustomerId"))
            .with_type(TypeDef::scalar("demo.EmailAddress"))
            .with_type(
                TypeDef::scalar("demo.Customer")
                    .with_attribute("id", "demo.CustomerId")
                    .with_attribute("email", "demo.EmailAddress"),
            )
            .with_operation(
                "demo.CustomerService",
                "findCustomer",
                vec![ParameterDef {
                    name: "id".into(),
                    type_name: "demo.CustomerId".into(),
                }],
                "demo.Customer",
            )
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_operations_by_canonical_name() {
        let schema = sample_schema();
        let name = QualifiedName::operation("demo.CustomerService", "findCustomer");
        let (service, operation) = schema.operation(&name).unwrap();
        assert_eq!(service.name.as_str(), "demo.CustomerService");
        assert_eq!(operation.return_type.as_str(), "demo.Customer");
    }

    #[test]
    fn unknown_type_is_an_error_not_a_skip() {
        let schema = sample_schema();
        let err = schema
            .type_named(&QualifiedName::new("demo.Missing"))
            .unwrap_err();
        assert_eq!(err, SchemaError::UnknownType("demo.Missing".into()));
    }

    #[test]
    fn dangling_field_reference_fails_validation() {
        let result = Schema::builder()
            .with_type(TypeDef::scalar("demo.Broken").with_attribute("x", "demo.Nope"))
            .build();
        assert!(matches!(result, Err(SchemaError::UnknownType(_))));
    }

    #[test]
    fn assignability_follows_inheritance_transitively() {
        let schema = Schema::builder()
            .with_type(TypeDef::scalar("demo.Identifier"))
            .with_type(TypeDef::scalar("demo.EntityId").with_inherits("demo.Identifier"))
            .with_type(TypeDef::scalar("demo.CustomerId").with_inherits("demo.EntityId"))
            .build()
            .unwrap();
        assert!(schema
            .is_assignable(&"demo.CustomerId".into(), &"demo.Identifier".into())
            .unwrap());
        assert!(!schema
            .is_assignable(&"demo.Identifier".into(), &"demo.CustomerId".into())
            .unwrap());
    }

    #[test]
    fn structural_compatibility_crosses_type_names() {
        let schema = Schema::builder()
            .with_type(TypeDef::scalar("demo.Name"))
            .with_type(TypeDef::scalar("demo.Person").with_attribute("name", "demo.Name"))
            .with_type(
                TypeDef::scalar("demo.Contact")
                    .with_attribute("name", "demo.Name")
                    .with_attribute("extra", "demo.Name"),
            )
            .build()
            .unwrap();
        // Contact has everything Person declares.
        assert!(schema
            .structurally_compatible(&"demo.Contact".into(), &"demo.Person".into())
            .unwrap());
        assert!(!schema
            .structurally_compatible(&"demo.Person".into(), &"demo.Contact".into())
            .unwrap());
    }

    #[test]
    fn inheritance_cycles_are_detected() {
        // Built directly to bypass builder validation ordering.
        let mut a = TypeDef::scalar("demo.A");
        a.inherits.push("demo.B".into());
        let mut b = TypeDef::scalar("demo.B");
        b.inherits.push("demo.A".into());
        let schema = Schema::builder().with_type(a).with_type(b).build().unwrap();
        // Closure terminates with the full set rather than spinning.
        let closure = schema.inheritance_closure(&"demo.A".into()).unwrap();
        assert_eq!(closure.len(), 2);
    }
}
