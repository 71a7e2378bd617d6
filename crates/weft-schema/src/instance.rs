//! Typed instances and provenance.
//!
//! A [`TypedInstance`] is the engine's unit of data: a value tagged with its
//! declared schema type and a [`Provenance`] recording where it came from
//! (provided by the caller, produced by an operation call, derived from a
//! synonym, ...). Instances are immutable once created; "changing" one means
//! building a new instance.
//!
//! Equality deliberately ignores provenance: two facts with the same type and
//! value are the same fact, however they were obtained. This is what makes
//! fact deduplication and cycle detection behave sanely.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::QualifiedName;

// ============================================================================
// Provenance
// ============================================================================

/// Where a value came from. Carried on every instance for lineage/audit and
/// consulted by the search when deciding which facts to trust as inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the caller alongside the query.
    Provided,
    /// A constant declared in the schema itself.
    DefinedInSchema,
    /// Derived locally by evaluating a formula over other facts.
    Calculated,
    /// Expanded from an enum synonym declaration on `from_type`.
    MappedSynonym { from_type: QualifiedName },
    /// Returned by invoking an operation with the given arguments.
    OperationResult {
        operation: QualifiedName,
        arguments: Vec<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    /// A search that produced nothing; carried on null placeholders so the
    /// failure is explainable downstream.
    FailedSearch { message: String },
}

impl Provenance {
    pub fn operation_result(
        operation: QualifiedName,
        arguments: Vec<serde_json::Value>,
    ) -> Provenance {
        Provenance::OperationResult {
            operation,
            arguments,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// TypedInstance
// ============================================================================

/// A value tagged with its declared type and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TypedInstance {
    Value {
        type_name: QualifiedName,
        value: serde_json::Value,
        source: Provenance,
    },
    Object {
        type_name: QualifiedName,
        fields: BTreeMap<String, TypedInstance>,
        source: Provenance,
    },
    Collection {
        type_name: QualifiedName,
        items: Vec<TypedInstance>,
        source: Provenance,
    },
    Null {
        type_name: QualifiedName,
        source: Provenance,
    },
}

impl TypedInstance {
    pub fn value(
        type_name: impl Into<QualifiedName>,
        value: impl Into<serde_json::Value>,
        source: Provenance,
    ) -> Self {
        TypedInstance::Value {
            type_name: type_name.into(),
            value: value.into(),
            source,
        }
    }

    pub fn object(
        type_name: impl Into<QualifiedName>,
        fields: BTreeMap<String, TypedInstance>,
        source: Provenance,
    ) -> Self {
        TypedInstance::Object {
            type_name: type_name.into(),
            fields,
            source,
        }
    }

    pub fn collection(
        type_name: impl Into<QualifiedName>,
        items: Vec<TypedInstance>,
        source: Provenance,
    ) -> Self {
        TypedInstance::Collection {
            type_name: type_name.into(),
            items,
            source,
        }
    }

    pub fn null(type_name: impl Into<QualifiedName>, source: Provenance) -> Self {
        TypedInstance::Null {
            type_name: type_name.into(),
            source,
        }
    }

    pub fn type_name(&self) -> &QualifiedName {
        match self {
            TypedInstance::Value { type_name, .. }
            | TypedInstance::Object { type_name, .. }
            | TypedInstance::Collection { type_name, .. }
            | TypedInstance::Null { type_name, .. } => type_name,
        }
    }

    pub fn source(&self) -> &Provenance {
        match self {
            TypedInstance::Value { source, .. }
            | TypedInstance::Object { source, .. }
            | TypedInstance::Collection { source, .. }
            | TypedInstance::Null { source, .. } => source,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypedInstance::Null { .. })
    }

    /// Null, or an empty-string scalar. Empty strings from upstream providers
    /// are treated as unpopulated when resolving operation parameters.
    pub fn is_populated(&self) -> bool {
        match self {
            TypedInstance::Null { .. } => false,
            TypedInstance::Value { value, .. } => value.as_str() != Some(""),
            _ => true,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&TypedInstance> {
        match self {
            TypedInstance::Object { fields, .. } => fields.get(name),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[TypedInstance]> {
        match self {
            TypedInstance::Collection { items, .. } => Some(items),
            _ => None,
        }
    }

    /// The raw JSON shape of the value, without type tags. Used when
    /// rendering invocation arguments for provenance.
    pub fn to_raw(&self) -> serde_json::Value {
        match self {
            TypedInstance::Value { value, .. } => value.clone(),
            TypedInstance::Object { fields, .. } => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_raw()))
                    .collect(),
            ),
            TypedInstance::Collection { items, .. } => {
                serde_json::Value::Array(items.iter().map(|i| i.to_raw()).collect())
            }
            TypedInstance::Null { .. } => serde_json::Value::Null,
        }
    }

    /// Rebuilds this instance with a different provenance.
    pub fn with_source(self, source: Provenance) -> TypedInstance {
        match self {
            TypedInstance::Value {
                type_name, value, ..
            } => TypedInstance::Value {
                type_name,
                value,
                source,
            },
            TypedInstance::Object {
                type_name, fields, ..
            } => TypedInstance::Object {
                type_name,
                fields,
                source,
            },
            TypedInstance::Collection {
                type_name, items, ..
            } => TypedInstance::Collection {
                type_name,
                items,
                source,
            },
            TypedInstance::Null { type_name, .. } => TypedInstance::Null { type_name, source },
        }
    }
}

/// Equality ignores provenance; see the module docs.
impl PartialEq for TypedInstance {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                TypedInstance::Value {
                    type_name: t1,
                    value: v1,
                    ..
                },
                TypedInstance::Value {
                    type_name: t2,
                    value: v2,
                    ..
                },
            ) => t1 == t2 && v1 == v2,
            (
                TypedInstance::Object {
                    type_name: t1,
                    fields: f1,
                    ..
                },
                TypedInstance::Object {
                    type_name: t2,
                    fields: f2,
                    ..
                },
            ) => t1 == t2 && f1 == f2,
            (
                TypedInstance::Collection {
                    type_name: t1,
                    items: i1,
                    ..
                },
                TypedInstance::Collection {
                    type_name: t2,
                    items: i2,
                    ..
                },
            ) => t1 == t2 && i1 == i2,
            (
                TypedInstance::Null { type_name: t1, .. },
                TypedInstance::Null { type_name: t2, .. },
            ) => t1 == t2,
            _ => false,
        }
    }
}

impl Eq for TypedInstance {}
