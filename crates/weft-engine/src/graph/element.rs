//! Graph node identity.
//!
//! An [`Element`] is a value type identifying one node in the search graph:
//! a type, a member (`Type/attribute`), an operation, a parameter connector,
//! or the provided-instance scaffold modelling a value we either hold already
//! or expect an operation to return. Equality is by (discriminator, kind).
//!
//! Parameter and provided-instance-member nodes exist because a pair of
//! vertices can only carry one edge per relationship: `operation -[requires]->
//! Money` and `operation -[provides]-> Money` must not collapse onto the same
//! vertex pair, so parameters get connector nodes of their own.

use serde::{Deserialize, Serialize};
use weft_schema::QualifiedName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Type,
    Member,
    Operation,
    Parameter,
    /// A value we hold, or expect to hold after invoking a provider.
    ProvidedInstance,
    ProvidedInstanceMember,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ElementKind::Type => "Type",
            ElementKind::Member => "Member",
            ElementKind::Operation => "Operation",
            ElementKind::Parameter => "Parameter",
            ElementKind::ProvidedInstance => "Instance",
            ElementKind::ProvidedInstanceMember => "InstanceMember",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Element {
    pub value: String,
    pub kind: ElementKind,
}

impl Element {
    pub fn type_node(name: &QualifiedName) -> Element {
        Element {
            value: name.0.clone(),
            kind: ElementKind::Type,
        }
    }

    /// A member node: `<type>/<attribute>`.
    pub fn member(type_name: &QualifiedName, attribute: &str) -> Element {
        Element {
            value: format!("{type_name}/{attribute}"),
            kind: ElementKind::Member,
        }
    }

    pub fn operation(name: &QualifiedName) -> Element {
        Element {
            value: name.0.clone(),
            kind: ElementKind::Operation,
        }
    }

    pub fn parameter(type_name: &QualifiedName) -> Element {
        Element {
            value: format!("param/{type_name}"),
            kind: ElementKind::Parameter,
        }
    }

    pub fn provided_instance(type_name: &QualifiedName) -> Element {
        Element {
            value: type_name.0.clone(),
            kind: ElementKind::ProvidedInstance,
        }
    }

    pub fn provided_instance_member(type_name: &QualifiedName, attribute: &str) -> Element {
        Element {
            value: format!("{type_name}/{attribute}"),
            kind: ElementKind::ProvidedInstanceMember,
        }
    }

    /// The qualified name this element refers to, with connector prefixes and
    /// member suffixes stripped.
    pub fn qualified_name(&self) -> QualifiedName {
        let raw = match self.kind {
            ElementKind::Parameter => self.value.strip_prefix("param/").unwrap_or(&self.value),
            _ => &self.value,
        };
        QualifiedName::new(raw)
    }

    /// For member nodes, the (type, attribute) pair encoded in the value.
    pub fn member_parts(&self) -> Option<(QualifiedName, &str)> {
        let (ty, attr) = self.value.rsplit_once('/')?;
        Some((QualifiedName::new(ty), attr))
    }

    pub fn label(&self) -> String {
        format!("{}({})", self.kind, self.value)
    }
}

impl std::fmt::Display for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}
