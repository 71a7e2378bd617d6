//! Relationships, edges and the adjacency structure.
//!
//! Edge insertion order is load-bearing: the builder appends edges in a fixed
//! traversal order, each edge gets a monotonically increasing sequence
//! number, and the search breaks cost ties on that sequence. For a fixed
//! schema and fact set the whole pipeline is therefore deterministic.

use std::collections::HashMap;

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use super::element::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    IsTypeOf,
    HasAttribute,
    IsAttributeOf,
    IsInstanceOf,
    InstanceHasAttribute,
    ExtendsType,
    IsSynonymOf,
    IsParameterOn,
    RequiresParameter,
    CanPopulate,
    Provides,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Relationship::IsTypeOf => "Is type of",
            Relationship::HasAttribute => "Has attribute",
            Relationship::IsAttributeOf => "Is an attribute of",
            Relationship::IsInstanceOf => "Is instance of",
            Relationship::InstanceHasAttribute => "Instance has attribute",
            Relationship::ExtendsType => "Extends",
            Relationship::IsSynonymOf => "Is synonym of",
            Relationship::IsParameterOn => "Is parameter on",
            Relationship::RequiresParameter => "Requires parameter",
            Relationship::CanPopulate => "Can populate",
            Relationship::Provides => "Provides",
        };
        f.write_str(label)
    }
}

/// A directed, typed connection between two elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: Element,
    pub target: Element,
    pub relationship: Relationship,
    /// Insertion sequence; the deterministic tie-breaker.
    pub sequence: u64,
}

impl Edge {
    pub fn description(&self) -> String {
        format!(
            "{} -[{}]-> {}",
            self.source.label(),
            self.relationship,
            self.target.label()
        )
    }

    /// The identity of this connection ignoring its sequence number, used as
    /// the key for penalties and exclusions.
    pub fn connection(&self) -> (Element, Element, Relationship) {
        (self.source.clone(), self.target.clone(), self.relationship)
    }
}

/// Adjacency-listed directed graph, read-only once built.
#[derive(Debug, Default, Clone)]
pub struct SearchGraph {
    adjacency: HashMap<Element, Vec<Edge>, RandomState>,
    next_sequence: u64,
}

impl SearchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, source: Element, target: Element, relationship: Relationship) {
        let edges = self.adjacency.entry(source.clone()).or_default();
        // One edge per (target, relationship) pair; re-declaration keeps the
        // earliest sequence so tie-breaking stays stable.
        if edges
            .iter()
            .any(|e| e.target == target && e.relationship == relationship)
        {
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        edges.push(Edge {
            source,
            target,
            relationship,
            sequence,
        });
    }

    pub fn outgoing(&self, element: &Element) -> &[Edge] {
        self.adjacency
            .get(element)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, element: &Element) -> bool {
        self.adjacency.contains_key(element)
            || self
                .adjacency
                .values()
                .any(|edges| edges.iter().any(|e| &e.target == element))
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Every edge description, for trace logging.
    pub fn edge_descriptions(&self) -> Vec<String> {
        let mut edges: Vec<&Edge> = self.adjacency.values().flatten().collect();
        edges.sort_by_key(|e| e.sequence);
        edges.iter().map(|e| e.description()).collect()
    }
}
