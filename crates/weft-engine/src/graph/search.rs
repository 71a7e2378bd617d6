//! Deterministic best-first path discovery.
//!
//! Costs are integral: every edge costs [`BASE_EDGE_COST`], and edges that
//! sat on a previously failed path carry an additional penalty. Penalties
//! dominate the base cost by two orders of magnitude, so a failed route is
//! only re-proposed when no unpenalized alternative exists. Ties between
//! equal-cost frontier entries break on edge insertion sequence, which makes
//! repeated searches over the same graph return identical paths.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use ahash::RandomState;
use tracing::trace;

use super::element::Element;
use super::relationship::{Edge, Relationship, SearchGraph};

pub const BASE_EDGE_COST: u64 = 100;
pub const FAILURE_PENALTY: u64 = 10_000;

/// One proposed route from a known fact to the target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub edges: Vec<Edge>,
    pub cost: u64,
}

impl SearchPath {
    /// Path identity: the insertion sequences of its edges. Two proposals
    /// with the same signature traverse exactly the same edges.
    pub fn signature(&self) -> Vec<u64> {
        self.edges.iter().map(|e| e.sequence).collect()
    }

    pub fn description(&self) -> String {
        self.edges
            .iter()
            .map(Edge::description)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Accumulated knowledge about failed evaluations, fed back into edge costs
/// so subsequent searches route around known-bad transitions.
#[derive(Debug, Default, Clone)]
pub struct PathPenalties {
    penalized: HashMap<(Element, Element, Relationship), u64, RandomState>,
}

impl PathPenalties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Penalizes the edge whose evaluation failed, and lightly penalizes the
    /// rest of the path so near-identical variations sink too.
    pub fn record_failure(&mut self, path: &SearchPath, failed_index: usize) {
        for (index, edge) in path.edges.iter().enumerate() {
            let amount = if index == failed_index {
                FAILURE_PENALTY
            } else {
                BASE_EDGE_COST
            };
            *self.penalized.entry(edge.connection()).or_insert(0) += amount;
        }
    }

    pub fn penalty(&self, edge: &Edge) -> u64 {
        self.penalized
            .get(&edge.connection())
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.penalized.is_empty()
    }
}

struct Arena {
    // (incoming edge, parent arena index); None for start nodes.
    nodes: Vec<(Option<Edge>, Option<usize>)>,
}

impl Arena {
    fn path_to(&self, mut index: usize) -> Vec<Edge> {
        let mut edges = Vec::new();
        loop {
            let (edge, parent) = &self.nodes[index];
            if let Some(edge) = edge {
                edges.push(edge.clone());
            }
            match parent {
                Some(parent) => index = *parent,
                None => break,
            }
        }
        edges.reverse();
        edges
    }
}

/// Single-shot searcher from one start element towards a target element.
pub struct GraphSearcher {
    graph: Arc<SearchGraph>,
    start: Element,
    target: Element,
}

impl GraphSearcher {
    pub fn new(graph: Arc<SearchGraph>, start: Element, target: Element) -> Self {
        Self {
            graph,
            start,
            target,
        }
    }

    pub fn start(&self) -> &Element {
        &self.start
    }

    /// Finds the cheapest path under the given penalties, or `None` when the
    /// target is unreachable from the start.
    pub fn find_path(&self, penalties: &PathPenalties) -> Option<SearchPath> {
        if !self.graph.contains(&self.start) || !self.graph.contains(&self.target) {
            return None;
        }

        let mut arena = Arena {
            nodes: vec![(None, None)],
        };
        let mut visited: HashSet<Element, RandomState> = HashSet::default();
        // (cost, tie-break sequence, arena index, element)
        let mut frontier: BinaryHeap<Reverse<(u64, u64, usize)>> = BinaryHeap::new();
        let mut elements: Vec<Element> = vec![self.start.clone()];
        frontier.push(Reverse((0, 0, 0)));

        while let Some(Reverse((cost, _, index))) = frontier.pop() {
            let element = elements[index].clone();
            if element == self.target {
                let edges = arena.path_to(index);
                trace!(
                    cost,
                    hops = edges.len(),
                    target = %self.target,
                    "path found"
                );
                return Some(SearchPath { edges, cost });
            }
            if !visited.insert(element.clone()) {
                continue;
            }
            for edge in self.graph.outgoing(&element) {
                if visited.contains(&edge.target) {
                    continue;
                }
                let next_cost = cost + BASE_EDGE_COST + penalties.penalty(edge);
                arena.nodes.push((Some(edge.clone()), Some(index)));
                elements.push(edge.target.clone());
                frontier.push(Reverse((next_cost, edge.sequence, arena.nodes.len() - 1)));
            }
        }
        None
    }
}
