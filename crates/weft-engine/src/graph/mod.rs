//! The searchable type/operation graph.
//!
//! Built fresh per query from the schema plus the types of currently known
//! facts, searched with a deterministic best-first algorithm, and given
//! runtime semantics by the path evaluator as edges are walked.

pub mod builder;
pub mod element;
pub mod evaluators;
pub mod relationship;
pub mod search;

pub use builder::GraphBuilder;
pub use element::{Element, ElementKind};
pub use evaluators::{ParameterResolver, PathEvaluator, PathOutcome};
pub use relationship::{Edge, Relationship, SearchGraph};
pub use search::{GraphSearcher, PathPenalties, SearchPath};
