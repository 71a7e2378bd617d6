//! Weft query engine
//!
//! The engine behind the data fabric: callers ask for a *type*, not an
//! endpoint. Given a [`weft_schema::Schema`] and a bag of known facts, the
//! engine discovers and executes the sequence of local derivations and remote
//! operation invocations that produces a value of the requested type.
//!
//! ## Architecture
//!
//! - `graph` — the searchable type/operation graph: element identities,
//!   relationship edges, the per-query graph builder, the best-first
//!   discovery search and the edge evaluators that give edges runtime
//!   semantics.
//! - `facts` / `context` — the append-only copy-on-write [`FactBag`] and the
//!   per-query [`QueryContext`] (cancellation, exclusions, nesting).
//! - `strategy` — the ordered resolution pipeline: direct fact lookup, local
//!   calculation, direct invocation, query-operation invocation, then full
//!   graph discovery.
//! - `invocation` — the pluggable [`OperationInvoker`] SPI and the decorator
//!   chain (policy, lineage, caching) around dispatch.
//! - `projection` — the [`ProjectionProvider`] SPI with an in-process
//!   default that fans out per collection item on isolated fact branches.
//! - `engine` — the public [`DefaultQueryEngine`] composing all of the above.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod facts;
pub mod graph;
pub mod invocation;
pub mod projection;
pub mod strategy;
pub(crate) mod util;

pub use config::EngineConfig;
pub use context::{NestedFactResolver, NullResolver, QueryContext};
pub use engine::{
    DefaultQueryEngine, QueryEngineBuilder, QueryMode, QueryResult, QuerySpec, StrategyAttempt,
};
pub use error::InvocationError;
pub use facts::{FactBag, FactLookup};
pub use invocation::{
    InstanceStream, InvocationService, OperationInvoker, OperationPolicy, PolicyDecision,
};
pub use projection::{LocalProjectionProvider, ProjectionProvider};
pub use strategy::{InvocationConstraints, QueryStrategy, StrategyResult};
