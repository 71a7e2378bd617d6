//! Engine configuration.
//!
//! All caches and limits are owned by the engine instance and injected at
//! construction; there is no ambient static state. Deserializable so hosts
//! can load it from their own config surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on the graph builder's base-schema and fact-overlay caches.
    pub graph_cache_size: usize,
    /// How many distinct paths a single discovery search may propose before
    /// giving up. Guards against searching forever on adversarial schemas.
    pub max_search_attempts: usize,
    /// Recursion bound for nested sub-queries (parameter resolution,
    /// parameter-object construction).
    pub max_query_depth: usize,
    /// Bound on the (start type, target) exclusion cache that remembers
    /// searches which yielded no path at all. Zero disables it.
    pub search_exclusion_cache_size: usize,
    /// Bound on the invocation-result cache decorator. Zero disables it.
    pub invocation_cache_size: usize,
    /// Concurrency bound for per-item projection fan-out.
    pub projection_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_cache_size: 100,
            max_search_attempts: 25,
            max_query_depth: 10,
            search_exclusion_cache_size: 1024,
            invocation_cache_size: 1024,
            projection_concurrency: 8,
        }
    }
}
