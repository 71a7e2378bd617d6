//! Resolution from facts already in hand. Never invokes anything.

use async_trait::async_trait;
use tracing::debug;
use weft_schema::TypedInstance;

use super::{filter_matches, InvocationConstraints, QueryStrategy, StrategyResult};
use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;
use crate::facts::FactLookup;

pub struct FactScanStrategy;

#[async_trait]
impl QueryStrategy for FactScanStrategy {
    fn name(&self) -> &'static str {
        "fact-scan"
    }

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError> {
        context.check_cancelled()?;
        let candidates: Vec<TypedInstance> = match mode {
            QueryMode::Discover => context
                .get_fact(&target.target, FactLookup::TopLevelOnly)
                .into_iter()
                .collect(),
            QueryMode::Gather => context.facts().all_facts_of_type(&target.target),
        };

        let matches: Vec<TypedInstance> = candidates
            .into_iter()
            .filter_map(|fact| filter_matches(fact, &target.constraints))
            .collect();

        if matches.is_empty() {
            Ok(StrategyResult::NotFound)
        } else {
            debug!(target = %target.target, count = matches.len(), "resolved from facts");
            Ok(StrategyResult::Resolved(matches))
        }
    }
}
