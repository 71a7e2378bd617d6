//! Local derivation via declared formulas.
//!
//! A type carrying a formula can be computed from facts of its operand types
//! without any remote call. Numeric operators work on JSON numbers; `Concat`
//! works on strings. A missing operand or a type mismatch means "not found",
//! never an error.

use async_trait::async_trait;
use tracing::debug;
use weft_schema::{FormulaOperator, Provenance, TypedInstance};

use super::{InvocationConstraints, QueryStrategy, StrategyResult};
use crate::context::QueryContext;
use crate::engine::QueryMode;
use crate::error::InvocationError;
use crate::facts::FactLookup;

pub struct CalculatedFieldStrategy;

#[async_trait]
impl QueryStrategy for CalculatedFieldStrategy {
    fn name(&self) -> &'static str {
        "calculated"
    }

    async fn find(
        &self,
        target: &InvocationConstraints,
        context: &QueryContext,
        _mode: QueryMode,
    ) -> Result<StrategyResult, InvocationError> {
        context.check_cancelled()?;
        let ty = context.schema().type_named(&target.target)?;
        let Some(formula) = &ty.formula else {
            return Ok(StrategyResult::NotFound);
        };

        let mut operands = Vec::with_capacity(formula.operand_types.len());
        for operand_type in &formula.operand_types {
            let fact = context
                .get_fact(operand_type, FactLookup::TopLevelOnly)
                .or_else(|| {
                    context.get_fact(operand_type, FactLookup::AnyDepthExpectOneDistinct)
                });
            match fact {
                Some(fact) => operands.push(fact.to_raw()),
                None => return Ok(StrategyResult::NotFound),
            }
        }

        let Some(value) = apply(formula.operator, &operands) else {
            return Ok(StrategyResult::NotFound);
        };
        debug!(target = %target.target, "derived via formula");
        let instance = TypedInstance::value(target.target.clone(), value, Provenance::Calculated);
        context.add_fact(instance.clone());
        Ok(StrategyResult::Resolved(vec![instance]))
    }
}

fn apply(operator: FormulaOperator, operands: &[serde_json::Value]) -> Option<serde_json::Value> {
    if operands.is_empty() {
        return None;
    }
    match operator {
        FormulaOperator::Concat => {
            let mut out = String::new();
            for operand in operands {
                out.push_str(operand.as_str()?);
            }
            Some(serde_json::Value::String(out))
        }
        numeric => {
            let mut iter = operands.iter();
            let mut acc = iter.next()?.as_f64()?;
            for operand in iter {
                let rhs = operand.as_f64()?;
                acc = match numeric {
                    FormulaOperator::Add => acc + rhs,
                    FormulaOperator::Subtract => acc - rhs,
                    FormulaOperator::Multiply => acc * rhs,
                    FormulaOperator::Divide => {
                        if rhs == 0.0 {
                            return None;
                        }
                        acc / rhs
                    }
                    FormulaOperator::Concat => unreachable!(),
                };
            }
            serde_json::Number::from_f64(acc).map(serde_json::Value::Number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use weft_schema::{Formula, Provenance, Schema, TypeDef};

    fn ctx(facts: Vec<TypedInstance>) -> QueryContext {
        let schema = Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.Quantity"))
                .with_type(TypeDef::scalar("demo.UnitPrice"))
                .with_type(TypeDef::scalar("demo.Total").with_formula(Formula {
                    operator: FormulaOperator::Multiply,
                    operand_types: vec!["demo.Quantity".into(), "demo.UnitPrice".into()],
                }))
                .build()
                .unwrap(),
        );
        QueryContext::standalone(schema, facts, &EngineConfig::default())
    }

    #[tokio::test]
    async fn formulas_compute_from_operand_facts() {
        let ctx = ctx(vec![
            TypedInstance::value("demo.Quantity", 3, Provenance::Provided),
            TypedInstance::value("demo.UnitPrice", 2.5, Provenance::Provided),
        ]);
        let result = CalculatedFieldStrategy
            .find(
                &InvocationConstraints::unconstrained("demo.Total"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        match result {
            StrategyResult::Resolved(matches) => {
                assert_eq!(matches[0].to_raw(), serde_json::json!(7.5));
                assert_eq!(matches[0].source(), &Provenance::Calculated);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The derived value became a fact.
        assert!(ctx.has_fact(&"demo.Total".into(), FactLookup::TopLevelOnly));
    }

    #[tokio::test]
    async fn missing_operands_mean_not_found() {
        let ctx = ctx(vec![TypedInstance::value(
            "demo.Quantity",
            3,
            Provenance::Provided,
        )]);
        let result = CalculatedFieldStrategy
            .find(
                &InvocationConstraints::unconstrained("demo.Total"),
                &ctx,
                QueryMode::Discover,
            )
            .await
            .unwrap();
        assert_eq!(result, StrategyResult::NotFound);
    }

    #[test]
    fn division_by_zero_yields_nothing() {
        assert_eq!(
            apply(
                FormulaOperator::Divide,
                &[serde_json::json!(1), serde_json::json!(0)]
            ),
            None
        );
    }
}
