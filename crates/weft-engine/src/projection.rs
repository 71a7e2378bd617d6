//! Projection: reshaping resolved values into a requested type.
//!
//! Projecting a collection fans out one discovery per item, each on an
//! isolated fact branch seeded with just that item, so items never
//! contaminate each other's resolution. Fan-out is concurrent but bounded,
//! and item order is preserved.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;
use weft_schema::{Provenance, QualifiedName, TypedInstance};

use crate::context::QueryContext;
use crate::error::InvocationError;
use crate::facts::FactLookup;

#[async_trait]
pub trait ProjectionProvider: Send + Sync {
    async fn project(
        &self,
        source: TypedInstance,
        target: &QualifiedName,
        context: &QueryContext,
    ) -> Result<TypedInstance, InvocationError>;
}

/// In-process projection: builds the target shape field by field from the
/// source item's facts, falling back to nested discovery per field.
pub struct LocalProjectionProvider {
    concurrency: usize,
}

impl LocalProjectionProvider {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    async fn project_item(
        &self,
        item: TypedInstance,
        target: &QualifiedName,
        parent: &QueryContext,
    ) -> Result<TypedInstance, InvocationError> {
        let scoped = parent.only(item);
        let ty = scoped.schema().type_named(target)?.clone();

        if ty.is_scalar() {
            if let Some(found) = scoped.get_fact(target, FactLookup::TopLevelOnly) {
                return Ok(found);
            }
            if let Some(found) = scoped.discover_nested(target).await? {
                return Ok(found);
            }
            return Ok(TypedInstance::null(
                target.clone(),
                Provenance::FailedSearch {
                    message: format!("no value of {target} discoverable from item"),
                },
            ));
        }

        let mut fields = BTreeMap::new();
        for (name, field) in &ty.attributes {
            let value = match scoped
                .get_fact(&field.type_name, FactLookup::TopLevelOnly)
                .or_else(|| {
                    scoped.get_fact(&field.type_name, FactLookup::AnyDepthExpectOneDistinct)
                }) {
                Some(found) => found,
                None => match scoped.discover_nested(&field.type_name).await? {
                    Some(found) => found,
                    None => TypedInstance::null(
                        field.type_name.clone(),
                        Provenance::FailedSearch {
                            message: format!("could not populate '{name}'"),
                        },
                    ),
                },
            };
            fields.insert(name.clone(), value);
        }
        Ok(TypedInstance::object(
            target.clone(),
            fields,
            Provenance::Calculated,
        ))
    }
}

#[async_trait]
impl ProjectionProvider for LocalProjectionProvider {
    async fn project(
        &self,
        source: TypedInstance,
        target: &QualifiedName,
        context: &QueryContext,
    ) -> Result<TypedInstance, InvocationError> {
        context.check_cancelled()?;
        match source {
            TypedInstance::Collection {
                items, source: src, ..
            } => {
                debug!(%target, items = items.len(), "projecting collection");
                let projected: Vec<TypedInstance> = stream::iter(items)
                    .map(|item| self.project_item(item, target, context))
                    .buffered(self.concurrency)
                    .try_collect()
                    .await?;
                Ok(TypedInstance::collection(target.clone(), projected, src))
            }
            single => self.project_item(single, target, context).await,
        }
    }
}
