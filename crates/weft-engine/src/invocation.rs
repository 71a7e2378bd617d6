//! Operation invocation.
//!
//! [`OperationInvoker`] is the transport SPI: hosts register invokers that
//! know how to call their services (HTTP, gRPC, in-process, ...), returning a
//! stream of typed instances. The engine never talks to a transport directly;
//! it dispatches through a decorator chain assembled at engine construction:
//!
//! ```text
//! policy enforcement -> result cache -> lineage stamping -> dispatch
//! ```
//!
//! Policy sits outermost so denials never consult the cache; the cache sits
//! above lineage so replayed results keep the provenance of the original
//! call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, warn};
use weft_schema::{OperationDef, Provenance, QualifiedName, ServiceDef, TypedInstance};

use crate::context::QueryContext;
use crate::error::InvocationError;
use crate::util::BoundedCache;

/// The result shape of an invocation: a stream, so providers returning large
/// collections don't have to materialize them eagerly.
pub type InstanceStream = BoxStream<'static, Result<TypedInstance, InvocationError>>;

/// Transport adapter for a family of services.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Whether this invoker can call the given operation. The first
    /// registered invoker that claims support wins.
    fn supports(&self, service: &ServiceDef, operation: &OperationDef) -> bool;

    async fn invoke(
        &self,
        service: &ServiceDef,
        operation: &OperationDef,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<InstanceStream, InvocationError>;
}

// ============================================================================
// Policy
// ============================================================================

/// The outcome of evaluating an operation call against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    /// Permit the call but blank the named fields on every returned object.
    Transform { redact_fields: Vec<String> },
}

#[async_trait]
pub trait OperationPolicy: Send + Sync {
    async fn evaluate(
        &self,
        service: &ServiceDef,
        operation: &OperationDef,
        arguments: &[TypedInstance],
        context: &QueryContext,
    ) -> PolicyDecision;
}

// ============================================================================
// Dispatch chain
// ============================================================================

/// Internal dispatch surface the engine and edge evaluators call. Each
/// decorator wraps another `InvocationService`; the innermost one talks to
/// the registered invokers.
#[async_trait]
pub trait InvocationService: Send + Sync {
    async fn invoke(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError>;
}

/// Assembles the standard decorator chain.
pub fn invocation_chain(
    invokers: Vec<Arc<dyn OperationInvoker>>,
    policies: Vec<Arc<dyn OperationPolicy>>,
    cache_size: usize,
) -> Arc<dyn InvocationService> {
    let dispatch = Arc::new(DispatchingInvocationService { invokers });
    let lineage = Arc::new(LineageInvocationService { inner: dispatch });
    let cached = Arc::new(CachingInvocationService {
        inner: lineage,
        cache: BoundedCache::new(cache_size),
    });
    Arc::new(PolicyInvocationService {
        inner: cached,
        policies,
    })
}

/// Innermost link: finds the invoker and drains its stream.
pub struct DispatchingInvocationService {
    invokers: Vec<Arc<dyn OperationInvoker>>,
}

#[async_trait]
impl InvocationService for DispatchingInvocationService {
    async fn invoke(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        context.check_cancelled()?;
        let (service, op) = context.schema().operation(operation)?;
        let invoker = self
            .invokers
            .iter()
            .find(|inv| inv.supports(service, op))
            .ok_or_else(|| InvocationError::NoInvoker(operation.clone()))?;

        debug!(%operation, args = arguments.len(), "dispatching");
        let mut stream = invoker.invoke(service, op, arguments, context).await?;
        let mut results = Vec::new();
        while let Some(item) = stream.next().await {
            context.check_cancelled()?;
            results.push(item?);
        }
        Ok(results)
    }
}

/// Stamps every result with `OperationResult` provenance recording the call
/// and its rendered arguments.
pub struct LineageInvocationService {
    inner: Arc<dyn InvocationService>,
}

#[async_trait]
impl InvocationService for LineageInvocationService {
    async fn invoke(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        let rendered: Vec<serde_json::Value> =
            arguments.iter().map(TypedInstance::to_raw).collect();
        let results = self.inner.invoke(operation, arguments, context).await?;
        info!(
            %operation,
            query_id = %context.query_id(),
            results = results.len(),
            "operation invoked"
        );
        Ok(results
            .into_iter()
            .map(|instance| {
                instance.with_source(Provenance::operation_result(
                    operation.clone(),
                    rendered.clone(),
                ))
            })
            .collect())
    }
}

/// Caches successful results keyed by (operation, rendered arguments), so
/// one query never repeats an identical call.
pub struct CachingInvocationService {
    inner: Arc<dyn InvocationService>,
    cache: BoundedCache<(QualifiedName, String), Vec<TypedInstance>>,
}

#[async_trait]
impl InvocationService for CachingInvocationService {
    async fn invoke(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        let rendered = serde_json::Value::Array(
            arguments.iter().map(TypedInstance::to_raw).collect(),
        )
        .to_string();
        let key = (operation.clone(), rendered);
        if let Some(hit) = self.cache.get(&key) {
            debug!(%operation, "invocation cache hit");
            return Ok(hit);
        }
        let results = self.inner.invoke(operation, arguments, context).await?;
        self.cache.insert(key, results.clone());
        Ok(results)
    }
}

/// Evaluates registered policies before the call and applies any redactions
/// after it. A single `Deny` aborts the call.
pub struct PolicyInvocationService {
    inner: Arc<dyn InvocationService>,
    policies: Vec<Arc<dyn OperationPolicy>>,
}

#[async_trait]
impl InvocationService for PolicyInvocationService {
    async fn invoke(
        &self,
        operation: &QualifiedName,
        arguments: Vec<TypedInstance>,
        context: &QueryContext,
    ) -> Result<Vec<TypedInstance>, InvocationError> {
        let (service, op) = context.schema().operation(operation)?;
        let mut redactions: Vec<String> = Vec::new();
        for policy in &self.policies {
            match policy.evaluate(service, op, &arguments, context).await {
                PolicyDecision::Allow => {}
                PolicyDecision::Deny { reason } => {
                    warn!(%operation, %reason, "operation denied by policy");
                    return Err(InvocationError::PolicyDenied {
                        operation: operation.clone(),
                        reason,
                    });
                }
                PolicyDecision::Transform { redact_fields } => {
                    redactions.extend(redact_fields);
                }
            }
        }

        let results = self.inner.invoke(operation, arguments, context).await?;
        if redactions.is_empty() {
            return Ok(results);
        }
        Ok(results
            .into_iter()
            .map(|instance| redact(instance, &redactions))
            .collect())
    }
}

fn redact(instance: TypedInstance, fields: &[String]) -> TypedInstance {
    match instance {
        TypedInstance::Object {
            type_name,
            fields: mut attrs,
            source,
        } => {
            for name in fields {
                if let Some(existing) = attrs.get(name) {
                    let blanked = TypedInstance::null(
                        existing.type_name().clone(),
                        existing.source().clone(),
                    );
                    attrs.insert(name.clone(), blanked);
                }
            }
            TypedInstance::Object {
                type_name,
                fields: attrs,
                source,
            }
        }
        TypedInstance::Collection {
            type_name,
            items,
            source,
        } => TypedInstance::Collection {
            type_name,
            items: items
                .into_iter()
                .map(|item| redact(item, fields))
                .collect(),
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_schema::{ParameterDef, Provenance, Schema, TypeDef};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .with_type(TypeDef::scalar("demo.CustomerId"))
                .with_type(TypeDef::scalar("demo.Email"))
                .with_type(
                    TypeDef::scalar("demo.Customer")
                        .with_attribute("id", "demo.CustomerId")
                        .with_attribute("email", "demo.Email"),
                )
                .with_operation(
                    "demo.Svc",
                    "find",
                    vec![ParameterDef {
                        name: "id".into(),
                        type_name: "demo.CustomerId".into(),
                    }],
                    "demo.Customer",
                )
                .build()
                .unwrap(),
        )
    }

    struct CountingInvoker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OperationInvoker for CountingInvoker {
        fn supports(&self, _service: &ServiceDef, _operation: &OperationDef) -> bool {
            true
        }

        async fn invoke(
            &self,
            _service: &ServiceDef,
            operation: &OperationDef,
            _arguments: Vec<TypedInstance>,
            _context: &QueryContext,
        ) -> Result<InstanceStream, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut fields = std::collections::BTreeMap::new();
            fields.insert(
                "id".to_string(),
                TypedInstance::value("demo.CustomerId", 1, Provenance::Provided),
            );
            fields.insert(
                "email".to_string(),
                TypedInstance::value("demo.Email", "a@b.c", Provenance::Provided),
            );
            let result = TypedInstance::object(
                operation.return_type.clone(),
                fields,
                Provenance::Provided,
            );
            Ok(stream::iter(vec![Ok(result)]).boxed())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl OperationPolicy for DenyAll {
        async fn evaluate(
            &self,
            _service: &ServiceDef,
            _operation: &OperationDef,
            _arguments: &[TypedInstance],
            _context: &QueryContext,
        ) -> PolicyDecision {
            PolicyDecision::Deny {
                reason: "not allowed".into(),
            }
        }
    }

    struct RedactEmail;

    #[async_trait]
    impl OperationPolicy for RedactEmail {
        async fn evaluate(
            &self,
            _service: &ServiceDef,
            _operation: &OperationDef,
            _arguments: &[TypedInstance],
            _context: &QueryContext,
        ) -> PolicyDecision {
            PolicyDecision::Transform {
                redact_fields: vec!["email".into()],
            }
        }
    }

    fn ctx() -> QueryContext {
        QueryContext::standalone(schema(), [], &EngineConfig::default())
    }

    fn op() -> QualifiedName {
        QualifiedName::operation("demo.Svc", "find")
    }

    fn arg() -> TypedInstance {
        TypedInstance::value("demo.CustomerId", 1, Provenance::Provided)
    }

    #[tokio::test]
    async fn identical_calls_hit_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = invocation_chain(
            vec![Arc::new(CountingInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![],
            16,
        );
        let ctx = ctx();
        chain.invoke(&op(), vec![arg()], &ctx).await.unwrap();
        chain.invoke(&op(), vec![arg()], &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn results_carry_operation_provenance() {
        let chain = invocation_chain(
            vec![Arc::new(CountingInvoker {
                calls: Arc::new(AtomicUsize::new(0)),
            })],
            vec![],
            0,
        );
        let results = chain.invoke(&op(), vec![arg()], &ctx()).await.unwrap();
        match results[0].source() {
            Provenance::OperationResult {
                operation,
                arguments,
                ..
            } => {
                assert_eq!(operation, &op());
                assert_eq!(arguments, &vec![serde_json::json!(1)]);
            }
            other => panic!("unexpected provenance: {other:?}"),
        }
    }

    #[tokio::test]
    async fn denied_calls_never_reach_the_invoker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = invocation_chain(
            vec![Arc::new(CountingInvoker {
                calls: Arc::clone(&calls),
            })],
            vec![Arc::new(DenyAll)],
            16,
        );
        let err = chain.invoke(&op(), vec![arg()], &ctx()).await.unwrap_err();
        assert!(matches!(err, InvocationError::PolicyDenied { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transform_policies_blank_named_fields() {
        let chain = invocation_chain(
            vec![Arc::new(CountingInvoker {
                calls: Arc::new(AtomicUsize::new(0)),
            })],
            vec![Arc::new(RedactEmail)],
            0,
        );
        let results = chain.invoke(&op(), vec![arg()], &ctx()).await.unwrap();
        let email = results[0].attribute("email").unwrap();
        assert!(email.is_null());
        assert!(results[0].attribute("id").unwrap().is_populated());
    }

    #[tokio::test]
    async fn cancelled_contexts_refuse_to_dispatch() {
        let chain = invocation_chain(
            vec![Arc::new(CountingInvoker {
                calls: Arc::new(AtomicUsize::new(0)),
            })],
            vec![],
            0,
        );
        let ctx = ctx();
        ctx.cancel();
        let err = chain.invoke(&op(), vec![arg()], &ctx).await.unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled));
    }
}
