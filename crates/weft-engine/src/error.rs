//! Engine error taxonomy.
//!
//! Only schema inconsistencies are fatal. Everything else — a failed
//! operation call, an unresolvable parameter, a policy denial — downgrades
//! the *path* that hit it; the target is then reported unresolved in the
//! query result rather than surfaced as an error.

use thiserror::Error;
use weft_schema::{QualifiedName, SchemaError};

/// A specific operation call (or its preparation) failed.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("no invoker registered that supports operation '{0}'")]
    NoInvoker(QualifiedName),

    #[error("operation '{operation}' failed: {message}")]
    Failed {
        operation: QualifiedName,
        message: String,
        arguments: Vec<serde_json::Value>,
    },

    #[error("could not resolve parameters for operation '{operation}': {message}")]
    UnresolvedParameters {
        operation: QualifiedName,
        message: String,
    },

    #[error("operation '{operation}' denied by policy: {reason}")]
    PolicyDenied {
        operation: QualifiedName,
        reason: String,
    },

    #[error("query cancelled")]
    Cancelled,

    /// Fatal; re-raised rather than downgraded wherever it appears.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl InvocationError {
    /// Whether this error must propagate to the caller unmodified instead of
    /// downgrading its path to "failed".
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvocationError::Schema(_))
    }
}
