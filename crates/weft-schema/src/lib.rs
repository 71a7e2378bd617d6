//! Weft schema model
//!
//! This crate defines the *data* half of the engine: an immutable [`Schema`]
//! snapshot (types, fields, inheritance, enum synonyms, services and their
//! operations) plus [`TypedInstance`] — a value tagged with its declared type
//! and the [`Provenance`] describing where it came from.
//!
//! The schema is produced upstream (by a schema compiler, out of scope here)
//! and handed to the query engine read-only. Nothing in this crate performs
//! I/O or holds mutable state.

pub mod instance;
pub mod schema;

pub use instance::{Provenance, TypedInstance};
pub use schema::{
    Constraint, EnumSynonym, EnumValueDef, FieldDef, Formula, FormulaOperator, OperationDef,
    ParameterDef, QualifiedName, Schema, SchemaBuilder, SchemaError, ServiceDef, TypeDef,
};
