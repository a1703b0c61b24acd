//! Core types and traits for the relmap entity manager.
//!
//! This crate provides the foundational abstractions shared by sessions and
//! executors:
//!
//! - `Value` and `KeyTuple` for column values and primary-key tuples
//! - the metadata registry describing entity shapes and relationships
//! - the backend-neutral `Query` / `Condition` model
//! - `ChangeSet`, the unit of write produced by a flush
//! - the `Executor` trait, the boundary to a persistence backend
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod change_set;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod query;
pub mod row;
pub mod value;

pub use change_set::{ChangeSet, FieldChange, Operation};
pub use error::{
    Error, FieldValidationError, FilterError, QueryError, RelationshipError, Result,
    TransactionError, TransactionErrorKind, ValidationError, WriteError,
};
pub use executor::{Executor, WriteOutcome};
pub use metadata::{
    ColumnDescriptor, DeleteRule, EntityDescriptor, EntityMetadata, FieldDescriptor, FieldKind,
    JoinColumn, MetadataRegistry, PrimaryKeyDescriptor, RelationshipDescriptor, RelationshipKind,
    RelationshipSide,
};
pub use query::{Condition, Direction, Operand, OrderBy, Projection, Query};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::{KeyTuple, Value};
