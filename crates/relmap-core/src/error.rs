//! Error types for entity-manager operations.

use crate::change_set::Operation;
use crate::value::KeyTuple;
use std::fmt;

/// The primary error type for all entity-manager operations.
#[derive(Debug)]
pub enum Error {
    /// Metadata lookup for an entity type that was never registered.
    UnknownEntity {
        /// The requested entity type name.
        entity: String,
    },
    /// A lookup by key or criteria returned no row.
    EntityNotFound {
        /// Entity type that was looked up.
        entity: String,
        /// Primary key, when the lookup was by key.
        key: Option<KeyTuple>,
    },
    /// The entity's primary key cannot be resolved yet.
    MissingKey {
        /// Entity type.
        entity: String,
        /// Primary-key columns that have no value.
        columns: Vec<String>,
    },
    /// Use of an instance whose session was cleared or closed, or that
    /// belongs to a different session.
    DetachedEntity {
        /// Entity type of the detached instance.
        entity: String,
    },
    /// Change-set ordering is impossible because entity types depend on
    /// each other in a cycle.
    CyclicDependency {
        /// Entity types involved in the cycle, in traversal order.
        entities: Vec<String>,
    },
    /// An instance with the same identity is already tracked by the session.
    AlreadyTracked {
        /// Entity type.
        entity: String,
        /// Conflicting primary key.
        key: KeyTuple,
    },
    /// Invalid entity descriptor.
    Metadata(String),
    /// Invalid relationship use (unknown field, conflicting shared column...).
    Relationship(RelationshipError),
    /// Filter definition or parameter problem.
    Filter(FilterError),
    /// Field-level validation failures detected before a flush is sent.
    Validation(ValidationError),
    /// The persistence executor rejected a change set.
    Write(WriteError),
    /// Query execution failure reported by the executor.
    Query(QueryError),
    /// Transaction begin/commit/rollback failure reported by the executor.
    Transaction(TransactionError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct RelationshipError {
    pub entity: String,
    pub field: String,
    pub message: String,
}

#[derive(Debug)]
pub struct FilterError {
    pub filter: String,
    pub message: String,
}

#[derive(Debug)]
pub struct WriteError {
    pub entity: String,
    pub key: KeyTuple,
    pub operation: Operation,
    pub reason: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub entity: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this executor
    AlreadyActive,
    /// Commit or rollback without an open transaction
    NotActive,
    /// The backend failed to commit
    CommitFailed,
}

/// Validation errors grouped by field.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    /// Entity type being validated.
    pub entity: String,
    /// Individual field failures.
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The column that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            errors: Vec::new(),
        }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            message: "is required".to_string(),
        });
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Shorthand for a relationship error.
    pub fn relationship(
        entity: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Relationship(RelationshipError {
            entity: entity.into(),
            field: field.into(),
            message: message.into(),
        })
    }

    /// Shorthand for a filter error.
    pub fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Filter(FilterError {
            filter: filter.into(),
            message: message.into(),
        })
    }

    /// Shorthand for an executor query failure.
    pub fn query(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            entity: entity.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    /// Is this a lookup miss the caller can recover from?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntityNotFound { .. })
    }

    /// Programmer errors and states the session cannot continue from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownEntity { .. }
                | Error::MissingKey { .. }
                | Error::DetachedEntity { .. }
                | Error::CyclicDependency { .. }
                | Error::Metadata(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownEntity { entity } => write!(f, "Unknown entity type '{entity}'"),
            Error::EntityNotFound { entity, key } => match key {
                Some(key) => write!(f, "{entity} not found for key {key}"),
                None => write!(f, "{entity} not found"),
            },
            Error::MissingKey { entity, columns } => write!(
                f,
                "{entity} has no resolvable primary key (missing: {})",
                columns.join(", ")
            ),
            Error::DetachedEntity { entity } => {
                write!(f, "{entity} instance is detached from this session")
            }
            Error::CyclicDependency { entities } => {
                write!(f, "Dependency cycle detected: {}", entities.join(" -> "))
            }
            Error::AlreadyTracked { entity, key } => {
                write!(f, "{entity} {key} is already tracked by this session")
            }
            Error::Metadata(msg) => write!(f, "Metadata error: {msg}"),
            Error::Relationship(e) => write!(
                f,
                "Relationship error on {}.{}: {}",
                e.entity, e.field, e.message
            ),
            Error::Filter(e) => write!(f, "Filter '{}': {}", e.filter, e.message),
            Error::Validation(e) => {
                write!(f, "Validation failed for {}: ", e.entity)?;
                for (i, err) in e.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} {}", err.field, err.message)?;
                }
                Ok(())
            }
            Error::Write(e) => write!(
                f,
                "{:?} of {} {} rejected: {}",
                e.operation, e.entity, e.key, e.reason
            ),
            Error::Query(e) => match &e.entity {
                Some(entity) => write!(f, "Query error on {entity}: {}", e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for entity-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_joins_entities() {
        let err = Error::CyclicDependency {
            entities: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: A -> B -> A");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_found_is_recoverable() {
        let err = Error::EntityNotFound {
            entity: "Book".into(),
            key: Some(KeyTuple::single(1_i64)),
        };
        assert!(err.is_not_found());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Book not found for key (1)");
    }

    #[test]
    fn test_validation_error_collects_fields() {
        let mut v = ValidationError::new("Author");
        assert!(v.clone().into_result().is_ok());
        v.add_required("name");
        v.add_required("org_id");
        let err: Error = v.into();
        assert_eq!(
            err.to_string(),
            "Validation failed for Author: name is required; org_id is required"
        );
    }
}
