//! Change sets: the ordered write operations produced by a flush.

use crate::value::{KeyTuple, Value};
use serde::{Deserialize, Serialize};

/// Kind of write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One changed column of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Column name. Reference fields appear as their foreign-key columns.
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// A single write for one tracked entity.
///
/// At most one change set exists per entity per flush, and an update change
/// set always carries at least one field change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entity: String,
    /// Primary key of the row. For updates this is the key the row was
    /// loaded with; for inserts with a generated key it contains NULLs.
    pub key: KeyTuple,
    pub operation: Operation,
    /// Changed columns (updates only), in column order.
    pub changes: Vec<FieldChange>,
    /// Full column map (inserts only), in column order.
    pub fields: Vec<(String, Value)>,
}

impl ChangeSet {
    /// Insert of a new row.
    pub fn insert(entity: impl Into<String>, key: KeyTuple, fields: Vec<(String, Value)>) -> Self {
        Self {
            entity: entity.into(),
            key,
            operation: Operation::Insert,
            changes: Vec::new(),
            fields,
        }
    }

    /// Update of changed columns.
    pub fn update(entity: impl Into<String>, key: KeyTuple, changes: Vec<FieldChange>) -> Self {
        Self {
            entity: entity.into(),
            key,
            operation: Operation::Update,
            changes,
            fields: Vec::new(),
        }
    }

    /// Delete by key.
    pub fn delete(entity: impl Into<String>, key: KeyTuple) -> Self {
        Self {
            entity: entity.into(),
            key,
            operation: Operation::Delete,
            changes: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn is_insert(&self) -> bool {
        self.operation == Operation::Insert
    }

    pub fn is_update(&self) -> bool {
        self.operation == Operation::Update
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Value written to `column`: the insert value or the new update value.
    pub fn value(&self, column: &str) -> Option<&Value> {
        match self.operation {
            Operation::Insert => self.fields.iter().find(|(c, _)| c == column).map(|(_, v)| v),
            Operation::Update => self
                .changes
                .iter()
                .find(|c| c.field == column)
                .map(|c| &c.new),
            Operation::Delete => None,
        }
    }

    /// Set a column value in place: an insert field, or the new value of an
    /// update change. Deletes carry no values and are left alone.
    pub fn set_field(&mut self, column: &str, value: Value) {
        match self.operation {
            Operation::Insert => {
                if let Some(slot) = self.fields.iter_mut().find(|(c, _)| c == column) {
                    slot.1 = value;
                } else {
                    self.fields.push((column.to_string(), value));
                }
            }
            Operation::Update => {
                if let Some(change) = self.changes.iter_mut().find(|c| c.field == column) {
                    change.new = value;
                } else {
                    self.changes.push(FieldChange {
                        field: column.to_string(),
                        old: Value::Null,
                        new: value,
                    });
                }
            }
            Operation::Delete => {}
        }
    }

    /// JSON rendering for diagnostics.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable: {e}>"))
    }
}
