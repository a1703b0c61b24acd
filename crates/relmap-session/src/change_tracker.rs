//! Change tracking and dirty detection for a session.
//!
//! Snapshots are plain column maps: owning references appear only as their
//! foreign-key columns, never as instances. Dirtiness is value-based, so a
//! field changed and then changed back is clean again.

use crate::entity::EntityData;
use relmap_core::{FieldChange, KeyTuple, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Snapshot of an entity's persistable state at a point in time.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    /// Column values aligned with the entity's column list.
    values: Vec<Value>,
    /// Primary key at snapshot time; updates and deletes address this key.
    key: KeyTuple,
    /// Timestamp when snapshot was taken.
    taken_at: Instant,
}

impl EntitySnapshot {
    pub(crate) fn capture(data: &EntityData) -> Self {
        Self {
            values: data.values.clone(),
            key: data.key(),
            taken_at: Instant::now(),
        }
    }

    /// Get the snapshot column values.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Primary key recorded with the snapshot.
    pub fn key(&self) -> &KeyTuple {
        &self.key
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Tracks changes to entities in the session, keyed by tracking serial.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<u64, EntitySnapshot>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of an entity, replacing any previous one.
    #[tracing::instrument(level = "trace", skip(self, data), fields(entity = data.meta.name(), serial = data.serial))]
    pub(crate) fn snapshot(&mut self, data: &EntityData) {
        let snapshot = EntitySnapshot::capture(data);
        tracing::trace!(key = %snapshot.key, columns = snapshot.values.len(), "Taking entity snapshot");
        self.snapshots.insert(data.serial, snapshot);
    }

    /// Column-by-column diff against the snapshot, in column order.
    ///
    /// An entity without a snapshot reports every non-null column.
    pub(crate) fn diff(&self, data: &EntityData) -> Vec<FieldChange> {
        let columns = data.meta.columns();
        let original = self.snapshots.get(&data.serial).map(EntitySnapshot::values);
        columns
            .iter()
            .enumerate()
            .filter_map(|(i, column)| {
                let current = &data.values[i];
                let old = original
                    .and_then(|o| o.get(i))
                    .cloned()
                    .unwrap_or(Value::Null);
                if old.same_as(current) {
                    None
                } else {
                    Some(FieldChange {
                        field: column.name.clone(),
                        old,
                        new: current.clone(),
                    })
                }
            })
            .collect()
    }

    /// Check if an entity differs from its snapshot.
    pub(crate) fn is_dirty(&self, data: &EntityData) -> bool {
        !self.diff(data).is_empty()
    }

    /// Check if a snapshot exists for the given serial.
    pub fn has_snapshot(&self, serial: u64) -> bool {
        self.snapshots.contains_key(&serial)
    }

    /// Get the snapshot for a serial.
    pub fn get_snapshot(&self, serial: u64) -> Option<&EntitySnapshot> {
        self.snapshots.get(&serial)
    }

    /// Drop the snapshot for a specific entity.
    pub fn forget(&mut self, serial: u64) -> Option<EntitySnapshot> {
        self.snapshots.remove(&serial)
    }

    /// Drop all snapshots.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use relmap_core::metadata::{EntityDescriptor, FieldDescriptor, MetadataRegistry};
    use std::sync::Arc;

    fn make_hero() -> EntityData {
        let mut registry = MetadataRegistry::new();
        let meta = registry
            .register(
                EntityDescriptor::new("Hero")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(FieldDescriptor::scalar("name"))
                    .field(FieldDescriptor::scalar("age").nullable()),
            )
            .unwrap();
        let mut data = EntityData::new(meta, Arc::new(registry), 1, 7, EntityState::Managed);
        data.set_column("id", Value::BigInt(1));
        data.set_column("name", Value::Text("Spider-Man".into()));
        data
    }

    #[test]
    fn test_clean_after_snapshot() {
        let mut tracker = ChangeTracker::new();
        let data = make_hero();
        tracker.snapshot(&data);
        assert!(tracker.has_snapshot(7));
        assert!(!tracker.is_dirty(&data));
        assert_eq!(tracker.get_snapshot(7).unwrap().key(), &KeyTuple::from(1_i64));
    }

    #[test]
    fn test_diff_reports_changed_columns() {
        let mut tracker = ChangeTracker::new();
        let mut data = make_hero();
        tracker.snapshot(&data);

        data.set_column("name", Value::Text("Peter Parker".into()));
        data.set_column("age", Value::Int(25));
        let changes = tracker.diff(&data);
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "age"]);
        assert_eq!(changes[1].old, Value::Null);
    }

    #[test]
    fn test_revert_is_clean() {
        let mut tracker = ChangeTracker::new();
        let mut data = make_hero();
        tracker.snapshot(&data);

        data.set_column("name", Value::Text("Changed".into()));
        assert!(tracker.is_dirty(&data));
        data.set_column("name", Value::Text("Spider-Man".into()));
        assert!(!tracker.is_dirty(&data));
    }

    #[test]
    fn test_integer_width_change_is_not_a_diff() {
        let mut tracker = ChangeTracker::new();
        let mut data = make_hero();
        tracker.snapshot(&data);
        data.set_column("id", Value::Int(1));
        assert!(!tracker.is_dirty(&data));
    }

    #[test]
    fn test_forget_and_clear() {
        let mut tracker = ChangeTracker::new();
        let data = make_hero();
        tracker.snapshot(&data);
        assert!(tracker.forget(7).is_some());
        assert!(tracker.is_dirty(&data));
        tracker.snapshot(&data);
        tracker.clear_all();
        assert!(tracker.is_empty());
    }
}
