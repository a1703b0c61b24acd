//! Identity Map pattern for tracking unique entity instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! entity instance within a session. This provides:
//!
//! - **Uniqueness**: Same key always returns the same handle
//! - **Cache**: Avoids redundant queries for the same row
//! - **Consistency**: Changes to an instance are visible everywhere it's used
//!
//! The map is keyed by `(entity type, key tuple)` and owns strong handles;
//! references elsewhere hold only weak pointers into it.

use crate::entity::EntityRef;
use relmap_core::{Error, KeyTuple, Result};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Identity of a row within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub entity: String,
    pub key: KeyTuple,
}

impl IdentityKey {
    pub fn new(entity: impl Into<String>, key: KeyTuple) -> Self {
        Self {
            entity: entity.into(),
            key,
        }
    }
}

/// Identity Map for tracking unique entity instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an instance by entity type and key.
    pub fn get(&self, entity: &str, key: &KeyTuple) -> Option<EntityRef> {
        self.entries
            .get(&IdentityKey::new(entity, key.clone()))
            .cloned()
    }

    /// Check if an instance with the given key is present.
    pub fn contains(&self, entity: &str, key: &KeyTuple) -> bool {
        self.entries
            .contains_key(&IdentityKey::new(entity, key.clone()))
    }

    /// Return the cached instance for the key, or build one with
    /// `materializer`, store it and return it.
    ///
    /// The materializer runs only on a miss and at most once per call; the
    /// returned flag is `true` when it ran. The check and the insertion happen
    /// under the same exclusive borrow, so interleaved fetches of one key can
    /// never both materialize it.
    #[tracing::instrument(level = "trace", skip(self, materializer), fields(entity = entity, key = %key))]
    pub fn get_or_create<F>(
        &mut self,
        entity: &str,
        key: KeyTuple,
        materializer: F,
    ) -> Result<(EntityRef, bool)>
    where
        F: FnOnce() -> Result<EntityRef>,
    {
        match self.entries.entry(IdentityKey::new(entity, key)) {
            Entry::Occupied(e) => {
                tracing::trace!("Identity map hit");
                Ok((e.get().clone(), false))
            }
            Entry::Vacant(e) => {
                let instance = materializer()?;
                Ok((e.insert(instance).clone(), true))
            }
        }
    }

    /// Register an instance under its current key.
    ///
    /// Fails with `AlreadyTracked` if a different instance holds the key.
    pub fn insert(&mut self, instance: &EntityRef) -> Result<()> {
        let entity = instance.entity_type();
        let key = instance.key();
        match self.entries.entry(IdentityKey::new(entity.clone(), key.clone())) {
            Entry::Occupied(e) if e.get().ptr_eq(instance) => Ok(()),
            Entry::Occupied(_) => Err(Error::AlreadyTracked { entity, key }),
            Entry::Vacant(e) => {
                e.insert(instance.clone());
                Ok(())
            }
        }
    }

    /// Remove an instance from the map, returning it.
    pub fn evict(&mut self, entity: &str, key: &KeyTuple) -> Option<EntityRef> {
        self.entries
            .remove(&IdentityKey::new(entity, key.clone()))
    }

    /// Remove the entry at `key` only if it holds `instance`.
    pub(crate) fn release(&mut self, instance: &EntityRef, key: &KeyTuple) -> bool {
        let id = IdentityKey::new(instance.entity_type(), key.clone());
        if self.entries.get(&id).is_some_and(|e| e.ptr_eq(instance)) {
            self.entries.remove(&id);
            return true;
        }
        false
    }

    /// Register an instance under its current key, returning any different
    /// instance it displaced.
    pub(crate) fn replace(&mut self, instance: &EntityRef) -> Option<EntityRef> {
        let id = IdentityKey::new(instance.entity_type(), instance.key());
        self.entries
            .insert(id, instance.clone())
            .filter(|previous| !previous.ptr_eq(instance))
    }

    /// Remove every entry, returning the instances that were held.
    pub fn clear(&mut self) -> Vec<EntityRef> {
        self.entries.drain().map(|(_, v)| v).collect()
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &EntityRef)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityData, EntityState};
    use relmap_core::metadata::{EntityDescriptor, FieldDescriptor, MetadataRegistry};
    use std::cell::Cell;
    use std::sync::Arc;

    fn make_user(id: i64) -> EntityRef {
        let mut registry = MetadataRegistry::new();
        let meta = registry
            .register(
                EntityDescriptor::new("User")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(FieldDescriptor::scalar("name")),
            )
            .unwrap();
        let user = EntityRef::new(EntityData::new(
            meta,
            Arc::new(registry),
            1,
            u64::try_from(id).unwrap(),
            EntityState::Managed,
        ));
        user.set("id", id).unwrap();
        user
    }

    #[test]
    fn test_get_or_create_materializes_once() {
        let mut map = IdentityMap::new();
        let calls = Cell::new(0);

        let (first, created) = map
            .get_or_create("User", 1_i64.into(), || {
                calls.set(calls.get() + 1);
                Ok(make_user(1))
            })
            .unwrap();
        assert!(created);

        let (second, created) = map
            .get_or_create("User", 1_i64.into(), || {
                calls.set(calls.get() + 1);
                Ok(make_user(1))
            })
            .unwrap();
        assert!(!created);
        assert_eq!(calls.get(), 1);
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn test_materializer_error_leaves_map_empty() {
        let mut map = IdentityMap::new();
        let result = map.get_or_create("User", 1_i64.into(), || Err(Error::Custom("boom".into())));
        assert!(result.is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn test_insert_rejects_second_instance() {
        let mut map = IdentityMap::new();
        let a = make_user(1);
        map.insert(&a).unwrap();
        map.insert(&a).unwrap();

        let err = map.insert(&make_user(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyTracked { ref entity, .. } if entity == "User"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_integer_widths_share_identity() {
        let mut map = IdentityMap::new();
        map.insert(&make_user(5)).unwrap();
        assert!(map.contains("User", &KeyTuple::from(5_i32)));
        assert!(!map.contains("Team", &KeyTuple::from(5_i64)));
    }

    #[test]
    fn test_evict_and_clear() {
        let mut map = IdentityMap::new();
        map.insert(&make_user(1)).unwrap();
        map.insert(&make_user(2)).unwrap();

        assert!(map.evict("User", &1_i64.into()).is_some());
        assert!(map.evict("User", &1_i64.into()).is_none());
        assert_eq!(map.clear().len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_release_then_replace_moves_entry() {
        let mut map = IdentityMap::new();
        let user = make_user(1);
        map.insert(&user).unwrap();
        user.set("id", 9_i64).unwrap();
        assert!(map.release(&user, &1_i64.into()));
        assert!(map.replace(&user).is_none());
        assert!(map.get("User", &9_i64.into()).unwrap().ptr_eq(&user));
        assert!(!map.contains("User", &1_i64.into()));
        assert!(map.replace(&user).is_none());
    }

    #[test]
    fn test_release_ignores_other_instance() {
        let mut map = IdentityMap::new();
        let held = make_user(1);
        map.insert(&held).unwrap();
        let other = make_user(1);
        assert!(!map.release(&other, &1_i64.into()));
        assert!(map.get("User", &1_i64.into()).unwrap().ptr_eq(&held));

        let displaced = map.replace(&other).unwrap();
        assert!(displaced.ptr_eq(&held));
        assert_eq!(map.len(), 1);
    }
}
