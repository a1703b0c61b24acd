//! Two-state relationship handles.
//!
//! A [`Reference`] always carries the target's entity type and key tuple. It
//! may additionally carry a weak pointer to the loaded target instance. The
//! pointer never keeps the target alive and is ignored once the target is
//! detached, so eviction invalidates the payload but not the key.

use crate::entity::{EntityData, EntityRef, EntityState};
use relmap_core::KeyTuple;
use std::fmt;
use std::sync::{RwLock, Weak};

/// A lookup key for a target entity plus an optional cached instance.
#[derive(Clone)]
pub struct Reference {
    entity: String,
    key: KeyTuple,
    payload: Option<Weak<RwLock<EntityData>>>,
}

impl Reference {
    /// An unloaded reference: key only.
    pub fn unloaded(entity: impl Into<String>, key: impl Into<KeyTuple>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
            payload: None,
        }
    }

    pub(crate) fn with_payload(
        entity: impl Into<String>,
        key: KeyTuple,
        payload: Weak<RwLock<EntityData>>,
    ) -> Self {
        Self {
            entity: entity.into(),
            key,
            payload: Some(payload),
        }
    }

    /// Target entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity
    }

    /// Target key tuple.
    ///
    /// For a loaded reference this is read from the target instance, so a key
    /// generated on flush is visible through references taken before it.
    pub fn key(&self) -> KeyTuple {
        match self.get() {
            Some(target) => target.key(),
            None => self.key.clone(),
        }
    }

    /// Whether a live payload is attached.
    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    /// The loaded target, without suspending. `None` for unloaded references
    /// and for payloads that were evicted or detached.
    pub fn get(&self) -> Option<EntityRef> {
        self.payload
            .as_ref()
            .and_then(EntityRef::upgrade)
            .filter(|e| e.state() != EntityState::Detached)
    }

    /// The key-only form of this reference.
    pub fn unload(&self) -> Reference {
        Reference::unloaded(self.entity.clone(), self.key())
    }

    /// Whether the payload is exactly `entity`.
    pub fn points_at(&self, entity: &EntityRef) -> bool {
        self.get().is_some_and(|e| e.ptr_eq(entity))
    }

    pub(crate) fn payload(&self) -> Option<Weak<RwLock<EntityData>>> {
        self.get().map(|e| e.downgrade())
    }
}

/// References are equal when they name the same target identity.
impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key() == other.key()
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("entity", &self.entity)
            .field("key", &self.key())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({}{})", self.entity, self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::metadata::{EntityDescriptor, FieldDescriptor, MetadataRegistry};
    use std::sync::Arc;

    fn organisation(id: i64) -> EntityRef {
        let mut registry = MetadataRegistry::new();
        let meta = registry
            .register(
                EntityDescriptor::new("Organisation")
                    .field(FieldDescriptor::scalar("id").primary_key()),
            )
            .unwrap();
        let entity = EntityRef::new(EntityData::new(
            meta,
            Arc::new(registry),
            1,
            1,
            EntityState::Managed,
        ));
        entity.set("id", id).unwrap();
        entity
    }

    #[test]
    fn test_unloaded_reference_has_key_only() {
        let r = Reference::unloaded("Organisation", 1_i64);
        assert!(!r.is_loaded());
        assert!(r.get().is_none());
        assert_eq!(r.key(), KeyTuple::from(1_i64));
        assert_eq!(r.to_string(), "ref(Organisation(1))");
    }

    #[test]
    fn test_loaded_reference_tracks_live_key() {
        let org = organisation(1);
        let r = org.to_reference();
        assert!(r.points_at(&org));
        org.set("id", 7_i64).unwrap();
        assert_eq!(r.key(), KeyTuple::from(7_i64));
        assert_eq!(r, Reference::unloaded("Organisation", 7_i64));
    }

    #[test]
    fn test_detached_payload_is_invalidated() {
        let org = organisation(1);
        let r = org.to_reference();
        org.set_state(EntityState::Detached);
        assert!(!r.is_loaded());
        // The key survives and falls back to the one recorded at creation.
        assert_eq!(r.key(), KeyTuple::from(1_i64));
    }

    #[test]
    fn test_dropped_payload_is_invalidated() {
        let r = organisation(3).to_reference();
        assert!(!r.is_loaded());
        assert_eq!(r.unload().key(), KeyTuple::from(3_i64));
    }
}
