//! Entity instances and the shared handles sessions hand out.
//!
//! An entity instance is a column map shaped by its [`EntityMetadata`].
//! Handles are `Arc<RwLock<..>>` so that every lookup of the same identity
//! within a session observes (and mutates) the same underlying object.
//!
//! Owning-side reference fields are never stored separately: reading one
//! projects the current values of its join columns into a key tuple, and
//! assigning one writes the join columns the reference owns.

use crate::reference::Reference;
use relmap_core::metadata::{EntityMetadata, MetadataRegistry, RelationshipDescriptor, RelationshipSide};
use relmap_core::{Error, KeyTuple, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Internal lifecycle of a tracked instance.
///
/// Clean vs dirty is not stored; it is recomputed by diffing against the
/// snapshot (see [`LifecycleState`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityState {
    New,
    Managed,
    Removed,
    Detached,
}

/// Lifecycle state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created in this session, never persisted.
    New,
    /// Persisted; live state equals the snapshot.
    ManagedClean,
    /// Persisted; live state diverges from the snapshot.
    ManagedDirty,
    /// Marked for deletion at the next flush.
    Removed,
    /// No longer tracked by any session.
    Detached,
}

pub(crate) struct EntityData {
    pub(crate) meta: Arc<EntityMetadata>,
    pub(crate) registry: Arc<MetadataRegistry>,
    pub(crate) session_id: u64,
    /// Tracking serial, unique within the session.
    pub(crate) serial: u64,
    pub(crate) state: EntityState,
    /// Column values aligned with `meta.columns()`.
    pub(crate) values: Vec<Value>,
    /// Loaded reference payloads by field name.
    pub(crate) loaded: HashMap<String, Weak<RwLock<EntityData>>>,
}

impl EntityData {
    pub(crate) fn new(
        meta: Arc<EntityMetadata>,
        registry: Arc<MetadataRegistry>,
        session_id: u64,
        serial: u64,
        state: EntityState,
    ) -> Self {
        let values = vec![Value::Null; meta.columns().len()];
        Self {
            meta,
            registry,
            session_id,
            serial,
            state,
            values,
            loaded: HashMap::new(),
        }
    }

    pub(crate) fn column(&self, name: &str) -> Option<&Value> {
        self.meta.column_index(name).map(|i| &self.values[i])
    }

    pub(crate) fn set_column(&mut self, name: &str, value: Value) {
        if let Some(i) = self.meta.column_index(name) {
            self.values[i] = value;
        }
    }

    /// Current primary-key tuple, in key-column order.
    pub(crate) fn key(&self) -> KeyTuple {
        self.project(self.meta.primary_key().columns())
    }

    /// Values of `columns`, in the given order.
    pub(crate) fn project<S: AsRef<str>>(&self, columns: &[S]) -> KeyTuple {
        KeyTuple::new(
            columns
                .iter()
                .map(|c| self.column(c.as_ref()).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Key columns that hold NULL.
    pub(crate) fn missing_key_columns(&self) -> Vec<String> {
        self.meta
            .primary_key()
            .columns()
            .iter()
            .filter(|c| self.column(c).is_none_or(Value::is_null))
            .cloned()
            .collect()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.state == EntityState::Detached {
            return Err(Error::DetachedEntity {
                entity: self.meta.name().to_string(),
            });
        }
        Ok(())
    }

    /// Write the join columns of an owning reference.
    ///
    /// Owned columns are always written. A shared column is filled when it is
    /// NULL and must otherwise already hold the target's value.
    fn assign_owning(
        &mut self,
        field: &str,
        rel: &RelationshipDescriptor,
        key: Option<&KeyTuple>,
        payload: Option<Weak<RwLock<EntityData>>>,
    ) -> Result<()> {
        let target = self.registry.resolve(&rel.target)?;
        let local = rel.local_columns_for(&target)?;
        let mut writes = Vec::with_capacity(local.len());
        for (i, column) in local.iter().enumerate() {
            let owned = rel
                .join_columns()
                .iter()
                .any(|jc| jc.local == *column && jc.owned);
            let new = key
                .and_then(|k| k.values().get(i))
                .cloned()
                .unwrap_or(Value::Null);
            if owned {
                writes.push((*column, new));
                continue;
            }
            if new.is_null() {
                continue;
            }
            let current = self.column(column).cloned().unwrap_or(Value::Null);
            if current.is_null() {
                writes.push((*column, new));
            } else if !current.same_as(&new) {
                return Err(Error::relationship(
                    self.meta.name(),
                    field,
                    format!(
                        "shared column '{column}' holds {current} but the referenced {} has {new}",
                        rel.target
                    ),
                ));
            }
        }
        for (column, value) in writes {
            self.set_column(column, value);
        }
        match payload {
            Some(p) => {
                self.loaded.insert(field.to_string(), p);
            }
            None => {
                self.loaded.remove(field);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EntityData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityData")
            .field("entity", &self.meta.name())
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

/// Shared handle to an entity instance owned by a session.
///
/// Cloning the handle clones the pointer, not the entity.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityData>>);

impl EntityRef {
    pub(crate) fn new(data: EntityData) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<RwLock<EntityData>> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<RwLock<EntityData>>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    pub(crate) fn state(&self) -> EntityState {
        self.read().state
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        self.write().state = state;
    }

    pub(crate) fn serial(&self) -> u64 {
        self.read().serial
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.read().session_id
    }

    /// Loaded payload cached for `field`, if still attached.
    pub(crate) fn loaded(&self, field: &str) -> Option<EntityRef> {
        let weak = self.read().loaded.get(field).cloned()?;
        EntityRef::upgrade(&weak).filter(|e| e.state() != EntityState::Detached)
    }

    pub(crate) fn cache_loaded(&self, field: &str, payload: &EntityRef) {
        self.write()
            .loaded
            .insert(field.to_string(), payload.downgrade());
    }

    /// Entity type name.
    pub fn entity_type(&self) -> String {
        self.read().meta.name().to_string()
    }

    /// Flattened metadata of this instance's type.
    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.read().meta)
    }

    /// Current primary-key tuple. Contains NULLs while a generated key is
    /// still unassigned.
    pub fn key(&self) -> KeyTuple {
        self.read().key()
    }

    /// Whether the owning session was cleared or closed, or the instance was
    /// evicted or deleted.
    pub fn is_detached(&self) -> bool {
        self.state() == EntityState::Detached
    }

    /// Whether two handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Raw column value.
    pub fn column(&self, column: &str) -> Option<Value> {
        self.read().column(column).cloned()
    }

    /// Value of a scalar field.
    pub fn get(&self, field: &str) -> Result<Value> {
        let data = self.read();
        let descriptor = data.meta.require_field(field)?;
        let column = descriptor.scalar_column().ok_or_else(|| {
            Error::relationship(data.meta.name(), field, "is a reference field")
        })?;
        Ok(data.column(column).cloned().unwrap_or(Value::Null))
    }

    /// Set a scalar field.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = self.write();
        data.ensure_mutable()?;
        let descriptor = data.meta.require_field(field)?;
        let column = descriptor
            .scalar_column()
            .ok_or_else(|| {
                Error::relationship(data.meta.name(), field, "is a reference field")
            })?
            .to_string();
        data.set_column(&column, value.into());
        Ok(())
    }

    /// A handle carrying this instance as its loaded payload.
    ///
    /// Unlike `Session::reference_of` this does not require a complete key,
    /// so it can bind a dependent to a parent whose key is generated on flush.
    pub fn to_reference(&self) -> Reference {
        let data = self.read();
        Reference::with_payload(data.meta.name(), data.key(), self.downgrade())
    }

    /// Current value of a reference field.
    ///
    /// For the owning side the target key is projected from the live join
    /// columns; the cached payload is attached only while its key still
    /// matches. The inverse side is known only once populated.
    pub fn reference(&self, field: &str) -> Result<Option<Reference>> {
        let (rel, local_key, cached) = {
            let data = self.read();
            let (_, rel) = data.meta.require_relationship(field)?;
            let local_key = match &rel.side {
                RelationshipSide::Owning { .. } => {
                    let target = data.registry.resolve(&rel.target)?;
                    Some(data.project(&rel.local_columns_for(&target)?))
                }
                RelationshipSide::Inverse { .. } => None,
            };
            (rel.clone(), local_key, data.loaded.get(field).cloned())
        };
        let payload = cached
            .as_ref()
            .and_then(EntityRef::upgrade)
            .filter(|p| p.state() != EntityState::Detached);

        match local_key {
            Some(key) => {
                if let Some(p) = payload.filter(|p| p.key() == key) {
                    return Ok(Some(p.to_reference()));
                }
                if key.is_complete() {
                    Ok(Some(Reference::unloaded(rel.target, key)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(payload.map(|p| p.to_reference())),
        }
    }

    /// Assign a reference field.
    ///
    /// On the owning side this writes the owned join columns. On the inverse
    /// side the target must be loaded; its owning field is pointed back here.
    pub fn set_reference(&self, field: &str, target: Option<&Reference>) -> Result<()> {
        let (entity, rel) = {
            let data = self.read();
            data.ensure_mutable()?;
            let (_, rel) = data.meta.require_relationship(field)?;
            (data.meta.name().to_string(), rel.clone())
        };
        if let Some(t) = target {
            if t.entity_type() != rel.target {
                return Err(Error::relationship(
                    &entity,
                    field,
                    format!("expects {} but got {}", rel.target, t.entity_type()),
                ));
            }
        }

        match &rel.side {
            RelationshipSide::Owning { .. } => {
                let key = target.map(Reference::key);
                let payload = target.and_then(Reference::payload);
                self.write().assign_owning(field, &rel, key.as_ref(), payload)
            }
            RelationshipSide::Inverse { mapped_by } => match target {
                None => {
                    if let Some(previous) = self.loaded(field) {
                        let linked = previous
                            .reference(mapped_by)?
                            .is_some_and(|r| r.points_at(self));
                        if linked {
                            previous.set_reference(mapped_by, None)?;
                        }
                    }
                    self.write().loaded.remove(field);
                    Ok(())
                }
                Some(t) => {
                    let other = t.get().ok_or_else(|| {
                        Error::relationship(
                            &entity,
                            field,
                            "the inverse side can only be assigned a loaded entity",
                        )
                    })?;
                    other.set_reference(mapped_by, Some(&self.to_reference()))?;
                    self.cache_loaded(field, &other);
                    Ok(())
                }
            },
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        write!(f, "{}{}", data.meta.name(), data.key())
    }
}

/// A value supplied to `Session::create`.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Value(Value),
    Reference(Option<Reference>),
}

/// Initial field values for a new entity.
///
/// ```ignore
/// let book = session.create(
///     "Book",
///     Fields::new()
///         .entity("org", &org)
///         .set("id", 1)
///         .set("name", "Book 1")
///         .entity("author", &author),
/// )?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scalar field value.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .push((field.into(), FieldValue::Value(value.into())));
        self
    }

    /// Reference field pointing at `target`.
    pub fn reference(mut self, field: impl Into<String>, target: Reference) -> Self {
        self.entries
            .push((field.into(), FieldValue::Reference(Some(target))));
        self
    }

    /// Reference field pointing at a tracked instance.
    pub fn entity(self, field: impl Into<String>, target: &EntityRef) -> Self {
        self.reference(field, target.to_reference())
    }

    pub fn entries(&self) -> &[(String, FieldValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
