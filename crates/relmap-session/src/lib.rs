//! Session and Unit of Work for the relmap entity manager.
//!
//! `relmap-session` is the **unit-of-work layer**. It coordinates entity
//! identity, relationship resolution, change tracking and filtered querying
//! on top of a persistence [`Executor`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single in-memory instance per primary key.
//! - **References**: two-state handles, projected from live foreign-key columns.
//! - **Change tracking**: value-based diffs against snapshots, ordered into
//!   change sets on flush.
//! - **Filters**: named predicates ANDed into queries and relationship loads.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: No autoflush; loading a reference is an
//!   explicit call with an explicit suspension point.
//! - **Session-scoped identity**: instances are never shared across sessions.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome` via
//!   `relmap-core`. A failed flush leaves the session exactly as it was.
//!
//! # Example
//!
//! ```ignore
//! let mut session = factory.fork();
//!
//! let book = session
//!     .find_one_or_fail(&cx, "Book", Condition::field_eq("org", 1), &FindOptions::new().populate("author"))
//!     .await?;
//! book.set("name", "Renamed")?;
//!
//! session.flush(&cx).await?;
//! ```

pub mod change_tracker;
pub mod context;
pub mod entity;
pub mod filter;
pub mod flush;
pub mod identity_map;
pub mod reference;

pub use change_tracker::{ChangeTracker, EntitySnapshot};
pub use context::{RequestContext, SessionHandle};
pub use entity::{EntityRef, FieldValue, Fields, LifecycleState};
pub use filter::{FilterDef, FilterRegistry};
pub use flush::{FlushPlan, FlushResult, PlannedWrite};
pub use identity_map::{IdentityKey, IdentityMap};
pub use reference::Reference;

use entity::{EntityData, EntityState};
use flush::FlushPlanner;
use relmap_core::metadata::{DeleteRule, EntityMetadata, FieldKind, MetadataRegistry, RelationshipSide};
use relmap_core::{
    ChangeSet, Condition, Cx, Direction, Error, Executor, KeyTuple, Operation, OrderBy, Outcome,
    Query, Result, Row, Value,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Context name; sessions are registered in a [`RequestContext`] under it.
    pub name: String,
    /// Whether flush wraps its writes in begin/commit/rollback.
    pub transactional_flush: bool,
    /// Whether `find_by_key` answers from the identity map without querying.
    pub identity_map_lookups: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            transactional_flush: true,
            identity_map_lookups: true,
        }
    }
}

impl SessionConfig {
    /// Default configuration under a context name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn transactional_flush(mut self, enabled: bool) -> Self {
        self.transactional_flush = enabled;
        self
    }

    pub fn identity_map_lookups(mut self, enabled: bool) -> Self {
        self.identity_map_lookups = enabled;
        self
    }
}

/// Options for the `find*` family.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Reference fields to load eagerly.
    pub populate: Vec<String>,
    /// Per-call filter toggles, overriding session toggles.
    pub filters: HashMap<String, bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Vec<OrderBy>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a reference field of every result.
    pub fn populate(mut self, field: impl Into<String>) -> Self {
        self.populate.push(field.into());
        self
    }

    /// Enable a filter for this call only.
    pub fn enable_filter(mut self, name: impl Into<String>) -> Self {
        self.filters.insert(name.into(), true);
        self
    }

    /// Disable a filter for this call only.
    pub fn disable_filter(mut self, name: impl Into<String>) -> Self {
        self.filters.insert(name.into(), false);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Shared, immutable configuration from which sessions are forked.
///
/// Holds the validated metadata, the filter registry and an executor that
/// is cloned into every session.
#[derive(Debug)]
pub struct SessionFactory<E> {
    metadata: Arc<MetadataRegistry>,
    filters: Arc<FilterRegistry>,
    executor: E,
    config: SessionConfig,
}

impl<E: Executor + Clone> SessionFactory<E> {
    /// Validate the metadata graph and build a factory.
    pub fn new(metadata: MetadataRegistry, filters: FilterRegistry, executor: E) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            metadata: Arc::new(metadata),
            filters: Arc::new(filters),
            executor,
            config: SessionConfig::default(),
        })
    }

    /// Replace the configuration handed to forked sessions.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Context name of the sessions this factory forks.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    /// A fresh session with its own identity map.
    pub fn fork(&self) -> Session<E> {
        Session::new(
            Arc::clone(&self.metadata),
            Arc::clone(&self.filters),
            self.executor.clone(),
            self.config.clone(),
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// The entity manager: one identity map, one change tracker, one executor.
///
/// A session is logically single-threaded; independent sessions share
/// nothing mutable.
pub struct Session<E: Executor> {
    id: u64,
    config: SessionConfig,
    metadata: Arc<MetadataRegistry>,
    filters: Arc<FilterRegistry>,
    executor: E,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    /// Tracked instances in tracking order.
    tracked: Vec<EntityRef>,
    filter_overrides: HashMap<String, bool>,
    filter_params: HashMap<String, Value>,
    /// Change sets from the most recent computation.
    change_sets: Vec<ChangeSet>,
    next_serial: u64,
    closed: bool,
}

impl<E: Executor> Session<E> {
    /// Create a session. Prefer [`SessionFactory::fork`].
    pub fn new(
        metadata: Arc<MetadataRegistry>,
        filters: Arc<FilterRegistry>,
        executor: E,
        config: SessionConfig,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = %config.name, id, "Opening session");
        Self {
            id,
            config,
            metadata,
            filters,
            executor,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            tracked: Vec::new(),
            filter_overrides: HashMap::new(),
            filter_params: HashMap::new(),
            change_sets: Vec::new(),
            next_serial: 1,
            closed: false,
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Number of tracked instances, including new ones without a key.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self, entity: &str) -> Result<()> {
        if self.closed {
            return Err(Error::DetachedEntity {
                entity: entity.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_attached(&self, entity: &EntityRef) -> Result<()> {
        let data = entity.read();
        if self.closed || data.session_id != self.id || data.state == EntityState::Detached {
            return Err(Error::DetachedEntity {
                entity: data.meta.name().to_string(),
            });
        }
        Ok(())
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn concrete(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        let meta = self.metadata.resolve(entity)?;
        if meta.is_abstract() {
            return Err(Error::Metadata(format!(
                "{entity} is abstract and cannot be queried or instantiated"
            )));
        }
        Ok(meta)
    }

    // ========================================================================
    // Entity Lifecycle
    // ========================================================================

    /// Create a new entity (state `New`).
    ///
    /// A client-assigned key registers the instance in the identity map
    /// immediately. Key columns generated by the backend, or waiting on a new
    /// parent's generated key, may be left empty; registration then happens
    /// when flush assigns them. Any other missing key column fails with
    /// `MissingKey`.
    #[tracing::instrument(level = "debug", skip(self, fields), fields(session = %self.config.name))]
    pub fn create(&mut self, entity: &str, fields: Fields) -> Result<EntityRef> {
        self.ensure_open(entity)?;
        let meta = self.concrete(entity)?;
        let serial = self.next_serial();
        let instance = EntityRef::new(EntityData::new(
            Arc::clone(&meta),
            Arc::clone(&self.metadata),
            self.id,
            serial,
            EntityState::New,
        ));

        let mut inverse = Vec::new();
        for (field, value) in fields.entries() {
            match value {
                FieldValue::Value(v) => instance.set(field, v.clone())?,
                FieldValue::Reference(target) => {
                    if let Some(payload) = target.as_ref().and_then(Reference::get) {
                        self.ensure_attached(&payload)?;
                    }
                    let is_inverse = meta
                        .require_relationship(field)?
                        .1
                        .mapped_by()
                        .is_some();
                    if is_inverse {
                        inverse.push((field, target));
                    } else {
                        instance.set_reference(field, target.as_ref())?;
                    }
                }
            }
        }

        let missing = instance.read().missing_key_columns();
        let registered = missing.is_empty().then(|| instance.key());
        if registered.is_some() {
            self.identity_map.insert(&instance)?;
        } else {
            let unresolved: Vec<String> = missing
                .into_iter()
                .filter(|c| !self.key_column_pending(&instance, &meta, c))
                .collect();
            if !unresolved.is_empty() {
                return Err(Error::MissingKey {
                    entity: entity.to_string(),
                    columns: unresolved,
                });
            }
            tracing::debug!("Key is generated on flush; identity map registration deferred");
        }

        for (field, target) in inverse {
            if let Err(e) = instance.set_reference(field, target.as_ref()) {
                if let Some(key) = &registered {
                    self.identity_map.release(&instance, key);
                }
                return Err(e);
            }
        }

        tracing::debug!(key = %instance.key(), serial, "Created entity");
        self.tracked.push(instance.clone());
        Ok(instance)
    }

    /// Whether an empty key column will be filled during flush.
    fn key_column_pending(&self, instance: &EntityRef, meta: &EntityMetadata, column: &str) -> bool {
        if meta.column(column).is_some_and(|c| c.generated) {
            return true;
        }
        meta.owning_references().any(|(field, rel)| {
            rel.join_columns().iter().any(|jc| jc.local == column)
                && instance
                    .loaded(&field.name)
                    .is_some_and(|p| p.state() == EntityState::New && !p.key().is_complete())
        })
    }

    /// Mark an entity for deletion.
    ///
    /// New entities are simply forgotten. Tracked dependents whose owning
    /// reference to the entity declares `Cascade` are removed as well;
    /// `SetNull` dependents have the reference cleared.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(session = %self.config.name, entity = ?entity))]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_attached(entity)?;
        let (name, key) = {
            let data = entity.read();
            (data.meta.name().to_string(), data.key())
        };
        match entity.state() {
            EntityState::Removed | EntityState::Detached => return Ok(()),
            EntityState::New => {
                entity.set_state(EntityState::Detached);
                self.tracked.retain(|e| !e.ptr_eq(entity));
                if key.is_complete()
                    && self
                        .identity_map
                        .get(&name, &key)
                        .is_some_and(|e| e.ptr_eq(entity))
                {
                    self.identity_map.evict(&name, &key);
                }
            }
            EntityState::Managed => entity.set_state(EntityState::Removed),
        }

        let dependents: Vec<EntityRef> = self
            .tracked
            .iter()
            .filter(|e| matches!(e.state(), EntityState::New | EntityState::Managed))
            .cloned()
            .collect();
        for dependent in dependents {
            let meta = dependent.metadata();
            for (field, rel) in meta.owning_references() {
                if rel.target != name || rel.delete_rule == DeleteRule::NoAction {
                    continue;
                }
                let points_here = dependent
                    .reference(&field.name)?
                    .is_some_and(|r| r.key() == key);
                if !points_here {
                    continue;
                }
                if rel.delete_rule == DeleteRule::Cascade {
                    tracing::debug!(dependent = ?dependent, via = %field.name, "Cascading remove");
                    self.remove(&dependent)?;
                    break;
                }
                dependent.set_reference(&field.name, None)?;
            }
        }
        Ok(())
    }

    /// Lifecycle state of an instance as seen by this session.
    pub fn state_of(&self, entity: &EntityRef) -> LifecycleState {
        let data = entity.read();
        if data.session_id != self.id {
            return LifecycleState::Detached;
        }
        match data.state {
            EntityState::New => LifecycleState::New,
            EntityState::Managed if self.tracker.is_dirty(&data) => LifecycleState::ManagedDirty,
            EntityState::Managed => LifecycleState::ManagedClean,
            EntityState::Removed => LifecycleState::Removed,
            EntityState::Detached => LifecycleState::Detached,
        }
    }

    // ========================================================================
    // References
    // ========================================================================

    /// An unloaded reference to `entity` with the given key.
    pub fn reference_to(&self, entity: &str, key: impl Into<KeyTuple>) -> Result<Reference> {
        let meta = self.concrete(entity)?;
        let key = key.into();
        if key.len() != meta.primary_key().columns().len() || !key.is_complete() {
            return Err(Error::MissingKey {
                entity: entity.to_string(),
                columns: meta.primary_key().columns().to_vec(),
            });
        }
        Ok(Reference::unloaded(entity, key))
    }

    /// A loaded reference wrapping a tracked instance.
    pub fn reference_of(&self, entity: &EntityRef) -> Result<Reference> {
        self.ensure_attached(entity)?;
        let missing = entity.read().missing_key_columns();
        if !missing.is_empty() {
            return Err(Error::MissingKey {
                entity: entity.entity_type(),
                columns: missing,
            });
        }
        Ok(entity.to_reference())
    }

    /// Dereference a reference, querying on a miss.
    ///
    /// A payload owned by this session is returned without suspending.
    /// Otherwise the identity map is consulted and then the backend, with the
    /// session's active filters applied.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.config.name))]
    pub async fn load(&mut self, cx: &Cx, reference: &Reference) -> Outcome<EntityRef, Error> {
        if let Err(e) = self.ensure_open(reference.entity_type()) {
            return Outcome::Err(e);
        }
        if let Some(payload) = reference.get() {
            if payload.session_id() == self.id {
                tracing::trace!("Reference already loaded");
                return Outcome::Ok(payload);
            }
        }
        let key = reference.key();
        let found = match self
            .fetch_by_key(cx, reference.entity_type(), &key, &HashMap::new())
            .await
        {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match found {
            Some(entity) => Outcome::Ok(entity),
            None => Outcome::Err(Error::EntityNotFound {
                entity: reference.entity_type().to_string(),
                key: Some(key),
            }),
        }
    }

    /// Resolve a reference field of `entity`, loading it if needed.
    ///
    /// Returns `None` when the reference is unset, when the inverse side has
    /// no owner, or when an active filter hides the target.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = %self.config.name, entity = ?entity))]
    pub async fn related(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        field: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Err(e) = self.ensure_attached(entity) {
            return Outcome::Err(e);
        }
        if let Some(loaded) = entity.loaded(field) {
            let current = match entity.reference(field) {
                Ok(current) => current,
                Err(e) => return Outcome::Err(e),
            };
            if current.is_some_and(|r| r.points_at(&loaded)) {
                return Outcome::Ok(Some(loaded));
            }
        }
        match self
            .populate_with(cx, std::slice::from_ref(entity), field, &HashMap::new())
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let resolved = match entity.reference(field) {
            Ok(r) => r.and_then(|r| r.get()),
            Err(e) => return Outcome::Err(e),
        };
        Outcome::Ok(resolved)
    }

    /// Populate a reference field on every given instance, in one query.
    #[tracing::instrument(level = "debug", skip(self, cx, entities), fields(session = %self.config.name, count = entities.len()))]
    pub async fn populate(
        &mut self,
        cx: &Cx,
        entities: &[EntityRef],
        field: &str,
    ) -> Outcome<(), Error> {
        for entity in entities {
            if let Err(e) = self.ensure_attached(entity) {
                return Outcome::Err(e);
            }
        }
        self.populate_with(cx, entities, field, &HashMap::new()).await
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Enable a filter for every subsequent query of this session.
    pub fn enable_filter(&mut self, name: &str) -> Result<()> {
        self.filters.require(name)?;
        self.filter_overrides.insert(name.to_string(), true);
        Ok(())
    }

    /// Disable a filter for every subsequent query of this session.
    pub fn disable_filter(&mut self, name: &str) -> Result<()> {
        self.filters.require(name)?;
        self.filter_overrides.insert(name.to_string(), false);
        Ok(())
    }

    /// Bind a filter parameter for this session.
    pub fn set_filter_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.filter_params.insert(name.into(), value.into());
    }

    /// Names of the filters in effect for this session.
    pub fn active_filters(&self) -> BTreeSet<String> {
        self.filters
            .active_filters(&self.filter_overrides, &HashMap::new())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look up an entity by primary key, consulting the identity map first.
    #[tracing::instrument(level = "debug", skip(self, cx, options), fields(session = %self.config.name))]
    pub async fn find_by_key(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: KeyTuple,
        options: &FindOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Err(e) = self.ensure_open(entity) {
            return Outcome::Err(e);
        }
        let meta = match self.concrete(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        if key.len() != meta.primary_key().columns().len() || !key.is_complete() {
            return Outcome::Err(Error::MissingKey {
                entity: entity.to_string(),
                columns: meta.primary_key().columns().to_vec(),
            });
        }

        if self.config.identity_map_lookups {
            if let Some(cached) = self.identity_map.get(entity, &key) {
                tracing::debug!(key = %key, "Found in identity map");
                if cached.state() == EntityState::Removed {
                    return Outcome::Ok(None);
                }
                let roots = vec![cached];
                return match self.populate_all(cx, &roots, options).await {
                    Outcome::Ok(()) => Outcome::Ok(roots.into_iter().next()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                };
            }
        }

        let criteria = Condition::columns_eq(meta.primary_key().columns(), &key);
        self.find(cx, entity, criteria, options).await
    }

    /// First entity matching `criteria`, or `None`.
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        criteria: Condition,
        options: &FindOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        let options = options.clone().limit(1);
        match self.find_all(cx, entity, criteria, &options).await {
            Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// First entity matching `criteria`; `EntityNotFound` if there is none.
    pub async fn find_one_or_fail(
        &mut self,
        cx: &Cx,
        entity: &str,
        criteria: Condition,
        options: &FindOptions,
    ) -> Outcome<EntityRef, Error> {
        match self.find(cx, entity, criteria, options).await {
            Outcome::Ok(Some(found)) => Outcome::Ok(found),
            Outcome::Ok(None) => Outcome::Err(Error::EntityNotFound {
                entity: entity.to_string(),
                key: None,
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// All entities matching `criteria`.
    #[tracing::instrument(level = "debug", skip(self, cx, criteria, options), fields(session = %self.config.name))]
    pub async fn find_all(
        &mut self,
        cx: &Cx,
        entity: &str,
        criteria: Condition,
        options: &FindOptions,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let (meta, query) = match self.prepare(entity, criteria, options) {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(query = %query, "Executing find");
        let rows = match self.executor.execute(cx, &query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let found = match self.materialize_all(&meta, &rows) {
            Ok(found) => found,
            Err(e) => return Outcome::Err(e),
        };
        match self.populate_all(cx, &found, options).await {
            Outcome::Ok(()) => Outcome::Ok(found),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Matching entities plus the total number of matches.
    ///
    /// The count uses the same filtered criteria as the result but ignores
    /// `limit` and `offset`. Like the result, it leaves out instances marked
    /// for removal in this session.
    #[tracing::instrument(level = "debug", skip(self, cx, criteria, options), fields(session = %self.config.name))]
    pub async fn find_and_count(
        &mut self,
        cx: &Cx,
        entity: &str,
        criteria: Condition,
        options: &FindOptions,
    ) -> Outcome<(Vec<EntityRef>, u64), Error> {
        let (meta, query) = match self.prepare(entity, criteria, options) {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(query = %query, "Executing find and count");
        let rows = match self.executor.execute(cx, &query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut total = match self.executor.count(cx, &query).await {
            Outcome::Ok(total) => total,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let removed = self.removed_keys(&meta);
        if !removed.is_empty() {
            let hidden = query.filter(Condition::KeyIn(meta.primary_key().columns().to_vec(), removed));
            match self.executor.count(cx, &hidden).await {
                Outcome::Ok(n) => total = total.saturating_sub(n),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let found = match self.materialize_all(&meta, &rows) {
            Ok(found) => found,
            Err(e) => return Outcome::Err(e),
        };
        match self.populate_all(cx, &found, options).await {
            Outcome::Ok(()) => Outcome::Ok((found, total)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Compile criteria and options into a filtered query.
    fn prepare(
        &self,
        entity: &str,
        criteria: Condition,
        options: &FindOptions,
    ) -> Result<(Arc<EntityMetadata>, Query)> {
        self.ensure_open(entity)?;
        let meta = self.concrete(entity)?;
        let active = self
            .filters
            .active_filters(&self.filter_overrides, &options.filters);

        let mut query = Query::select(entity).filter(self.expand(&meta, criteria)?);
        query = self
            .filters
            .apply(query, &meta, &active, &self.filter_params)?;

        // A populated owning relation whose target is filtered also filters
        // the roots: rows whose target is hidden are not returned.
        for field in &options.populate {
            let (descriptor, rel) = meta.require_relationship(field)?;
            if !rel.is_owning() {
                continue;
            }
            let target = self.metadata.resolve(&rel.target)?;
            let target_filter = self
                .filters
                .condition_for(&target, &active, &self.filter_params)?;
            if target_filter.is_true() {
                continue;
            }
            let local = rel.local_columns_for(&target)?;
            let related = Condition::Related {
                target: target.name().to_string(),
                join: local
                    .iter()
                    .zip(target.primary_key().columns())
                    .map(|(l, t)| ((*l).to_string(), t.clone()))
                    .collect(),
                condition: Box::new(target_filter),
            };
            let owned = rel
                .join_columns()
                .iter()
                .find(|jc| jc.owned)
                .map(|jc| jc.local.clone());
            let gate = match owned {
                Some(column) if descriptor.nullable => Condition::is_null(column).or(related),
                _ => related,
            };
            query = query.filter(gate);
        }

        for order in &options.order_by {
            query = query.order_by(order.column.clone(), order.direction);
        }
        if let Some(limit) = options.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = options.offset {
            query = query.offset(offset);
        }
        Ok((meta, query))
    }

    /// Rewrite field-level criteria into column conditions.
    fn expand(&self, meta: &EntityMetadata, condition: Condition) -> Result<Condition> {
        Ok(match condition {
            Condition::Field { field, key } => {
                let descriptor = meta.require_field(&field)?;
                match &descriptor.kind {
                    FieldKind::Scalar { column } => {
                        let value = key.values().first().cloned().unwrap_or(Value::Null);
                        if key.len() != 1 {
                            return Err(Error::relationship(
                                meta.name(),
                                &field,
                                format!("scalar field compared with {key}"),
                            ));
                        }
                        if value.is_null() {
                            Condition::is_null(column.clone())
                        } else {
                            Condition::eq(column.clone(), value)
                        }
                    }
                    FieldKind::Reference(rel) => match &rel.side {
                        RelationshipSide::Owning { .. } => {
                            let target = self.metadata.resolve(&rel.target)?;
                            let local = rel.local_columns_for(&target)?;
                            if key.len() != local.len() {
                                return Err(Error::relationship(
                                    meta.name(),
                                    &field,
                                    format!("{} has a {}-column key, got {key}", target.name(), local.len()),
                                ));
                            }
                            Condition::columns_eq(&local, &key)
                        }
                        RelationshipSide::Inverse { .. } => {
                            return Err(Error::relationship(
                                meta.name(),
                                &field,
                                "the inverse side cannot be used as a criterion",
                            ));
                        }
                    },
                }
            }
            Condition::And(parts) => Condition::And(
                parts
                    .into_iter()
                    .map(|p| self.expand(meta, p))
                    .collect::<Result<_>>()?,
            ),
            Condition::Or(parts) => Condition::Or(
                parts
                    .into_iter()
                    .map(|p| self.expand(meta, p))
                    .collect::<Result<_>>()?,
            ),
            Condition::Not(inner) => Condition::Not(Box::new(self.expand(meta, *inner)?)),
            other => other,
        })
    }

    /// Stored keys of tracked instances of `meta` marked for removal.
    fn removed_keys(&self, meta: &EntityMetadata) -> Vec<KeyTuple> {
        self.tracked
            .iter()
            .filter(|e| e.state() == EntityState::Removed && e.entity_type() == meta.name())
            .map(|e| {
                self.tracker
                    .get_snapshot(e.serial())
                    .map_or_else(|| e.key(), |s| s.key().clone())
            })
            .collect()
    }

    fn materialize_all(&mut self, meta: &Arc<EntityMetadata>, rows: &[Row]) -> Result<Vec<EntityRef>> {
        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(entity) = self.materialize(meta, row)? {
                found.push(entity);
            }
        }
        Ok(found)
    }

    /// Turn a row into the session's canonical instance.
    ///
    /// An instance already in the identity map wins over the row, so pending
    /// changes are not overwritten. Instances marked for removal are skipped.
    fn materialize(&mut self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<Option<EntityRef>> {
        let values: Vec<Value> = meta
            .columns()
            .iter()
            .map(|c| row.get_by_name(&c.name).cloned().unwrap_or(Value::Null))
            .collect();
        let key = KeyTuple::new(
            meta.primary_key()
                .columns()
                .iter()
                .map(|c| {
                    meta.column_index(c)
                        .map_or(Value::Null, |i| values[i].clone())
                })
                .collect(),
        );
        if !key.is_complete() {
            return Err(Error::query(
                Some(meta.name()),
                format!("row without a complete primary key: {key}"),
            ));
        }

        let serial = self.next_serial();
        let (meta_c, registry, session_id) = (Arc::clone(meta), Arc::clone(&self.metadata), self.id);
        let (instance, created) = self.identity_map.get_or_create(meta.name(), key, move || {
            let mut data = EntityData::new(meta_c, registry, session_id, serial, EntityState::Managed);
            data.values = values;
            Ok(EntityRef::new(data))
        })?;
        if created {
            self.tracker.snapshot(&instance.read());
            self.tracked.push(instance.clone());
        }
        if instance.state() == EntityState::Removed {
            return Ok(None);
        }
        Ok(Some(instance))
    }

    /// Identity map first, then a filtered query by key.
    async fn fetch_by_key(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: &KeyTuple,
        call_filters: &HashMap<String, bool>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let meta = match self.concrete(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        if !key.is_complete() {
            return Outcome::Err(Error::MissingKey {
                entity: entity.to_string(),
                columns: meta.primary_key().columns().to_vec(),
            });
        }
        if let Some(cached) = self.identity_map.get(entity, key) {
            if cached.state() == EntityState::Removed {
                return Outcome::Ok(None);
            }
            return Outcome::Ok(Some(cached));
        }
        let options = FindOptions {
            filters: call_filters.clone(),
            limit: Some(1),
            ..FindOptions::default()
        };
        let criteria = Condition::columns_eq(meta.primary_key().columns(), key);
        match self.find_all(cx, entity, criteria, &options).await {
            Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn populate_all(
        &mut self,
        cx: &Cx,
        roots: &[EntityRef],
        options: &FindOptions,
    ) -> Outcome<(), Error> {
        if roots.is_empty() {
            return Outcome::Ok(());
        }
        for field in &options.populate {
            match self.populate_with(cx, roots, field, &options.filters).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Load `field` for every root with one query and cache the payloads.
    async fn populate_with(
        &mut self,
        cx: &Cx,
        roots: &[EntityRef],
        field: &str,
        call_filters: &HashMap<String, bool>,
    ) -> Outcome<(), Error> {
        let Some(first) = roots.first() else {
            return Outcome::Ok(());
        };
        let meta = first.metadata();
        let rel = match meta.require_relationship(field) {
            Ok((_, rel)) => rel.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let target = match self.concrete(&rel.target) {
            Ok(target) => target,
            Err(e) => return Outcome::Err(e),
        };
        let active = self
            .filters
            .active_filters(&self.filter_overrides, call_filters);

        match &rel.side {
            RelationshipSide::Owning { .. } => {
                let local: Vec<String> = match rel.local_columns_for(&target) {
                    Ok(local) => local.into_iter().map(str::to_string).collect(),
                    Err(e) => return Outcome::Err(e),
                };
                let mut wanted: Vec<KeyTuple> = Vec::new();
                for root in roots {
                    let key = root.read().project(&local);
                    if key.is_complete() && !wanted.contains(&key) {
                        wanted.push(key);
                    }
                }
                let missing: Vec<KeyTuple> = wanted
                    .iter()
                    .filter(|k| !self.identity_map.contains(target.name(), k))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    let query = Query::select(target.name()).filter(Condition::KeyIn(
                        target.primary_key().columns().to_vec(),
                        missing,
                    ));
                    let query = match self
                        .filters
                        .apply(query, &target, &active, &self.filter_params)
                    {
                        Ok(q) => q,
                        Err(e) => return Outcome::Err(e),
                    };
                    tracing::debug!(query = %query, field, "Populating references");
                    let rows = match self.executor.execute(cx, &query).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    if let Err(e) = self.materialize_all(&target, &rows) {
                        return Outcome::Err(e);
                    }
                }
                for root in roots {
                    let key = root.read().project(&local);
                    if let Some(payload) = self.identity_map.get(target.name(), &key) {
                        if payload.state() != EntityState::Removed {
                            root.cache_loaded(field, &payload);
                        }
                    }
                }
            }
            RelationshipSide::Inverse { mapped_by } => {
                let back = match target.require_relationship(mapped_by) {
                    Ok((_, back)) => back.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                let back_local: Vec<String> = match back.local_columns_for(&meta) {
                    Ok(local) => local.into_iter().map(str::to_string).collect(),
                    Err(e) => return Outcome::Err(e),
                };
                let by_key: HashMap<KeyTuple, EntityRef> = roots
                    .iter()
                    .map(|r| (r.key(), r.clone()))
                    .filter(|(k, _)| k.is_complete())
                    .collect();
                if by_key.is_empty() {
                    return Outcome::Ok(());
                }
                let query = Query::select(target.name()).filter(Condition::KeyIn(
                    back_local.clone(),
                    by_key.keys().cloned().collect(),
                ));
                let query = match self
                    .filters
                    .apply(query, &target, &active, &self.filter_params)
                {
                    Ok(q) => q,
                    Err(e) => return Outcome::Err(e),
                };
                tracing::debug!(query = %query, field, "Populating inverse side");
                let rows = match self.executor.execute(cx, &query).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let owners = match self.materialize_all(&target, &rows) {
                    Ok(owners) => owners,
                    Err(e) => return Outcome::Err(e),
                };
                for owner in owners {
                    let fk = owner.read().project(&back_local);
                    if let Some(root) = by_key.get(&fk) {
                        root.cache_loaded(field, &owner);
                        owner.cache_loaded(mapped_by, root);
                    }
                }
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Unit of Work
    // ========================================================================

    /// Compute the ordered change sets for all tracked instances and keep
    /// them for inspection through [`change_sets`](Self::change_sets).
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.config.name))]
    pub fn compute_change_sets(&mut self) -> Result<Vec<ChangeSet>> {
        self.ensure_open("session")?;
        let plan = FlushPlanner::new(&self.metadata, &self.tracker).plan(&self.tracked)?;
        self.change_sets = plan.change_sets();
        tracing::debug!(count = self.change_sets.len(), "Computed change sets");
        Ok(self.change_sets.clone())
    }

    /// Change sets from the most recent computation or flush.
    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    /// Write all pending changes.
    ///
    /// On success new entities become managed (with generated keys applied),
    /// updated entities are re-snapshotted and deleted entities are detached.
    /// On any failure the transaction is rolled back and no in-memory state
    /// changes, so a retry computes the same change sets.
    #[tracing::instrument(level = "info", skip(self, cx), fields(session = %self.config.name))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.ensure_open("session") {
            return Outcome::Err(e);
        }
        let plan = match FlushPlanner::new(&self.metadata, &self.tracker).plan(&self.tracked) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        self.change_sets = plan.change_sets();
        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
            return Outcome::Ok(FlushResult::default());
        }

        let transactional = self.config.transactional_flush;
        if transactional {
            match self.executor.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let result = match plan.execute(cx, &self.executor).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                tracing::debug!(error = %e, "Flush failed; rolling back");
                self.rollback_quietly(cx, transactional).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.rollback_quietly(cx, transactional).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.rollback_quietly(cx, transactional).await;
                return Outcome::Panicked(p);
            }
        };

        if transactional {
            match self.executor.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.rollback_quietly(cx, transactional).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.rollback_quietly(cx, transactional).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.rollback_quietly(cx, transactional).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        self.apply_flush(&plan, &result);
        Outcome::Ok(result)
    }

    async fn rollback_quietly(&self, cx: &Cx, transactional: bool) {
        if !transactional {
            return;
        }
        match self.executor.rollback(cx).await {
            Outcome::Ok(()) => tracing::debug!("Rolled back flush transaction"),
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback after failed flush also failed"),
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                tracing::warn!("Rollback after failed flush did not complete");
            }
        }
    }

    /// Transition tracked state after a committed flush.
    ///
    /// Old identities are released before new ones are registered, so keys
    /// swapped within one flush resolve cleanly. An instance still displaced
    /// from the identity map no longer matches the committed rows and is
    /// detached.
    fn apply_flush(&mut self, plan: &FlushPlan, result: &FlushResult) {
        for (pos, write) in plan.writes().iter().enumerate() {
            if write.change_set.is_insert() {
                let mut data = write.entity.write();
                for (column, value) in result.generated.get(pos).into_iter().flatten() {
                    data.set_column(column, value.clone());
                }
            }
        }
        for binding in plan.bindings() {
            let parent = &plan.writes()[binding.parent].entity;
            let child = &plan.writes()[binding.child].entity;
            for (child_column, parent_column) in &binding.columns {
                let value = parent.column(parent_column).unwrap_or(Value::Null);
                child.write().set_column(child_column, value);
            }
        }

        let mut register = Vec::new();
        for write in plan.writes() {
            let entity = &write.entity;
            let cs = &write.change_set;
            match cs.operation {
                Operation::Insert => {
                    entity.set_state(EntityState::Managed);
                    register.push(entity);
                }
                Operation::Update => {
                    if entity.key() != cs.key {
                        self.identity_map.release(entity, &cs.key);
                        register.push(entity);
                    }
                }
                Operation::Delete => {
                    self.identity_map.release(entity, &cs.key);
                    self.tracker.forget(entity.serial());
                    entity.set_state(EntityState::Detached);
                }
            }
        }
        for entity in register {
            if let Some(displaced) = self.identity_map.replace(entity) {
                tracing::warn!(
                    entity = %displaced.entity_type(),
                    key = %displaced.key(),
                    "Flushed write displaced a tracked instance; detaching it"
                );
                self.tracker.forget(displaced.serial());
                displaced.set_state(EntityState::Detached);
            }
        }
        for write in plan.writes() {
            if write.entity.state() != EntityState::Managed {
                continue;
            }
            self.tracker.snapshot(&write.entity.read());
        }
        self.tracked.retain(|e| e.state() != EntityState::Detached);
    }

    /// Detach every tracked instance and drop the identity map and snapshots.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.config.name))]
    pub fn clear(&mut self) {
        let mut detached = 0;
        for entity in self.tracked.drain(..).chain(self.identity_map.clear()) {
            if entity.state() != EntityState::Detached {
                entity.set_state(EntityState::Detached);
                detached += 1;
            }
        }
        self.tracker.clear_all();
        self.change_sets.clear();
        tracing::debug!(detached, "Session cleared");
    }

    /// Clear the session and refuse further use.
    pub fn close(&mut self) {
        self.clear();
        self.closed = true;
        tracing::debug!(session = %self.config.name, "Session closed");
    }
}

impl<E: Executor> Drop for Session<E> {
    fn drop(&mut self) {
        if !self.closed {
            self.clear();
        }
    }
}

impl<E: Executor> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("tracked", &self.tracked.len())
            .field("identity_map", &self.identity_map.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
