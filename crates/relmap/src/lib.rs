//! relmap - an entity manager with identity map, unit of work and filtered
//! relationship loading.
//!
//! relmap provides:
//!
//! - Declarative entity metadata with abstract-base flattening and composite keys
//! - A per-session identity map: one instance per primary key
//! - Two-state references that resolve composite foreign keys from live columns
//! - Snapshot-based change tracking with dependency-ordered flushes
//! - Named filters (such as soft delete) that also gate relationship loading
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! async fn example(cx: &Cx) -> Result<()> {
//!     let (factory, _db) = Orm::builder()
//!         .entity(
//!             EntityDescriptor::new("User")
//!                 .field(FieldDescriptor::scalar("id").primary_key().generated())
//!                 .field(FieldDescriptor::scalar("name"))
//!                 .field(FieldDescriptor::scalar("deleted_at").nullable()),
//!         )
//!         .filter(FilterDef::new("softDelete", Condition::is_null("deleted_at")))
//!         .build_in_memory()?;
//!
//!     let mut session = factory.fork();
//!     let user = session.create("User", Fields::new().set("name", "Ada"))?;
//!     session.flush(cx).await;
//!
//!     session.clear();
//!     let again = session
//!         .find_by_key(cx, "User", user.key(), &FindOptions::new())
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! # Crates
//!
//! - `relmap-core`: values, metadata, queries, change sets, the `Executor` trait
//! - `relmap-session`: the session and everything it tracks
//! - `relmap-memory`: an in-memory executor

pub use relmap_core::metadata::{
    DeleteRule, EntityDescriptor, EntityMetadata, FieldDescriptor, FieldKind, JoinColumn,
    MetadataRegistry, RelationshipDescriptor, RelationshipKind, RelationshipSide,
};
pub use relmap_core::{
    ChangeSet, Condition, Cx, Direction, Error, Executor, FieldChange, KeyTuple, Operand,
    Operation, OrderBy, Outcome, Projection, Query, Result, Row, Value, WriteOutcome,
};

pub use relmap_session::{
    EntityRef, FieldValue, Fields, FilterDef, FilterRegistry, FindOptions, FlushResult,
    LifecycleState, Reference, RequestContext, Session, SessionConfig, SessionFactory,
    SessionHandle,
};

pub use relmap_memory::{MemoryDatabase, MemoryExecutor};

pub mod orm;
pub use orm::{Orm, OrmBuilder};

/// Common imports for working with relmap.
pub mod prelude {
    pub use crate::{
        Condition,
        Cx,
        DeleteRule,
        Direction,
        EntityDescriptor,
        EntityRef,
        Error,
        Executor,
        FieldDescriptor,
        Fields,
        FilterDef,
        FindOptions,
        KeyTuple,
        LifecycleState,
        MemoryDatabase,
        Orm,
        Outcome,
        Reference,
        RelationshipKind,
        RequestContext,
        Result,
        Row,
        Session,
        SessionConfig,
        SessionFactory,
        Value,
    };
}
