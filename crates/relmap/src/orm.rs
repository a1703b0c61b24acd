//! One-stop configuration of an entity manager.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmap::prelude::*;
//!
//! let (factory, db) = Orm::builder()
//!     .name("orm-a")
//!     .entity(EntityDescriptor::new("User").field(FieldDescriptor::scalar("id").primary_key()))
//!     .filter(FilterDef::new("softDelete", Condition::is_null("deleted_at")))
//!     .build_in_memory()?;
//!
//! let mut session = factory.fork();
//! ```

use relmap_core::metadata::{EntityDescriptor, MetadataRegistry};
use relmap_core::{Executor, Result};
use relmap_memory::{MemoryDatabase, MemoryExecutor};
use relmap_session::{FilterDef, FilterRegistry, SessionConfig, SessionFactory};

/// Entry point for building a [`SessionFactory`].
#[derive(Debug, Clone, Copy)]
pub struct Orm;

impl Orm {
    pub fn builder() -> OrmBuilder {
        OrmBuilder::new()
    }
}

/// Collects entities, filters and session configuration.
///
/// Entities are registered in the order given; an abstract base must come
/// before the entities that extend it.
#[derive(Debug, Clone, Default)]
pub struct OrmBuilder {
    entities: Vec<EntityDescriptor>,
    filters: Vec<FilterDef>,
    config: SessionConfig,
}

impl OrmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity descriptor.
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Add several entity descriptors.
    pub fn entities<I: IntoIterator<Item = EntityDescriptor>>(mut self, descriptors: I) -> Self {
        self.entities.extend(descriptors);
        self
    }

    /// Add a filter definition.
    pub fn filter(mut self, filter: FilterDef) -> Self {
        self.filters.push(filter);
        self
    }

    /// Context name of the sessions the factory forks.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replace the whole session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    fn registries(self) -> Result<(MetadataRegistry, FilterRegistry, SessionConfig)> {
        let mut registry = MetadataRegistry::new();
        for descriptor in self.entities {
            registry.register(descriptor)?;
        }
        let mut filters = FilterRegistry::new();
        for filter in self.filters {
            filters.register(filter)?;
        }
        Ok((registry, filters, self.config))
    }

    /// Validate the configuration and build a factory over `executor`.
    #[tracing::instrument(level = "debug", skip(self, executor), fields(name = %self.config.name))]
    pub fn build<E: Executor + Clone>(self, executor: E) -> Result<SessionFactory<E>> {
        let (registry, filters, config) = self.registries()?;
        tracing::debug!(entities = registry.entities().count(), filters = filters.len(), "Building session factory");
        Ok(SessionFactory::new(registry, filters, executor)?.with_config(config))
    }

    /// Build a factory over a fresh in-memory database, returning both.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.config.name))]
    pub fn build_in_memory(self) -> Result<(SessionFactory<MemoryExecutor>, MemoryDatabase)> {
        let (registry, filters, config) = self.registries()?;
        let db = MemoryDatabase::new(&registry);
        let factory = SessionFactory::new(registry, filters, db.executor())?.with_config(config);
        Ok((factory, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::Error;
    use relmap_core::metadata::FieldDescriptor;

    #[test]
    fn test_builder_sets_context_name() {
        let (factory, db) = Orm::builder()
            .name("orm-a")
            .entity(EntityDescriptor::new("Tag").field(FieldDescriptor::scalar("id").primary_key()))
            .build_in_memory()
            .unwrap();
        assert_eq!(factory.name(), "orm-a");
        assert_eq!(factory.fork().name(), "orm-a");
        assert_eq!(db.row_count("Tag"), 0);
    }

    #[test]
    fn test_builder_rejects_dangling_relationship() {
        let err = Orm::builder()
            .entity(
                EntityDescriptor::new("Book")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(
                        FieldDescriptor::reference(
                            "author",
                            relmap_core::RelationshipKind::ManyToOne,
                            "Author",
                        )
                        .join("author_id", "id"),
                    ),
            )
            .build_in_memory()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntity { .. } | Error::Metadata(_)));
    }
}
