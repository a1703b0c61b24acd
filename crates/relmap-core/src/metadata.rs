//! Entity metadata: field, key and relationship descriptors and the registry
//! that flattens abstract base entities into their concrete subtypes.
//!
//! Every entity is stored physically as a set of columns. Scalar fields map to
//! one column each; an owning-side reference maps to its join columns. Join
//! columns may be shared between several references of the same entity (a
//! composite foreign key that overlaps the entity's own composite primary key),
//! in which case the reference is a projection over columns other fields also
//! read, not a separate copy.
//!
//! # Example
//!
//! ```
//! use relmap_core::metadata::*;
//!
//! let mut registry = MetadataRegistry::new();
//! registry.register(
//!     EntityDescriptor::new("Organisation")
//!         .field(FieldDescriptor::scalar("id").primary_key())
//!         .field(FieldDescriptor::scalar("name")),
//! )?;
//! registry.register(
//!     EntityDescriptor::abstract_entity("OrgEntity")
//!         .field(
//!             FieldDescriptor::reference("org", RelationshipKind::ManyToOne, "Organisation")
//!                 .join("org_id", "id")
//!                 .primary_key()
//!                 .delete_rule(DeleteRule::Cascade),
//!         )
//!         .field(FieldDescriptor::scalar("id").primary_key()),
//! )?;
//! let author = registry.register(
//!     EntityDescriptor::new("Author")
//!         .extends("OrgEntity")
//!         .field(FieldDescriptor::scalar("name")),
//! )?;
//! assert_eq!(author.primary_key().columns(), ["org_id", "id"]);
//! # Ok::<(), relmap_core::Error>(())
//! ```

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| panic!("identifier regex: {e}"))
});

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(Error::Metadata(format!("invalid {kind} name '{name}'")))
    }
}

/// Cardinality of a to-one relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many rows of this entity point at one target.
    ManyToOne,
    /// At most one row of this entity points at a given target.
    OneToOne,
}

/// What happens to dependents when the referenced row is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRule {
    /// Raise an error in the backend if any references exist.
    #[default]
    NoAction,
    /// Remove dependents together with the referenced row.
    Cascade,
    /// Clear the referencing columns.
    SetNull,
}

/// One column of a foreign key: a local column paired with a primary-key
/// column of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    /// Column on the owning entity.
    pub local: String,
    /// Primary-key column on the target entity.
    pub target: String,
    /// Whether assigning the reference writes this column. Columns that are
    /// also part of another field (typically the owner's own primary key) are
    /// not owned and are only read.
    pub owned: bool,
}

/// Which side of the relationship stores the foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipSide {
    /// This entity stores the foreign key in its join columns.
    Owning {
        /// Join column mapping, one entry per target primary-key column.
        join: Vec<JoinColumn>,
    },
    /// The target stores the foreign key; resolved by querying the target.
    Inverse {
        /// Name of the owning reference field on the target.
        mapped_by: String,
    },
}

/// Relationship metadata for a reference field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub kind: RelationshipKind,
    /// Target entity type name.
    pub target: String,
    pub side: RelationshipSide,
    pub delete_rule: DeleteRule,
    /// Abstract base entity the relationship was declared on, if inherited.
    pub inherited_from: Option<String>,
}

impl RelationshipDescriptor {
    /// Is this the side that stores the foreign key?
    pub fn is_owning(&self) -> bool {
        matches!(self.side, RelationshipSide::Owning { .. })
    }

    /// Join columns for the owning side; empty for the inverse side.
    pub fn join_columns(&self) -> &[JoinColumn] {
        match &self.side {
            RelationshipSide::Owning { join } => join,
            RelationshipSide::Inverse { .. } => &[],
        }
    }

    /// The owning field on the target, for the inverse side.
    pub fn mapped_by(&self) -> Option<&str> {
        match &self.side {
            RelationshipSide::Inverse { mapped_by } => Some(mapped_by),
            RelationshipSide::Owning { .. } => None,
        }
    }

    /// Local join columns ordered by the target's primary-key column order.
    ///
    /// Reading these columns from the owner yields the target's key tuple.
    pub fn local_columns_for(&self, target: &EntityMetadata) -> Result<Vec<&str>> {
        let join = self.join_columns();
        target
            .primary_key()
            .columns()
            .iter()
            .map(|pk_col| {
                join.iter()
                    .find(|jc| &jc.target == pk_col)
                    .map(|jc| jc.local.as_str())
                    .ok_or_else(|| {
                        Error::Metadata(format!(
                            "join to {} does not cover primary-key column '{pk_col}'",
                            target.name()
                        ))
                    })
            })
            .collect()
    }
}

/// Scalar field or reference field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar {
        /// Backing column name.
        column: String,
    },
    Reference(RelationshipDescriptor),
}

/// A declared field of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub unique: bool,
    /// Value assigned by the backend on insert (auto-increment key).
    pub generated: bool,
    pub primary_key: bool,
    /// Abstract base entity this field was declared on, if inherited.
    pub inherited_from: Option<String>,
}

impl FieldDescriptor {
    /// A scalar field stored in a column of the same name.
    pub fn scalar(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: FieldKind::Scalar {
                column: name.clone(),
            },
            name,
            nullable: false,
            unique: false,
            generated: false,
            primary_key: false,
            inherited_from: None,
        }
    }

    /// An owning-side reference; add join columns with [`join`](Self::join)
    /// and [`join_shared`](Self::join_shared).
    pub fn reference(
        name: impl Into<String>,
        kind: RelationshipKind,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Reference(RelationshipDescriptor {
                kind,
                target: target.into(),
                side: RelationshipSide::Owning { join: Vec::new() },
                delete_rule: DeleteRule::NoAction,
                inherited_from: None,
            }),
            nullable: false,
            unique: false,
            generated: false,
            primary_key: false,
            inherited_from: None,
        }
    }

    /// An inverse-side reference resolved through `mapped_by` on the target.
    /// Inverse references are always optional.
    pub fn inverse(
        name: impl Into<String>,
        kind: RelationshipKind,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Reference(RelationshipDescriptor {
                kind,
                target: target.into(),
                side: RelationshipSide::Inverse {
                    mapped_by: mapped_by.into(),
                },
                delete_rule: DeleteRule::NoAction,
                inherited_from: None,
            }),
            nullable: true,
            unique: false,
            generated: false,
            primary_key: false,
            inherited_from: None,
        }
    }

    fn push_join(mut self, local: impl Into<String>, target: impl Into<String>, owned: bool) -> Self {
        if let FieldKind::Reference(RelationshipDescriptor {
            side: RelationshipSide::Owning { join },
            ..
        }) = &mut self.kind
        {
            join.push(JoinColumn {
                local: local.into(),
                target: target.into(),
                owned,
            });
        }
        self
    }

    /// Add a join column written by this reference.
    pub fn join(self, local: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_join(local, target, true)
    }

    /// Add a join column owned by another field and only read by this one.
    pub fn join_shared(self, local: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_join(local, target, false)
    }

    /// Override the backing column of a scalar field.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        if let FieldKind::Scalar { column: c } = &mut self.kind {
            *c = column.into();
        }
        self
    }

    /// Mark the field as part of the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Allow NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the field unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the value as generated by the backend on insert.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Set the delete rule of a reference field.
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        if let FieldKind::Reference(rel) = &mut self.kind {
            rel.delete_rule = rule;
        }
        self
    }

    /// Relationship metadata, if this is a reference field.
    pub fn relationship(&self) -> Option<&RelationshipDescriptor> {
        match &self.kind {
            FieldKind::Reference(rel) => Some(rel),
            FieldKind::Scalar { .. } => None,
        }
    }

    /// Backing column of a scalar field.
    pub fn scalar_column(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Scalar { column } => Some(column),
            FieldKind::Reference(_) => None,
        }
    }

    /// Columns this field reads, in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        match &self.kind {
            FieldKind::Scalar { column } => vec![column.as_str()],
            FieldKind::Reference(rel) => rel.join_columns().iter().map(|j| j.local.as_str()).collect(),
        }
    }
}

/// A physical column derived from the entity's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Field that writes this column.
    pub owner: String,
    pub nullable: bool,
    pub unique: bool,
    pub generated: bool,
    pub primary_key: bool,
}

/// Ordered primary-key composition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryKeyDescriptor {
    fields: Vec<String>,
    columns: Vec<String>,
}

impl PrimaryKeyDescriptor {
    /// Key fields in positional order (base-declared first).
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Key columns in positional order; defines the key-tuple layout.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Declarative description of an entity, as handed to the registry.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    name: String,
    is_abstract: bool,
    extends: Option<String>,
    fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    /// A concrete entity type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_abstract: false,
            extends: None,
            fields: Vec::new(),
        }
    }

    /// An abstract base whose fields and key are merged into subtypes.
    pub fn abstract_entity(name: impl Into<String>) -> Self {
        Self {
            is_abstract: true,
            ..Self::new(name)
        }
    }

    /// Inherit fields and primary-key components from a registered base.
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.extends = Some(base.into());
        self
    }

    /// Declare a field.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }
}

/// Flattened, immutable metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    name: String,
    is_abstract: bool,
    ancestors: Vec<String>,
    fields: Vec<FieldDescriptor>,
    field_index: HashMap<String, usize>,
    primary_key: PrimaryKeyDescriptor,
    columns: Vec<ColumnDescriptor>,
}

impl EntityMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Base entities, nearest first.
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// All fields, inherited ones first.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.field_index.get(name).map(|&i| &self.fields[i])
    }

    /// Look up a field, failing with a relationship error naming this entity.
    pub fn require_field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.field(name)
            .ok_or_else(|| Error::relationship(&self.name, name, "no such field"))
    }

    /// Look up a reference field and its relationship.
    pub fn require_relationship(
        &self,
        name: &str,
    ) -> Result<(&FieldDescriptor, &RelationshipDescriptor)> {
        let field = self.require_field(name)?;
        let rel = field
            .relationship()
            .ok_or_else(|| Error::relationship(&self.name, name, "not a reference field"))?;
        Ok((field, rel))
    }

    pub fn primary_key(&self) -> &PrimaryKeyDescriptor {
        &self.primary_key
    }

    /// Physical columns in declaration order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column in [`columns`](Self::columns).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Reference fields (owning and inverse).
    pub fn relationships(&self) -> impl Iterator<Item = (&FieldDescriptor, &RelationshipDescriptor)> {
        self.fields
            .iter()
            .filter_map(|f| f.relationship().map(|r| (f, r)))
    }

    /// Owning-side reference fields.
    pub fn owning_references(
        &self,
    ) -> impl Iterator<Item = (&FieldDescriptor, &RelationshipDescriptor)> {
        self.relationships().filter(|(_, r)| r.is_owning())
    }
}

/// Registry of entity metadata.
///
/// Inheritance is resolved once, at registration: a base must be registered
/// before any subtype that extends it.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
    order: Vec<String>,
}

impl MetadataRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity descriptor, merging in its base entity.
    #[tracing::instrument(level = "debug", skip(self, descriptor), fields(entity = %descriptor.name))]
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<Arc<EntityMetadata>> {
        check_identifier("entity", &descriptor.name)?;
        if self.entities.contains_key(&descriptor.name) {
            return Err(Error::Metadata(format!(
                "entity '{}' is already registered",
                descriptor.name
            )));
        }
        for field in &descriptor.fields {
            check_identifier("field", &field.name)?;
            for column in field.columns() {
                check_identifier("column", column)?;
            }
            if let Some(rel) = field.relationship() {
                if rel.is_owning() && rel.join_columns().is_empty() {
                    return Err(Error::Metadata(format!(
                        "{}.{} declares no join columns",
                        descriptor.name, field.name
                    )));
                }
                if !rel.is_owning() && field.primary_key {
                    return Err(Error::Metadata(format!(
                        "{}.{}: inverse side cannot be part of the primary key",
                        descriptor.name, field.name
                    )));
                }
            }
        }

        let (mut fields, ancestors) = match &descriptor.extends {
            Some(base) => {
                let base_meta = self.resolve(base)?;
                if !base_meta.is_abstract() {
                    return Err(Error::Metadata(format!(
                        "{} extends concrete entity {base}",
                        descriptor.name
                    )));
                }
                let fields: Vec<FieldDescriptor> = base_meta
                    .fields()
                    .iter()
                    .cloned()
                    .map(|mut f| {
                        let origin = f.inherited_from.clone().unwrap_or_else(|| base.clone());
                        f.inherited_from = Some(origin.clone());
                        if let FieldKind::Reference(rel) = &mut f.kind {
                            rel.inherited_from = Some(origin);
                        }
                        f
                    })
                    .collect();
                let mut ancestors = vec![base.clone()];
                ancestors.extend(base_meta.ancestors().iter().cloned());
                (fields, ancestors)
            }
            None => (Vec::new(), Vec::new()),
        };

        for field in descriptor.fields {
            match fields.iter().position(|f| f.name == field.name) {
                Some(i) => fields[i] = field,
                None => fields.push(field),
            }
        }

        let meta = build_metadata(descriptor.name, descriptor.is_abstract, ancestors, fields)?;
        tracing::debug!(
            fields = meta.fields.len(),
            key = ?meta.primary_key.columns,
            "Registered entity"
        );
        let meta = Arc::new(meta);
        self.order.push(meta.name.clone());
        self.entities.insert(meta.name.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    /// Resolve metadata by entity type name.
    pub fn resolve(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity {
                entity: entity.to_string(),
            })
    }

    /// Whether an entity type is registered.
    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Registered metadata in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.order.iter().filter_map(|n| self.entities.get(n))
    }

    /// Cross-entity checks that need every type registered: relationship
    /// targets exist, joins cover the target key, `mapped_by` points back at
    /// an owning reference, and concrete entities have a primary key.
    pub fn validate(&self) -> Result<()> {
        for meta in self.entities() {
            if meta.is_abstract() {
                continue;
            }
            if meta.primary_key().columns().is_empty() {
                return Err(Error::Metadata(format!(
                    "{} has no primary key",
                    meta.name()
                )));
            }
            for (field, rel) in meta.relationships() {
                let target = self.resolve(&rel.target)?;
                if target.is_abstract() {
                    return Err(Error::Metadata(format!(
                        "{}.{} targets abstract entity {}",
                        meta.name(),
                        field.name,
                        target.name()
                    )));
                }
                match &rel.side {
                    RelationshipSide::Owning { join } => {
                        if join.len() != target.primary_key().columns().len() {
                            return Err(Error::Metadata(format!(
                                "{}.{} joins {} columns but {} has a {}-column key",
                                meta.name(),
                                field.name,
                                join.len(),
                                target.name(),
                                target.primary_key().columns().len()
                            )));
                        }
                        rel.local_columns_for(&target)?;
                    }
                    RelationshipSide::Inverse { mapped_by } => {
                        let (_, back) = target.require_relationship(mapped_by)?;
                        if !back.is_owning() || back.target != meta.name() {
                            return Err(Error::Metadata(format!(
                                "{}.{} is mapped by {}.{mapped_by}, which is not an owning reference to {}",
                                meta.name(),
                                field.name,
                                target.name(),
                                meta.name()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn build_metadata(
    name: String,
    is_abstract: bool,
    ancestors: Vec<String>,
    fields: Vec<FieldDescriptor>,
) -> Result<EntityMetadata> {
    let mut field_index = HashMap::new();
    for (i, f) in fields.iter().enumerate() {
        field_index.insert(f.name.clone(), i);
    }

    let mut columns: Vec<ColumnDescriptor> = Vec::new();
    for field in &fields {
        match &field.kind {
            FieldKind::Scalar { column } => {
                if columns.iter().any(|c| &c.name == column) {
                    return Err(Error::Metadata(format!(
                        "{name}: column '{column}' is mapped twice"
                    )));
                }
                columns.push(ColumnDescriptor {
                    name: column.clone(),
                    owner: field.name.clone(),
                    nullable: field.nullable,
                    unique: field.unique,
                    generated: field.generated,
                    primary_key: field.primary_key,
                });
            }
            FieldKind::Reference(rel) => {
                for jc in rel.join_columns() {
                    if let Some(existing) = columns.iter_mut().find(|c| c.name == jc.local) {
                        existing.nullable &= field.nullable;
                        existing.primary_key |= field.primary_key;
                        if jc.owned {
                            if existing.owner.is_empty() {
                                existing.owner = field.name.clone();
                            } else if existing.owner != field.name {
                                return Err(Error::Metadata(format!(
                                    "{name}: column '{}' is owned by both {} and {}",
                                    jc.local, existing.owner, field.name
                                )));
                            }
                        }
                    } else {
                        columns.push(ColumnDescriptor {
                            name: jc.local.clone(),
                            owner: if jc.owned { field.name.clone() } else { String::new() },
                            nullable: field.nullable,
                            unique: field.unique,
                            generated: false,
                            primary_key: field.primary_key,
                        });
                    }
                }
            }
        }
    }
    if let Some(orphan) = columns.iter().find(|c| c.owner.is_empty()) {
        return Err(Error::Metadata(format!(
            "{name}: shared column '{}' is not owned by any field",
            orphan.name
        )));
    }

    let mut key_fields = Vec::new();
    let mut key_columns = Vec::new();
    let mut seen = HashSet::new();
    for field in fields.iter().filter(|f| f.primary_key) {
        key_fields.push(field.name.clone());
        for column in field.columns() {
            if seen.insert(column.to_string()) {
                key_columns.push(column.to_string());
            }
        }
    }

    Ok(EntityMetadata {
        name,
        is_abstract,
        ancestors,
        fields,
        field_index,
        primary_key: PrimaryKeyDescriptor {
            fields: key_fields,
            columns: key_columns,
        },
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org_registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry
            .register(
                EntityDescriptor::new("Organisation")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(FieldDescriptor::scalar("name")),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::abstract_entity("OrgEntity")
                    .field(
                        FieldDescriptor::reference("org", RelationshipKind::ManyToOne, "Organisation")
                            .join("org_id", "id")
                            .primary_key()
                            .delete_rule(DeleteRule::Cascade),
                    )
                    .field(FieldDescriptor::scalar("id").primary_key()),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Author")
                    .extends("OrgEntity")
                    .field(FieldDescriptor::scalar("name"))
                    .field(FieldDescriptor::inverse(
                        "book",
                        RelationshipKind::OneToOne,
                        "Book",
                        "author",
                    )),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Book")
                    .extends("OrgEntity")
                    .field(FieldDescriptor::scalar("name"))
                    .field(
                        FieldDescriptor::reference("author", RelationshipKind::OneToOne, "Author")
                            .join_shared("org_id", "org_id")
                            .join("author_id", "id"),
                    ),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_base_key_fields_precede_subtype_fields() {
        let registry = org_registry();
        let book = registry.resolve("Book").unwrap();
        assert_eq!(book.primary_key().fields(), ["org", "id"]);
        assert_eq!(book.primary_key().columns(), ["org_id", "id"]);
        let names: Vec<&str> = book.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["org", "id", "name", "author"]);
    }

    #[test]
    fn test_inherited_fields_record_origin() {
        let registry = org_registry();
        let author = registry.resolve("Author").unwrap();
        let org = author.field("org").unwrap();
        assert_eq!(org.inherited_from.as_deref(), Some("OrgEntity"));
        assert_eq!(
            org.relationship().unwrap().inherited_from.as_deref(),
            Some("OrgEntity")
        );
        assert_eq!(author.ancestors(), ["OrgEntity"]);
        assert!(author.field("name").unwrap().inherited_from.is_none());
    }

    #[test]
    fn test_shared_join_column_is_not_duplicated() {
        let registry = org_registry();
        let book = registry.resolve("Book").unwrap();
        let cols: Vec<&str> = book.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cols, vec!["org_id", "id", "name", "author_id"]);
        assert_eq!(book.column("org_id").unwrap().owner, "org");
        assert_eq!(book.column("author_id").unwrap().owner, "author");
    }

    #[test]
    fn test_local_columns_follow_target_key_order() {
        let registry = org_registry();
        let book = registry.resolve("Book").unwrap();
        let author = registry.resolve("Author").unwrap();
        let (_, rel) = book.require_relationship("author").unwrap();
        assert_eq!(rel.local_columns_for(&author).unwrap(), vec!["org_id", "author_id"]);
    }

    #[test]
    fn test_validate_accepts_consistent_graph() {
        org_registry().validate().unwrap();
    }

    #[test]
    fn test_unknown_entity() {
        let registry = org_registry();
        let err = registry.resolve("Publisher").unwrap_err();
        assert!(matches!(err, Error::UnknownEntity { ref entity } if entity == "Publisher"));
    }

    #[test]
    fn test_subtype_requires_registered_base() {
        let mut registry = MetadataRegistry::new();
        let err = registry
            .register(EntityDescriptor::new("Book").extends("OrgEntity"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntity { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_mapped_by() {
        let mut registry = org_registry();
        registry
            .register(
                EntityDescriptor::new("Shelf")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(FieldDescriptor::inverse(
                        "book",
                        RelationshipKind::OneToOne,
                        "Book",
                        "name",
                    )),
            )
            .unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let mut registry = MetadataRegistry::new();
        let err = registry
            .register(EntityDescriptor::new("Bad Name"))
            .unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = org_registry();
        assert!(
            registry
                .register(EntityDescriptor::new("Organisation"))
                .is_err()
        );
    }
}
