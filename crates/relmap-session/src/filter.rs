//! Named, toggleable query filters.
//!
//! A filter is a condition template ANDed into every query against the
//! entities it applies to, including the queries issued to populate or load
//! relationships. Templates may reference named parameters that each session
//! binds before use.
//!
//! A filter restricted to a list of entities applies to those entities only.
//! An unrestricted filter applies to every entity that has all the columns
//! its condition mentions, so a global soft-delete filter skips entities
//! without a `deleted_at` column.

use relmap_core::metadata::EntityMetadata;
use relmap_core::{Condition, Error, Query, Result, Value};
use std::collections::{BTreeSet, HashMap};

/// A registered filter.
#[derive(Debug, Clone)]
pub struct FilterDef {
    name: String,
    condition: Condition,
    entities: Option<Vec<String>>,
    default_enabled: bool,
}

impl FilterDef {
    /// A filter that is enabled by default and applies wherever its columns
    /// exist.
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            condition,
            entities: None,
            default_enabled: true,
        }
    }

    /// Restrict the filter to the given entity types.
    pub fn entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    /// Set whether the filter is active unless explicitly toggled.
    pub fn default_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn is_default_enabled(&self) -> bool {
        self.default_enabled
    }

    /// Whether this filter constrains queries against `meta`.
    pub fn applies_to(&self, meta: &EntityMetadata) -> bool {
        match &self.entities {
            Some(list) => list
                .iter()
                .any(|e| e == meta.name() || meta.ancestors().contains(e)),
            None => {
                let mut columns = Vec::new();
                collect_columns(&self.condition, &mut columns);
                columns.iter().all(|c| meta.column(c).is_some())
            }
        }
    }
}

fn collect_columns<'a>(condition: &'a Condition, out: &mut Vec<&'a str>) {
    match condition {
        Condition::Eq(c, _)
        | Condition::Ne(c, _)
        | Condition::In(c, _)
        | Condition::IsNull(c)
        | Condition::IsNotNull(c) => out.push(c),
        Condition::KeyIn(cols, _) => out.extend(cols.iter().map(String::as_str)),
        Condition::And(parts) | Condition::Or(parts) => {
            for p in parts {
                collect_columns(p, out);
            }
        }
        Condition::Not(inner) => collect_columns(inner, out),
        Condition::Related { join, .. } => out.extend(join.iter().map(|(l, _)| l.as_str())),
        Condition::Field { field, .. } => out.push(field),
        Condition::True => {}
    }
}

/// Registry of filter definitions, shared by all sessions of a factory.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: Vec<FilterDef>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter. Names must be unique.
    #[tracing::instrument(level = "debug", skip(self, filter), fields(filter = %filter.name))]
    pub fn register(&mut self, filter: FilterDef) -> Result<()> {
        if self.get(&filter.name).is_some() {
            return Err(Error::filter(&filter.name, "already registered"));
        }
        tracing::debug!(
            default_enabled = filter.default_enabled,
            condition = %filter.condition,
            "Registered filter"
        );
        self.filters.push(filter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FilterDef> {
        self.filters.iter().find(|f| f.name == name)
    }

    /// Look up a filter, failing with `Filter` for unknown names.
    pub fn require(&self, name: &str) -> Result<&FilterDef> {
        self.get(name)
            .ok_or_else(|| Error::filter(name, "no such filter"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterDef> {
        self.filters.iter()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Names of the filters in effect given session-level and per-call
    /// toggles. Per-call toggles win over session toggles, which win over
    /// each filter's default.
    pub fn active_filters(
        &self,
        session: &HashMap<String, bool>,
        call: &HashMap<String, bool>,
    ) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter(|f| {
                call.get(&f.name)
                    .or_else(|| session.get(&f.name))
                    .copied()
                    .unwrap_or(f.default_enabled)
            })
            .map(|f| f.name.clone())
            .collect()
    }

    /// Combined, parameter-bound condition of the active filters that apply
    /// to `meta`. `Condition::True` when none apply.
    pub fn condition_for(
        &self,
        meta: &EntityMetadata,
        active: &BTreeSet<String>,
        params: &HashMap<String, Value>,
    ) -> Result<Condition> {
        let mut combined = Condition::True;
        for filter in self
            .filters
            .iter()
            .filter(|f| active.contains(&f.name) && f.applies_to(meta))
        {
            let bound = filter.condition.bind(params).map_err(|param| {
                Error::filter(&filter.name, format!("parameter '{param}' is not set"))
            })?;
            combined = combined.and(bound);
        }
        Ok(combined)
    }

    /// AND the applicable active filters into `query`.
    pub fn apply(
        &self,
        query: Query,
        meta: &EntityMetadata,
        active: &BTreeSet<String>,
        params: &HashMap<String, Value>,
    ) -> Result<Query> {
        let condition = self.condition_for(meta, active, params)?;
        if condition.is_true() {
            return Ok(query);
        }
        tracing::trace!(entity = meta.name(), filter = %condition, "Applying filters");
        Ok(query.filter(condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::metadata::{EntityDescriptor, FieldDescriptor, MetadataRegistry};

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry
            .register(
                EntityDescriptor::new("User")
                    .field(FieldDescriptor::scalar("id").primary_key())
                    .field(FieldDescriptor::scalar("tenant_id"))
                    .field(FieldDescriptor::scalar("deleted_at").nullable()),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Tag").field(FieldDescriptor::scalar("id").primary_key()),
            )
            .unwrap();
        registry
    }

    fn filters() -> FilterRegistry {
        let mut filters = FilterRegistry::new();
        filters
            .register(FilterDef::new("softDelete", Condition::is_null("deleted_at")))
            .unwrap();
        filters
            .register(
                FilterDef::new("tenant", Condition::eq_param("tenant_id", "tenant"))
                    .entities(["User"])
                    .default_enabled(false),
            )
            .unwrap();
        filters
    }

    #[test]
    fn test_defaults_and_toggles() {
        let filters = filters();
        let none = HashMap::new();
        assert_eq!(
            filters.active_filters(&none, &none),
            BTreeSet::from(["softDelete".to_string()])
        );

        let session = HashMap::from([("tenant".to_string(), true)]);
        let call = HashMap::from([("softDelete".to_string(), false)]);
        assert_eq!(
            filters.active_filters(&session, &call),
            BTreeSet::from(["tenant".to_string()])
        );
    }

    #[test]
    fn test_global_filter_skips_entities_without_columns() {
        let registry = registry();
        let filters = filters();
        let active = filters.active_filters(&HashMap::new(), &HashMap::new());
        let params = HashMap::new();

        let user = registry.resolve("User").unwrap();
        let q = filters
            .apply(Query::select("User"), &user, &active, &params)
            .unwrap();
        assert_eq!(q.to_string(), "SELECT * FROM User WHERE deleted_at IS NULL");

        let tag = registry.resolve("Tag").unwrap();
        let q = filters
            .apply(Query::select("Tag"), &tag, &active, &params)
            .unwrap();
        assert!(q.condition.is_true());
    }

    #[test]
    fn test_missing_parameter_is_a_filter_error() {
        let registry = registry();
        let filters = filters();
        let user = registry.resolve("User").unwrap();
        let active = BTreeSet::from(["tenant".to_string()]);

        let err = filters
            .condition_for(&user, &active, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Filter(ref e) if e.filter == "tenant"));

        let params = HashMap::from([("tenant".to_string(), Value::BigInt(3))]);
        let c = filters.condition_for(&user, &active, &params).unwrap();
        assert_eq!(c, Condition::eq("tenant_id", 3_i64));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut filters = filters();
        assert!(
            filters
                .register(FilterDef::new("softDelete", Condition::True))
                .is_err()
        );
        assert!(filters.require("missing").is_err());
    }
}
