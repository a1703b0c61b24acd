//! Flush planning and execution.
//!
//! Pending changes are written in this order:
//! - INSERT parent-first (a dependent follows every new entity it references)
//! - UPDATE in tracking order
//! - DELETE child-first (a removed entity follows every removed dependent)
//!
//! Ordering is topological over the instances taking part in the flush.
//! Cycles between entity types are rejected before any instance ordering is
//! attempted; self-referencing types are ordered per instance and rejected
//! only when the instances themselves form a cycle.
//!
//! When a dependent references a new entity whose key is generated by the
//! backend, the plan is executed in segments: the generated key is copied
//! into the dependent's pending insert or update before it is sent.

use crate::change_tracker::ChangeTracker;
use crate::entity::{EntityRef, EntityState};
use relmap_core::metadata::{EntityMetadata, MetadataRegistry};
use relmap_core::{
    ChangeSet, Cx, Error, Executor, FieldChange, KeyTuple, Outcome, Result, ValidationError,
    Value, WriteError, WriteOutcome,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

/// One planned write and the instance it belongs to.
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub entity: EntityRef,
    pub change_set: ChangeSet,
}

/// Foreign-key columns of a pending insert or update that wait for a
/// parent's generated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyBinding {
    /// Plan position of the dependent write.
    pub(crate) child: usize,
    /// Plan position of the parent insert.
    pub(crate) parent: usize,
    /// `(dependent column, parent key column)` pairs.
    pub(crate) columns: Vec<(String, String)>,
}

/// An ordered, validated set of writes.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    writes: Vec<PlannedWrite>,
    bindings: Vec<KeyBinding>,
}

impl FlushPlan {
    /// Create an empty flush plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[PlannedWrite] {
        &self.writes
    }

    /// The ordered change sets.
    pub fn change_sets(&self) -> Vec<ChangeSet> {
        self.writes.iter().map(|w| w.change_set.clone()).collect()
    }

    pub(crate) fn bindings(&self) -> &[KeyBinding] {
        &self.bindings
    }

    /// Consecutive ranges of the plan that can be sent as one batch. A range
    /// ends after every insert whose generated key a later write needs.
    pub(crate) fn segments(&self) -> Vec<Range<usize>> {
        let len = self.writes.len();
        let mut cuts: BTreeSet<usize> = self
            .bindings
            .iter()
            .map(|b| b.parent + 1)
            .filter(|&cut| cut < len)
            .collect();
        cuts.insert(len);
        let mut segments = Vec::new();
        let mut start = 0;
        for cut in cuts {
            if cut > start {
                segments.push(start..cut);
                start = cut;
            }
        }
        segments
    }

    /// Execute the plan against the executor. Transactions are the caller's
    /// concern.
    #[tracing::instrument(level = "info", skip(self, cx, executor))]
    pub async fn execute<E: Executor>(&self, cx: &Cx, executor: &E) -> Outcome<FlushResult, Error> {
        let start = std::time::Instant::now();
        let mut pending = self.change_sets();
        let mut result = FlushResult {
            generated: vec![Vec::new(); pending.len()],
            ..FlushResult::default()
        };

        tracing::info!(
            inserts = pending.iter().filter(|c| c.is_insert()).count(),
            updates = pending.iter().filter(|c| c.is_update()).count(),
            deletes = pending.iter().filter(|c| c.is_delete()).count(),
            "Executing flush plan"
        );

        for segment in self.segments() {
            let batch = &pending[segment.clone()];
            for cs in batch {
                tracing::trace!(change_set = %cs.to_json(), "Sending change set");
            }
            let outcomes = match executor.execute_write(cx, batch).await {
                Outcome::Ok(outcomes) => outcomes,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            for (offset, cs) in batch.iter().enumerate() {
                match outcomes.get(offset) {
                    Some(WriteOutcome::Applied { generated }) => {
                        result.generated[segment.start + offset].clone_from(generated);
                        result.count(cs);
                    }
                    Some(WriteOutcome::Rejected { reason }) => {
                        tracing::debug!(entity = %cs.entity, key = %cs.key, reason = %reason, "Change set rejected");
                        return Outcome::Err(Error::Write(WriteError {
                            entity: cs.entity.clone(),
                            key: cs.key.clone(),
                            operation: cs.operation,
                            reason: reason.clone(),
                        }));
                    }
                    None => {
                        return Outcome::Err(Error::Write(WriteError {
                            entity: cs.entity.clone(),
                            key: cs.key.clone(),
                            operation: cs.operation,
                            reason: "executor reported no outcome".to_string(),
                        }));
                    }
                }
            }

            for binding in self.bindings.iter().filter(|b| segment.contains(&b.parent)) {
                let generated = &result.generated[binding.parent];
                let parent_fields = &self.writes[binding.parent].change_set.fields;
                for (child_column, parent_column) in &binding.columns {
                    let value = generated
                        .iter()
                        .chain(parent_fields.iter())
                        .find(|(c, _)| c == parent_column)
                        .map(|(_, v)| v.clone())
                        .unwrap_or(Value::Null);
                    pending[binding.child].set_field(child_column, value);
                }
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Outcome::Ok(result)
    }
}

/// Result of executing a flush plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Backend-generated column values, by plan position.
    pub generated: Vec<Vec<(String, Value)>>,
}

impl FlushResult {
    /// Total operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    fn count(&mut self, cs: &ChangeSet) {
        if cs.is_insert() {
            self.inserted += 1;
        } else if cs.is_update() {
            self.updated += 1;
        } else {
            self.deleted += 1;
        }
    }
}

/// Builds flush plans from a session's tracked instances.
pub(crate) struct FlushPlanner<'a> {
    registry: &'a MetadataRegistry,
    tracker: &'a ChangeTracker,
}

/// Per-instance facts gathered before ordering.
struct Candidate {
    entity: EntityRef,
    meta: Arc<EntityMetadata>,
    serial: u64,
    change_set: ChangeSet,
    /// Values the foreign keys are read from: live for inserts and updates,
    /// the snapshot for deletes.
    values: Vec<Value>,
}

impl<'a> FlushPlanner<'a> {
    pub(crate) fn new(registry: &'a MetadataRegistry, tracker: &'a ChangeTracker) -> Self {
        Self { registry, tracker }
    }

    /// Compute the ordered plan for `tracked`, in tracking order.
    #[tracing::instrument(level = "debug", skip_all, fields(tracked = tracked.len()))]
    pub(crate) fn plan(&self, tracked: &[EntityRef]) -> Result<FlushPlan> {
        let mut inserts = Vec::new();
        let mut managed = Vec::new();
        let mut deletes = Vec::new();

        for entity in tracked {
            let data = entity.read();
            match data.state {
                EntityState::New => {
                    let fields = data
                        .meta
                        .columns()
                        .iter()
                        .zip(&data.values)
                        .filter(|(c, v)| !(c.generated && v.is_null()))
                        .map(|(c, v)| (c.name.clone(), v.clone()))
                        .collect();
                    inserts.push(Candidate {
                        entity: entity.clone(),
                        meta: Arc::clone(&data.meta),
                        serial: data.serial,
                        change_set: ChangeSet::insert(data.meta.name(), data.key(), fields),
                        values: data.values.clone(),
                    });
                }
                EntityState::Managed => managed.push(entity.clone()),
                EntityState::Removed => {
                    let snapshot = self.tracker.get_snapshot(data.serial);
                    let key = snapshot.map_or_else(|| data.key(), |s| s.key().clone());
                    let values = snapshot.map_or_else(|| data.values.clone(), |s| s.values().to_vec());
                    deletes.push(Candidate {
                        entity: entity.clone(),
                        meta: Arc::clone(&data.meta),
                        serial: data.serial,
                        change_set: ChangeSet::delete(data.meta.name(), key),
                        values,
                    });
                }
                EntityState::Detached => {}
            }
        }

        let mut insert_deps = self.insert_dependencies(&inserts)?;
        let (updates, update_bindings) = self.updates(&managed, &inserts, &mut insert_deps.bound)?;
        self.validate(&inserts, &updates, &insert_deps.bound)?;
        let delete_deps = self.delete_dependencies(&deletes)?;

        self.check_type_cycles(inserts.iter().chain(&deletes))?;

        let insert_order = stable_topo(&insert_deps.before).map_err(|stuck| cycle_of(&inserts, &stuck))?;
        let delete_order = stable_topo(&delete_deps).map_err(|stuck| cycle_of(&deletes, &stuck))?;

        let mut position = vec![0; inserts.len()];
        for (pos, &i) in insert_order.iter().enumerate() {
            position[i] = pos;
        }
        let first_update = inserts.len();
        let bindings = insert_deps
            .bindings
            .into_iter()
            .map(|b| KeyBinding {
                child: position[b.child],
                parent: position[b.parent],
                columns: b.columns,
            })
            .chain(update_bindings.into_iter().map(|b| KeyBinding {
                child: first_update + b.child,
                parent: position[b.parent],
                columns: b.columns,
            }))
            .collect();

        let mut inserts: Vec<Option<Candidate>> = inserts.into_iter().map(Some).collect();
        let mut deletes: Vec<Option<Candidate>> = deletes.into_iter().map(Some).collect();
        let mut writes = Vec::new();
        for i in insert_order {
            if let Some(c) = inserts[i].take() {
                writes.push(c);
            }
        }
        writes.extend(updates);
        for i in delete_order {
            if let Some(c) = deletes[i].take() {
                writes.push(c);
            }
        }

        let plan = FlushPlan {
            writes: writes
                .into_iter()
                .map(|c| PlannedWrite {
                    entity: c.entity,
                    change_set: c.change_set,
                })
                .collect(),
            bindings,
        };
        tracing::debug!(writes = plan.len(), segments = plan.segments().len(), "Computed flush plan");
        Ok(plan)
    }

    /// Parents each insert must follow, and generated-key bindings.
    fn insert_dependencies(&self, inserts: &[Candidate]) -> Result<InsertDependencies> {
        let by_serial = serial_index(inserts);
        let by_key: HashMap<(String, KeyTuple), usize> = inserts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.change_set.key.is_complete())
            .map(|(i, c)| ((c.change_set.entity.clone(), c.change_set.key.clone()), i))
            .collect();

        let mut deps = InsertDependencies {
            before: vec![Vec::new(); inserts.len()],
            bindings: Vec::new(),
            bound: HashSet::new(),
        };
        for (i, child) in inserts.iter().enumerate() {
            for (field, rel) in child.meta.owning_references() {
                let target = self.registry.resolve(&rel.target)?;
                let local = rel.local_columns_for(&target)?;
                let fk = project(&child.meta, &child.values, &local);

                let bound_parent = child
                    .entity
                    .loaded(&field.name)
                    .filter(|p| p.key() == fk)
                    .and_then(|p| by_serial.get(&p.serial()).copied());
                let parent = match bound_parent {
                    Some(p) => Some(p),
                    None if fk.is_complete() => by_key
                        .get(&(target.name().to_string(), fk.clone()))
                        .copied(),
                    None => None,
                };
                let Some(parent) = parent.filter(|&p| p != i) else {
                    continue;
                };
                deps.before[i].push(parent);

                let columns = pending_columns(&local, &target, &inserts[parent].change_set.key);
                if !columns.is_empty() {
                    for (l, _) in &columns {
                        deps.bound.insert((child.serial, l.clone()));
                    }
                    deps.bindings.push(KeyBinding {
                        child: i,
                        parent,
                        columns,
                    });
                }
            }
        }
        Ok(deps)
    }

    /// Update candidates for managed instances that changed since their
    /// snapshot. An owning reference to a pending insert whose key the
    /// backend generates becomes a binding on the update; `child` in the
    /// returned bindings is the update index.
    fn updates(
        &self,
        managed: &[EntityRef],
        inserts: &[Candidate],
        bound: &mut HashSet<(u64, String)>,
    ) -> Result<(Vec<Candidate>, Vec<KeyBinding>)> {
        let by_serial = serial_index(inserts);
        let mut updates = Vec::new();
        let mut bindings = Vec::new();

        for entity in managed {
            let (meta, serial, values, mut changes) = {
                let data = entity.read();
                (
                    Arc::clone(&data.meta),
                    data.serial,
                    data.values.clone(),
                    self.tracker.diff(&data),
                )
            };
            let snapshot = self.tracker.get_snapshot(serial);

            let mut waiting = Vec::new();
            for (field, rel) in meta.owning_references() {
                let target = self.registry.resolve(&rel.target)?;
                let local = rel.local_columns_for(&target)?;
                let fk = project(&meta, &values, &local);
                let Some(parent) = entity
                    .loaded(&field.name)
                    .filter(|p| p.key() == fk)
                    .and_then(|p| by_serial.get(&p.serial()).copied())
                else {
                    continue;
                };
                let columns = pending_columns(&local, &target, &inserts[parent].change_set.key);
                if columns.is_empty() {
                    continue;
                }
                for (column, _) in &columns {
                    if !changes.iter().any(|c| &c.field == column) {
                        let old = snapshot
                            .and_then(|s| meta.column_index(column).and_then(|i| s.values().get(i)))
                            .cloned()
                            .unwrap_or(Value::Null);
                        changes.push(FieldChange {
                            field: column.clone(),
                            old,
                            new: Value::Null,
                        });
                    }
                    bound.insert((serial, column.clone()));
                }
                waiting.push((parent, columns));
            }

            if changes.is_empty() {
                continue;
            }
            for (parent, columns) in waiting {
                bindings.push(KeyBinding {
                    child: updates.len(),
                    parent,
                    columns,
                });
            }
            let key = snapshot.map_or_else(|| entity.key(), |s| s.key().clone());
            updates.push(Candidate {
                entity: entity.clone(),
                change_set: ChangeSet::update(meta.name(), key, changes),
                meta,
                serial,
                values,
            });
        }
        Ok((updates, bindings))
    }

    /// For each delete, the deletes that must precede it (its dependents).
    fn delete_dependencies(&self, deletes: &[Candidate]) -> Result<Vec<Vec<usize>>> {
        let by_key: HashMap<(String, KeyTuple), usize> = deletes
            .iter()
            .enumerate()
            .map(|(i, c)| ((c.change_set.entity.clone(), c.change_set.key.clone()), i))
            .collect();
        let mut before = vec![Vec::new(); deletes.len()];
        for (i, child) in deletes.iter().enumerate() {
            for (_, rel) in child.meta.owning_references() {
                let target = self.registry.resolve(&rel.target)?;
                let fk = project(&child.meta, &child.values, &rel.local_columns_for(&target)?);
                if let Some(&parent) = by_key.get(&(target.name().to_string(), fk)) {
                    if parent != i {
                        before[parent].push(i);
                    }
                }
            }
        }
        Ok(before)
    }

    /// Non-nullable columns must hold a value, unless the backend generates
    /// it or it waits on a parent's generated key.
    fn validate(
        &self,
        inserts: &[Candidate],
        updates: &[Candidate],
        bound: &HashSet<(u64, String)>,
    ) -> Result<()> {
        for candidate in inserts {
            let mut errors = ValidationError::new(candidate.meta.name());
            for (column, value) in candidate.meta.columns().iter().zip(&candidate.values) {
                if value.is_null()
                    && !column.nullable
                    && !column.generated
                    && !bound.contains(&(candidate.serial, column.name.clone()))
                {
                    errors.add_required(&column.name);
                }
            }
            errors.into_result()?;
        }
        for candidate in updates {
            let mut errors = ValidationError::new(candidate.meta.name());
            for change in &candidate.change_set.changes {
                let nullable = candidate
                    .meta
                    .column(&change.field)
                    .is_none_or(|c| c.nullable);
                if change.new.is_null()
                    && !nullable
                    && !bound.contains(&(candidate.serial, change.field.clone()))
                {
                    errors.add_required(&change.field);
                }
            }
            errors.into_result()?;
        }
        Ok(())
    }

    /// Reject cycles in the type-level dependency graph of the entity types
    /// taking part in inserts or deletes. Self-references are ignored here.
    fn check_type_cycles<'c>(&self, candidates: impl Iterator<Item = &'c Candidate>) -> Result<()> {
        let mut types: Vec<&EntityMetadata> = Vec::new();
        for c in candidates {
            if !types.iter().any(|t| t.name() == c.meta.name()) {
                types.push(c.meta.as_ref());
            }
        }
        let names: HashSet<&str> = types.iter().map(|t| t.name()).collect();
        let graph: HashMap<&str, Vec<&str>> = types
            .iter()
            .map(|t| {
                let deps = t
                    .owning_references()
                    .map(|(_, r)| r.target.as_str())
                    .filter(|target| *target != t.name() && names.contains(target))
                    .collect();
                (t.name(), deps)
            })
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for &t in &types {
            if !visited.contains(t.name())
                && detect_cycle_dfs(t.name(), &graph, &mut visited, &mut rec_stack, &mut path)
            {
                tracing::debug!(cycle = ?path, "Dependency cycle between entity types");
                return Err(Error::CyclicDependency {
                    entities: path.into_iter().map(str::to_string).collect(),
                });
            }
        }
        Ok(())
    }
}

struct InsertDependencies {
    before: Vec<Vec<usize>>,
    bindings: Vec<KeyBinding>,
    /// `(tracking serial, column)` pairs filled from a generated key.
    bound: HashSet<(u64, String)>,
}

fn serial_index(candidates: &[Candidate]) -> HashMap<u64, usize> {
    candidates.iter().enumerate().map(|(i, c)| (c.serial, i)).collect()
}

/// `(local column, parent key column)` pairs whose parent key value is still
/// to be generated.
fn pending_columns(
    local: &[&str],
    target: &EntityMetadata,
    parent_key: &KeyTuple,
) -> Vec<(String, String)> {
    local
        .iter()
        .zip(target.primary_key().columns())
        .zip(parent_key.values())
        .filter(|(_, v)| v.is_null())
        .map(|((l, t), _)| ((*l).to_string(), t.clone()))
        .collect()
}

fn project(meta: &EntityMetadata, values: &[Value], columns: &[&str]) -> KeyTuple {
    KeyTuple::new(
        columns
            .iter()
            .map(|c| {
                meta.column_index(c)
                    .and_then(|i| values.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}

/// DFS helper for cycle detection. On success `path` holds the cycle,
/// closed by repeating its first type.
fn detect_cycle_dfs<'g>(
    node: &'g str,
    graph: &HashMap<&'g str, Vec<&'g str>>,
    visited: &mut HashSet<&'g str>,
    rec_stack: &mut HashSet<&'g str>,
    path: &mut Vec<&'g str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = graph.get(node) {
        for &dep in deps {
            if !visited.contains(dep) {
                if detect_cycle_dfs(dep, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                path.drain(..start);
                path.push(dep);
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

/// Kahn's algorithm, always emitting the lowest ready index so that
/// independent nodes keep their original order. `before[i]` lists the nodes
/// that must precede `i`. On failure returns the nodes left unordered.
fn stable_topo(before: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let n = before.len();
    let mut remaining: Vec<usize> = before
        .iter()
        .map(|deps| deps.iter().collect::<HashSet<_>>().len())
        .collect();
    let mut after: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in before.iter().enumerate() {
        for &d in deps.iter().collect::<HashSet<_>>() {
            after[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &after[i] {
            remaining[j] -= 1;
            if remaining[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| remaining[i] > 0).collect())
    }
}

fn cycle_of(candidates: &[Candidate], stuck: &[usize]) -> Error {
    let mut entities: Vec<String> = Vec::new();
    for &i in stuck {
        let name = candidates[i].meta.name();
        if !entities.iter().any(|e| e == name) {
            entities.push(name.to_string());
        }
    }
    Error::CyclicDependency { entities }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_topo_keeps_independent_order() {
        let before = vec![vec![2], vec![], vec![], vec![1]];
        assert_eq!(stable_topo(&before).unwrap(), vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_stable_topo_reports_cycle_members() {
        let before = vec![vec![1], vec![0], vec![]];
        assert_eq!(stable_topo(&before).unwrap_err(), vec![0, 1]);
    }

    #[test]
    fn test_type_cycle_path() {
        let graph: HashMap<&str, Vec<&str>> = HashMap::from([
            ("A", vec!["B"]),
            ("B", vec!["C"]),
            ("C", vec!["B"]),
        ]);
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        assert!(detect_cycle_dfs("A", &graph, &mut visited, &mut rec_stack, &mut path));
        assert_eq!(path, vec!["B", "C", "B"]);
    }
}
