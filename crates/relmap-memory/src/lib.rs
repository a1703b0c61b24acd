//! In-memory executor for the relmap entity manager.
//!
//! `relmap-memory` stores rows in process memory and evaluates compiled
//! queries directly, so sessions can be exercised end to end without a
//! database server.
//!
//! # Behavior
//!
//! - Tables are derived from a [`MetadataRegistry`]; abstract entities have
//!   no table.
//! - Primary-key and single-column unique constraints are enforced; a
//!   violating write is reported as [`WriteOutcome::Rejected`].
//! - A generated key column is filled from a per-table counter shared by all
//!   executors.
//! - A transaction writes to a private copy of the tables and logs each
//!   applied change set. Commit replays the log onto the shared tables, so
//!   concurrent transactions keep each other's writes. A replay that breaks a
//!   constraint fails the commit with [`TransactionErrorKind::CommitFailed`]
//!   and leaves the shared tables untouched.
//!
//! Each clone of a [`MemoryExecutor`] shares the tables but has its own
//! transaction, so every session should get its own clone.
//!
//! # Example
//!
//! ```rust,ignore
//! let db = MemoryDatabase::new(&registry);
//! db.seed("User", [Row::from_pairs([("id", Value::BigInt(1))])])?;
//! let factory = SessionFactory::new(registry, filters, db.executor())?;
//! ```

mod store;

use relmap_core::metadata::MetadataRegistry;
use relmap_core::{
    ChangeSet, Cx, Error, Executor, Operation, Outcome, Projection, Query, Result, Row,
    TransactionError, TransactionErrorKind, Value, WriteOutcome,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use store::{Record, Sequences, Store, TableSchema};

struct Shared {
    schemas: HashMap<String, TableSchema>,
    committed: Mutex<Store>,
    sequences: Mutex<Sequences>,
    queries: AtomicU64,
    writes: AtomicU64,
}

/// A set of in-memory tables.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Create empty tables for every concrete entity in `registry`.
    pub fn new(registry: &MetadataRegistry) -> Self {
        let schemas = TableSchema::all(registry);
        tracing::debug!(tables = schemas.len(), "Created in-memory database");
        Self {
            shared: Arc::new(Shared {
                schemas,
                committed: Mutex::new(Store::default()),
                sequences: Mutex::new(Sequences::default()),
                queries: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// A new executor over these tables, with no open transaction.
    pub fn executor(&self) -> MemoryExecutor {
        MemoryExecutor {
            shared: Arc::clone(&self.shared),
            staged: Mutex::new(None),
        }
    }

    /// Insert rows directly, bypassing any session.
    pub fn seed<I>(&self, entity: &str, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Row>,
    {
        let schema = schema(&self.shared, entity)?;
        let mut store = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sequences = self
            .shared
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for row in rows {
            let mut cs = ChangeSet::insert(
                entity,
                relmap_core::KeyTuple::new(Vec::new()),
                row.iter().map(|(c, v)| (c.to_string(), v.clone())).collect(),
            );
            insert(&mut store, &mut sequences, schema, &mut cs)
                .map_err(|reason| Error::query(Some(entity), reason))?;
        }
        Ok(())
    }

    /// Committed rows of a table in insertion order.
    pub fn rows(&self, entity: &str) -> Result<Vec<Row>> {
        let schema = schema(&self.shared, entity)?;
        let store = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(store.table(entity).iter().map(|r| schema.to_row(r)).collect())
    }

    /// Number of committed rows in a table.
    pub fn row_count(&self, entity: &str) -> usize {
        self.shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .table(entity)
            .len()
    }

    /// Number of queries executed so far, across all executors.
    pub fn queries_executed(&self) -> u64 {
        self.shared.queries.load(Ordering::Relaxed)
    }

    /// Number of change sets applied so far, across all executors.
    pub fn writes_applied(&self) -> u64 {
        self.shared.writes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<&String> = self.shared.schemas.keys().collect();
        tables.sort();
        f.debug_struct("MemoryDatabase")
            .field("tables", &tables)
            .finish_non_exhaustive()
    }
}

/// An open transaction: a private copy of the tables plus every change set
/// applied to it, with generated keys filled in.
struct Transaction {
    store: Store,
    log: Vec<ChangeSet>,
}

/// Executor over a [`MemoryDatabase`].
pub struct MemoryExecutor {
    shared: Arc<Shared>,
    staged: Mutex<Option<Transaction>>,
}

impl Clone for MemoryExecutor {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            staged: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for MemoryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryExecutor")
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

fn schema<'a>(shared: &'a Shared, entity: &str) -> Result<&'a TableSchema> {
    shared.schemas.get(entity).ok_or_else(|| Error::UnknownEntity {
        entity: entity.to_string(),
    })
}

fn transaction_error(kind: TransactionErrorKind, message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.to_string(),
    })
}

impl MemoryExecutor {
    /// Whether this executor has an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` on the staged tables if a transaction is open, otherwise on
    /// the shared tables.
    fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = staged.as_mut() {
            return f(&mut tx.store);
        }
        drop(staged);
        let mut committed = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut committed)
    }

    fn query_sync(&self, query: &Query) -> Result<Vec<Row>> {
        let schema = schema(&self.shared, &query.entity)?;
        self.shared.queries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(query = %query, "Executing in-memory query");

        self.with_store(|store| {
            let mut matched: Vec<Record> = Vec::new();
            for record in store.table(&query.entity) {
                if store.matches(record, &query.condition)? {
                    matched.push(record.clone());
                }
            }

            if query.projection == Projection::Count {
                let count = i64::try_from(matched.len()).unwrap_or(i64::MAX);
                return Ok(vec![Row::from_pairs([("count", Value::BigInt(count))])]);
            }

            store::sort(&mut matched, &query.order_by);
            let rows: Vec<Row> = matched
                .iter()
                .skip(query.offset.unwrap_or(0))
                .take(query.limit.unwrap_or(usize::MAX))
                .map(|r| schema.to_row(r))
                .collect();
            tracing::trace!(rows = rows.len(), "Query returned rows");
            Ok(rows)
        })
    }

    fn write_sync(&self, change_sets: &[ChangeSet]) -> Result<Vec<WriteOutcome>> {
        let mut schemas = Vec::with_capacity(change_sets.len());
        for cs in change_sets {
            schemas.push(schema(&self.shared, &cs.entity)?);
        }

        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = staged.as_mut() {
            return Ok(self.apply_all(&mut tx.store, Some(&mut tx.log), change_sets, &schemas));
        }
        drop(staged);
        let mut committed = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(self.apply_all(&mut committed, None, change_sets, &schemas))
    }

    /// Apply change sets in order, stopping at the first rejection.
    fn apply_all(
        &self,
        store: &mut Store,
        mut log: Option<&mut Vec<ChangeSet>>,
        change_sets: &[ChangeSet],
        schemas: &[&TableSchema],
    ) -> Vec<WriteOutcome> {
        let mut sequences = self
            .shared
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut outcomes = Vec::with_capacity(change_sets.len());
        for (cs, schema) in change_sets.iter().zip(schemas) {
            let mut resolved = cs.clone();
            let applied = match cs.operation {
                Operation::Insert => insert(store, &mut sequences, schema, &mut resolved)
                    .map(|generated| WriteOutcome::Applied { generated }),
                Operation::Update => update(store, schema, cs).map(|()| WriteOutcome::applied()),
                Operation::Delete => delete(store, schema, cs).map(|()| WriteOutcome::applied()),
            };
            match applied {
                Ok(outcome) => {
                    tracing::trace!(change_set = %resolved.to_json(), "Applied change set");
                    self.shared.writes.fetch_add(1, Ordering::Relaxed);
                    if let Some(log) = log.as_mut() {
                        log.push(resolved);
                    }
                    outcomes.push(outcome);
                }
                Err(reason) => {
                    tracing::debug!(entity = %cs.entity, key = %cs.key, reason = %reason, "Rejected change set");
                    outcomes.push(WriteOutcome::Rejected { reason });
                    break;
                }
            }
        }
        outcomes
    }

    fn begin_sync(&self) -> Result<()> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.is_some() {
            return Err(transaction_error(
                TransactionErrorKind::AlreadyActive,
                "Already in a transaction",
            ));
        }
        let snapshot = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        *staged = Some(Transaction {
            store: snapshot,
            log: Vec::new(),
        });
        tracing::debug!("BEGIN");
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = staged.take() else {
            return Err(transaction_error(
                TransactionErrorKind::NotActive,
                "Not in a transaction",
            ));
        };
        drop(staged);

        let mut committed = self
            .shared
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sequences = self
            .shared
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = committed.clone();
        for mut cs in tx.log {
            let schema = schema(&self.shared, &cs.entity)?;
            let replayed = match cs.operation {
                Operation::Insert => insert(&mut next, &mut sequences, schema, &mut cs).map(|_| ()),
                Operation::Update => update(&mut next, schema, &cs),
                Operation::Delete => delete(&mut next, schema, &cs),
            };
            if let Err(reason) = replayed {
                tracing::warn!(entity = %cs.entity, key = %cs.key, reason = %reason, "Commit conflicts with a concurrent write");
                return Err(transaction_error(
                    TransactionErrorKind::CommitFailed,
                    &format!("commit conflicts with a concurrent write: {reason}"),
                ));
            }
        }
        *committed = next;
        tracing::debug!("COMMIT");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.take().is_none() {
            return Err(transaction_error(
                TransactionErrorKind::NotActive,
                "Not in a transaction",
            ));
        }
        tracing::debug!("ROLLBACK");
        Ok(())
    }
}

/// Reject `record` if it collides with another row on the primary key or a
/// unique column. `skip` names the row being replaced by an update.
fn check_constraints(
    store: &Store,
    schema: &TableSchema,
    record: &Record,
    skip: Option<usize>,
) -> std::result::Result<(), String> {
    let key = schema.key_of(record);
    if !key.is_complete() {
        return Err(format!("{} primary key {key} is incomplete", schema.name));
    }
    for (i, other) in store.table(&schema.name).iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        if schema.key_of(other) == key {
            return Err(format!("duplicate primary key {key} in {}", schema.name));
        }
        for column in &schema.unique {
            let Some(value) = record.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            if other.get(column).is_some_and(|v| v.same_as(value)) {
                return Err(format!(
                    "unique constraint on {}.{column} violated by {value}",
                    schema.name
                ));
            }
        }
    }
    Ok(())
}

/// Insert a row. A generated key is drawn from `sequences` and written back
/// into `cs`.
fn insert(
    store: &mut Store,
    sequences: &mut Sequences,
    schema: &TableSchema,
    cs: &mut ChangeSet,
) -> std::result::Result<Vec<(String, Value)>, String> {
    let mut record: Record = schema
        .columns
        .iter()
        .map(|c| (c.clone(), cs.value(c).cloned().unwrap_or(Value::Null)))
        .collect();

    let mut generated = Vec::new();
    if let Some(column) = &schema.generated {
        let current = record.get(column).cloned().unwrap_or(Value::Null);
        if current.is_null() {
            let id = Value::BigInt(sequences.next_id(&schema.name));
            record.insert(column.clone(), id.clone());
            cs.set_field(column, id.clone());
            generated.push((column.clone(), id));
        } else {
            sequences.observe_id(&schema.name, &current);
        }
    }

    check_constraints(store, schema, &record, None)?;
    store
        .tables
        .entry(schema.name.clone())
        .or_default()
        .push(record);
    Ok(generated)
}

fn update(store: &mut Store, schema: &TableSchema, cs: &ChangeSet) -> std::result::Result<(), String> {
    let position = store
        .table(&schema.name)
        .iter()
        .position(|r| schema.key_of(r) == cs.key)
        .ok_or_else(|| format!("no {} row with key {}", schema.name, cs.key))?;

    let mut updated = store.table(&schema.name)[position].clone();
    for change in &cs.changes {
        updated.insert(change.field.clone(), change.new.clone());
    }
    check_constraints(store, schema, &updated, Some(position))?;
    if let Some(table) = store.tables.get_mut(&schema.name) {
        table[position] = updated;
    }
    Ok(())
}

fn delete(store: &mut Store, schema: &TableSchema, cs: &ChangeSet) -> std::result::Result<(), String> {
    let table = store
        .tables
        .get_mut(&schema.name)
        .ok_or_else(|| format!("no {} row with key {}", schema.name, cs.key))?;
    let position = table
        .iter()
        .position(|r| schema.key_of(r) == cs.key)
        .ok_or_else(|| format!("no {} row with key {}", schema.name, cs.key))?;
    table.remove(position);
    Ok(())
}

impl Executor for MemoryExecutor {
    fn execute(
        &self,
        _cx: &Cx,
        query: &Query,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(query);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_write(
        &self,
        _cx: &Cx,
        change_sets: &[ChangeSet],
    ) -> impl Future<Output = Outcome<Vec<WriteOutcome>, Error>> + Send {
        let result = self.write_sync(change_sets);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}
