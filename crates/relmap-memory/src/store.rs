//! Table storage and predicate evaluation.
//!
//! Comparisons follow SQL three-valued logic collapsed to booleans: any
//! comparison involving NULL is false, `IS NULL` is the only way to match it.

use relmap_core::metadata::{EntityMetadata, MetadataRegistry};
use relmap_core::{Condition, Direction, Error, KeyTuple, Operand, OrderBy, Result, Row, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// One stored row, keyed by column name.
pub(crate) type Record = BTreeMap<String, Value>;

/// Physical layout of one entity's table.
#[derive(Debug, Clone)]
pub(crate) struct TableSchema {
    pub(crate) name: String,
    pub(crate) columns: Vec<String>,
    pub(crate) primary_key: Vec<String>,
    /// Single-column unique constraints.
    pub(crate) unique: Vec<String>,
    /// Auto-increment column, if any.
    pub(crate) generated: Option<String>,
}

impl TableSchema {
    fn from_metadata(meta: &EntityMetadata) -> Self {
        Self {
            name: meta.name().to_string(),
            columns: meta.columns().iter().map(|c| c.name.clone()).collect(),
            primary_key: meta.primary_key().columns().to_vec(),
            unique: meta
                .columns()
                .iter()
                .filter(|c| c.unique && !c.primary_key)
                .map(|c| c.name.clone())
                .collect(),
            generated: meta
                .columns()
                .iter()
                .find(|c| c.generated)
                .map(|c| c.name.clone()),
        }
    }

    /// Schemas for every concrete entity of a registry.
    pub(crate) fn all(registry: &MetadataRegistry) -> HashMap<String, TableSchema> {
        registry
            .entities()
            .filter(|m| !m.is_abstract())
            .map(|m| (m.name().to_string(), Self::from_metadata(m)))
            .collect()
    }

    pub(crate) fn key_of(&self, record: &Record) -> KeyTuple {
        project(record, &self.primary_key)
    }

    /// Record as a row, columns in declaration order.
    pub(crate) fn to_row(&self, record: &Record) -> Row {
        Row::from_pairs(
            self.columns
                .iter()
                .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null))),
        )
    }
}

pub(crate) fn project<S: AsRef<str>>(record: &Record, columns: &[S]) -> KeyTuple {
    KeyTuple::new(
        columns
            .iter()
            .map(|c| record.get(c.as_ref()).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Table contents.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    pub(crate) tables: HashMap<String, Vec<Record>>,
}

/// Auto-increment counters, shared by every transaction so that two open
/// transactions never hand out the same generated key.
#[derive(Debug, Default)]
pub(crate) struct Sequences(HashMap<String, i64>);

impl Sequences {
    /// Next auto-increment value for a table.
    pub(crate) fn next_id(&mut self, entity: &str) -> i64 {
        let seq = self.0.entry(entity.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Keep the counter ahead of explicitly supplied values.
    pub(crate) fn observe_id(&mut self, entity: &str, value: &Value) {
        if let Some(id) = value.as_i64() {
            let seq = self.0.entry(entity.to_string()).or_insert(0);
            if id > *seq {
                *seq = id;
            }
        }
    }
}

impl Store {
    pub(crate) fn table(&self, entity: &str) -> &[Record] {
        self.tables.get(entity).map_or(&[], Vec::as_slice)
    }

    /// Evaluate `condition` against one record.
    pub(crate) fn matches(&self, record: &Record, condition: &Condition) -> Result<bool> {
        Ok(match condition {
            Condition::True => true,
            Condition::Eq(column, operand) => {
                let value = bound(operand)?;
                !value.is_null() && column_value(record, column).same_as(value)
            }
            Condition::Ne(column, operand) => {
                let value = bound(operand)?;
                let current = column_value(record, column);
                !value.is_null() && !current.is_null() && !current.same_as(value)
            }
            Condition::In(column, values) => {
                let current = column_value(record, column);
                !current.is_null() && values.iter().any(|v| v.same_as(current))
            }
            Condition::KeyIn(columns, keys) => {
                let key = project(record, columns);
                key.is_complete() && keys.contains(&key)
            }
            Condition::IsNull(column) => column_value(record, column).is_null(),
            Condition::IsNotNull(column) => !column_value(record, column).is_null(),
            Condition::And(parts) => {
                for part in parts {
                    if !self.matches(record, part)? {
                        return Ok(false);
                    }
                }
                true
            }
            Condition::Or(parts) => {
                for part in parts {
                    if self.matches(record, part)? {
                        return Ok(true);
                    }
                }
                false
            }
            Condition::Not(inner) => !self.matches(record, inner)?,
            Condition::Related {
                target,
                join,
                condition,
            } => {
                let mut found = false;
                for candidate in self.table(target) {
                    let joined = join.iter().all(|(local, remote)| {
                        let value = column_value(record, local);
                        !value.is_null() && value.same_as(column_value(candidate, remote))
                    });
                    if joined && self.matches(candidate, condition)? {
                        found = true;
                        break;
                    }
                }
                found
            }
            Condition::Field { field, .. } => {
                return Err(Error::query(
                    None,
                    format!("field criterion '{field}' must be expanded to columns first"),
                ));
            }
        })
    }
}

fn column_value<'a>(record: &'a Record, column: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    record.get(column).unwrap_or(&NULL)
}

fn bound(operand: &Operand) -> Result<&Value> {
    match operand {
        Operand::Value(v) => Ok(v),
        Operand::Param(p) => Err(Error::query(None, format!("unbound parameter ':{p}'"))),
    }
}

/// Stable multi-key sort.
pub(crate) fn sort(records: &mut [Record], order_by: &[OrderBy]) {
    if order_by.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for order in order_by {
            let ordering = column_value(a, &order.column).sort_cmp(column_value(b, &order.column));
            let ordering = match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
