//! Backend-neutral query model handed to the persistence executor.
//!
//! Conditions are expressed over physical columns. `Condition::Field` is the
//! one exception: it names an entity field (possibly a composite reference)
//! and is expanded by the session into column conditions before the query
//! reaches an executor.

use crate::value::{KeyTuple, Value};
use std::collections::HashMap;
use std::fmt;

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Literal value
    Value(Value),
    /// Named filter parameter, bound per session before execution
    Param(String),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

macro_rules! operand_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Operand {
            fn from(v: $t) -> Self {
                Operand::Value(v.into())
            }
        })*
    };
}

operand_from!(bool, i32, i64, f64, String, &str);

/// A boolean predicate over the columns of one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Always true
    True,
    /// column = operand
    Eq(String, Operand),
    /// column <> operand
    Ne(String, Operand),
    /// column IN (values)
    In(String, Vec<Value>),
    /// (columns...) IN ((key...), ...)
    KeyIn(Vec<String>, Vec<KeyTuple>),
    /// column IS NULL
    IsNull(String),
    /// column IS NOT NULL
    IsNotNull(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Semi-join: a row of `target` exists whose key columns equal this row's
    /// join columns and which satisfies `condition`.
    Related {
        target: String,
        /// `(local column, target column)` pairs
        join: Vec<(String, String)>,
        condition: Box<Condition>,
    },
    /// Field-level criterion, expanded by the session into column conditions.
    Field { field: String, key: KeyTuple },
}

impl Condition {
    /// column = value
    pub fn eq(column: impl Into<String>, value: impl Into<Operand>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    /// column <> value
    pub fn ne(column: impl Into<String>, value: impl Into<Operand>) -> Self {
        Condition::Ne(column.into(), value.into())
    }

    /// column = :param
    pub fn eq_param(column: impl Into<String>, param: impl Into<String>) -> Self {
        Condition::Eq(column.into(), Operand::Param(param.into()))
    }

    /// column IS NULL
    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    /// column IS NOT NULL
    pub fn is_not_null(column: impl Into<String>) -> Self {
        Condition::IsNotNull(column.into())
    }

    /// column IN (values)
    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::In(column.into(), values)
    }

    /// Match a field by value or, for reference fields, by the target's key.
    pub fn field_eq(field: impl Into<String>, key: impl Into<KeyTuple>) -> Self {
        Condition::Field {
            field: field.into(),
            key: key.into(),
        }
    }

    /// Equality on every column of a key.
    pub fn columns_eq<S: AsRef<str>>(columns: &[S], key: &KeyTuple) -> Self {
        Condition::And(
            columns
                .iter()
                .zip(key.values())
                .map(|(c, v)| Condition::eq(c.as_ref(), v.clone()))
                .collect(),
        )
    }

    /// AND, flattening nested conjunctions and dropping `True`.
    pub fn and(self, other: Condition) -> Self {
        let mut parts = Vec::new();
        for c in [self, other] {
            match c {
                Condition::True => {}
                Condition::And(inner) => parts.extend(inner),
                c => parts.push(c),
            }
        }
        match parts.len() {
            0 => Condition::True,
            1 => parts.pop().unwrap_or(Condition::True),
            _ => Condition::And(parts),
        }
    }

    /// OR
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut parts) => {
                parts.push(other);
                Condition::Or(parts)
            }
            c => Condition::Or(vec![c, other]),
        }
    }

    /// NOT
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Whether this is the trivially-true condition.
    pub fn is_true(&self) -> bool {
        matches!(self, Condition::True)
    }

    /// Names of filter parameters referenced anywhere in the condition.
    pub fn params(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_params(&mut out);
        out
    }

    fn collect_params<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Eq(_, Operand::Param(p)) | Condition::Ne(_, Operand::Param(p)) => {
                out.push(p);
            }
            Condition::And(parts) | Condition::Or(parts) => {
                for p in parts {
                    p.collect_params(out);
                }
            }
            Condition::Not(inner) => inner.collect_params(out),
            Condition::Related { condition, .. } => condition.collect_params(out),
            _ => {}
        }
    }

    /// Replace every parameter with its bound value.
    ///
    /// Returns the name of the first unbound parameter on failure.
    pub fn bind(&self, params: &HashMap<String, Value>) -> Result<Condition, String> {
        let bind_operand = |op: &Operand| -> Result<Operand, String> {
            match op {
                Operand::Param(name) => params
                    .get(name)
                    .cloned()
                    .map(Operand::Value)
                    .ok_or_else(|| name.clone()),
                other => Ok(other.clone()),
            }
        };
        Ok(match self {
            Condition::Eq(c, op) => Condition::Eq(c.clone(), bind_operand(op)?),
            Condition::Ne(c, op) => Condition::Ne(c.clone(), bind_operand(op)?),
            Condition::And(parts) => Condition::And(
                parts
                    .iter()
                    .map(|p| p.bind(params))
                    .collect::<Result<_, _>>()?,
            ),
            Condition::Or(parts) => Condition::Or(
                parts
                    .iter()
                    .map(|p| p.bind(params))
                    .collect::<Result<_, _>>()?,
            ),
            Condition::Not(inner) => Condition::Not(Box::new(inner.bind(params)?)),
            Condition::Related {
                target,
                join,
                condition,
            } => Condition::Related {
                target: target.clone(),
                join: join.clone(),
                condition: Box::new(condition.bind(params)?),
            },
            other => other.clone(),
        })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{v}"),
            Operand::Param(p) => write!(f, ":{p}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, " {sep} ")?;
        }
        write!(f, "{p}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::True => write!(f, "TRUE"),
            Condition::Eq(c, v) => write!(f, "{c} = {v}"),
            Condition::Ne(c, v) => write!(f, "{c} <> {v}"),
            Condition::In(c, vs) => {
                write!(f, "{c} IN (")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Condition::KeyIn(cols, keys) => {
                write!(f, "({}) IN (", cols.join(", "))?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}")?;
                }
                write!(f, ")")
            }
            Condition::IsNull(c) => write!(f, "{c} IS NULL"),
            Condition::IsNotNull(c) => write!(f, "{c} IS NOT NULL"),
            Condition::And(parts) => write_joined(f, parts, "AND"),
            Condition::Or(parts) => write_joined(f, parts, "OR"),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
            Condition::Related {
                target,
                join,
                condition,
            } => {
                let on: Vec<String> = join.iter().map(|(l, t)| format!("{target}.{t} = {l}")).collect();
                write!(f, "EXISTS ({target} WHERE {} AND {condition})", on.join(" AND "))
            }
            Condition::Field { field, key } => write!(f, "{field} = {key}"),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY item.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// What the query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// All columns of every matching row
    #[default]
    Rows,
    /// A single row with a `count` column
    Count,
}

/// A compiled query against one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub entity: String,
    pub condition: Condition,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub projection: Projection,
}

impl Query {
    /// Select all rows of an entity.
    pub fn select(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            condition: Condition::True,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            projection: Projection::Rows,
        }
    }

    /// AND a condition into the WHERE clause.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = std::mem::replace(&mut self.condition, Condition::True).and(condition);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// The same predicate as a count, ignoring ordering and pagination.
    #[must_use]
    pub fn to_count(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            condition: self.condition.clone(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            projection: Projection::Count,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.projection {
            Projection::Rows => write!(f, "SELECT * FROM {}", self.entity)?,
            Projection::Count => write!(f, "SELECT COUNT(*) FROM {}", self.entity)?,
        }
        if !self.condition.is_true() {
            write!(f, " WHERE {}", self.condition)?;
        }
        if !self.order_by.is_empty() {
            let items: Vec<String> = self
                .order_by
                .iter()
                .map(|o| match o.direction {
                    Direction::Asc => o.column.clone(),
                    Direction::Desc => format!("{} DESC", o.column),
                })
                .collect();
            write!(f, " ORDER BY {}", items.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}
