//! The persistence executor boundary.
//!
//! The entity manager never generates SQL or talks to a datastore directly.
//! It hands compiled [`Query`] values and ordered [`ChangeSet`] sequences to an
//! [`Executor`], which owns dialects, connections and transactions.
//!
//! All operations are async and take a `Cx` context for cancellation; they
//! are the only suspension points of a session.

use crate::change_set::ChangeSet;
use crate::error::Error;
use crate::query::Query;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Per-change-set result of a write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write was applied. Inserts report backend-generated column values.
    Applied {
        generated: Vec<(String, Value)>,
    },
    /// The backend refused the write.
    Rejected { reason: String },
}

impl WriteOutcome {
    /// Applied with nothing generated.
    pub fn applied() -> Self {
        WriteOutcome::Applied {
            generated: Vec::new(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

/// A backend capable of running queries and applying change sets.
///
/// Implementations must be `Send + Sync`; transaction state is scoped to the
/// executor value, so each session should own its own executor handle.
pub trait Executor: Send + Sync {
    /// Run a query and return all matching rows.
    fn execute(
        &self,
        cx: &Cx,
        query: &Query,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Apply change sets in the given order, reporting one outcome each.
    ///
    /// Processing may stop at the first rejection; the returned vector then
    /// ends with that rejection.
    fn execute_write(
        &self,
        cx: &Cx,
        change_sets: &[ChangeSet],
    ) -> impl Future<Output = Outcome<Vec<WriteOutcome>, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Count the rows matching a query, ignoring its pagination.
    fn count(&self, cx: &Cx, query: &Query) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let count_query = query.to_count();
        async move {
            let rows = match self.execute(cx, &count_query).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let count = rows
                .first()
                .and_then(|r| r.get_by_name("count"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Outcome::Ok(u64::try_from(count).unwrap_or(0))
        }
    }
}
