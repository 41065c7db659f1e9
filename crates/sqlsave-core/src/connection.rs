//! Database connection traits.
//!
//! This module defines what the save pipeline needs from a live connection:
//!
//! - [`Connection`] - plain queries, prepared batch execution and savepoints
//! - [`PreparedStatement`] - a statement prepared for repeated execution
//! - [`GeneratedKeys`] - how a prepared INSERT returns database-generated ids
//! - [`BatchOutcome`] - per-row results of one batch execution
//!
//! Every call takes the caller's asupersync `Cx`. The connection is owned by the
//! caller and runs inside the caller's transaction; the save pipeline only
//! borrows it.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// How a prepared statement reports ids generated by the database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GeneratedKeys {
    /// No ids are read back
    #[default]
    None,
    /// Return the named column explicitly (sequence-style generation)
    Column(String),
    /// Return whatever the driver reports as generated keys (identity columns)
    Auto,
}

impl GeneratedKeys {
    pub const fn is_requested(&self) -> bool {
        !matches!(self, GeneratedKeys::None)
    }
}

/// Handle to a statement the driver has prepared for batch execution.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Driver-assigned handle
    id: u64,
    sql: String,
    generated_keys: GeneratedKeys,
}

impl PreparedStatement {
    /// Called by drivers from [`Connection::prepare`].
    #[must_use]
    pub fn new(id: u64, sql: String, generated_keys: GeneratedKeys) -> Self {
        Self {
            id,
            sql,
            generated_keys,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn generated_keys(&self) -> &GeneratedKeys {
        &self.generated_keys
    }
}

/// Result of executing a prepared statement once per staged row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Affected-row count per staged row, in staging order
    pub update_counts: Vec<u64>,
    /// Generated key per staged row, in staging order, when requested.
    /// A row that produced no key (for example an ignored conflict) reports
    /// `Value::Null`.
    pub generated_keys: Vec<Value>,
}

/// What the save pipeline needs from a driver connection.
///
/// # Example
///
/// ```rust,ignore
/// let stmt = conn.prepare(&cx, "INSERT INTO book(name) VALUES($1)", GeneratedKeys::Auto).await?;
/// let outcome = conn.execute_batch(&cx, &stmt, &[vec![Value::from("GraphQL in Action")]]).await?;
/// conn.close_statement(&cx, stmt).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Dialect of the connected database.
    fn dialect(&self) -> Dialect;

    /// Run a SELECT and collect its rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Run one DML statement and return the affected-row count.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Prepare `sql`, asking the driver to report generated ids as described.
    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
        generated_keys: GeneratedKeys,
    ) -> impl Future<Output = Outcome<PreparedStatement, crate::Error>> + Send;

    /// Execute a prepared statement once per parameter row, in order.
    ///
    /// Either every row is applied or the call fails; partial application
    /// is undone by the caller through a savepoint where needed.
    fn execute_batch(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        rows: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<BatchOutcome, crate::Error>> + Send;

    /// Drop a statement returned by [`prepare`](Connection::prepare).
    fn close_statement(
        &self,
        cx: &Cx,
        stmt: PreparedStatement,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// `SAVEPOINT name` in the caller's transaction.
    fn savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// `ROLLBACK TO SAVEPOINT name`; the transaction stays usable.
    fn rollback_to(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// `RELEASE SAVEPOINT name`.
    fn release_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_statement_accessors() {
        let stmt = PreparedStatement::new(
            1,
            "INSERT INTO book(name) VALUES($1)".to_string(),
            GeneratedKeys::Column("id".to_string()),
        );
        assert_eq!(stmt.id(), 1);
        assert_eq!(stmt.sql(), "INSERT INTO book(name) VALUES($1)");
        assert_eq!(stmt.generated_keys(), &GeneratedKeys::Column("id".into()));
    }

    #[test]
    fn test_generated_keys_requested() {
        assert!(!GeneratedKeys::None.is_requested());
        assert!(GeneratedKeys::Auto.is_requested());
        assert!(GeneratedKeys::Column("id".into()).is_requested());
        assert_eq!(GeneratedKeys::default(), GeneratedKeys::None);
    }
}
