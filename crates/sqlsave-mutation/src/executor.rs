//! Statement and batch execution.
//!
//! [`Executor`] runs single statements with a flat parameter list and opens
//! [`BatchContext`]s, one per shape and operation. A batch context owns its
//! prepared statement and, on dialects where any failure aborts the whole
//! transaction, a savepoint taken before the statement was prepared.

use crate::hooks::{ExceptionTranslator, IdGenerator, TranslateContext};
use asupersync::{Cx, Outcome};
use sqlsave_core::{
    BatchOutcome, Connection, Dialect, EntityType, Error, GeneratedKeys, PreparedStatement, Result,
    Row, TransactionError, TransactionErrorKind, TypeError, Value, ValueConverter,
};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_savepoint_name() -> String {
    format!("sqlsave_batch_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed))
}

fn savepoint_error(kind: TransactionErrorKind, message: String) -> Error {
    Error::Transaction(TransactionError { kind, message })
}

/// A domain value that knows how to become a bindable value.
pub trait DbLiteral: Send + Sync + fmt::Debug {
    #[allow(clippy::result_large_err)]
    fn to_value(&self, dialect: Dialect) -> Result<Value>;
}

/// One positional statement parameter.
#[derive(Debug, Clone)]
pub enum Parameter {
    /// Plain scalar
    Value(Value),
    /// Converted by the literal itself at bind time
    Literal(Arc<dyn DbLiteral>),
    /// Bound as one native array of `sql_element_type`
    TypedList {
        sql_element_type: &'static str,
        values: Vec<Value>,
    },
}

impl Parameter {
    /// The value handed to the driver.
    #[allow(clippy::result_large_err)]
    pub fn bind(&self, dialect: Dialect) -> Result<Value> {
        match self {
            Parameter::Value(v) => Ok(v.clone()),
            Parameter::Literal(literal) => literal.to_value(dialect),
            Parameter::TypedList {
                sql_element_type,
                values,
            } => {
                if let Some(nested) = values.iter().find(|v| matches!(v, Value::Array(_))) {
                    return Err(Error::Type(TypeError {
                        expected: "scalar array element",
                        actual: format!("{} in {}[]", nested.type_name(), sql_element_type),
                        column: None,
                    }));
                }
                Ok(Value::Array(values.clone()))
            }
        }
    }
}

impl From<Value> for Parameter {
    fn from(value: Value) -> Self {
        Parameter::Value(value)
    }
}

#[allow(clippy::result_large_err)]
fn bind_all(dialect: Dialect, params: &[Parameter]) -> Result<Vec<Value>> {
    params.iter().map(|p| p.bind(dialect)).collect()
}

/// How a batch reads generated ids back, and how to convert them.
#[derive(Clone, Default)]
pub struct GeneratedIdSpec {
    keys: GeneratedKeys,
    converter: Option<Arc<dyn ValueConverter>>,
}

impl GeneratedIdSpec {
    /// No ids are read back.
    pub fn none() -> Self {
        Self::default()
    }

    /// Ids of `ty` as produced by `generator`; only database generators
    /// request anything.
    pub fn for_type(ty: &EntityType, generator: Option<&IdGenerator>) -> Self {
        match generator {
            Some(generator) => Self {
                keys: generator.generated_keys(ty),
                converter: ty.prop(ty.id_prop()).converter.clone(),
            },
            None => Self::none(),
        }
    }

    pub fn keys(&self) -> &GeneratedKeys {
        &self.keys
    }
}

impl fmt::Debug for GeneratedIdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedIdSpec")
            .field("keys", &self.keys)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

/// Counts and ids of one executed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub update_counts: Vec<u64>,
    /// One id per staged row, or empty when none were requested
    pub generated_ids: Vec<Value>,
}

/// Runs statements on a borrowed connection.
pub struct Executor<'c, C: Connection> {
    conn: &'c C,
    translator: Option<Arc<dyn ExceptionTranslator>>,
}

impl<'c, C: Connection> Executor<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self {
            conn,
            translator: None,
        }
    }

    /// Client-wide translator, consulted when a call brings none of its own.
    pub fn with_translator(mut self, translator: Option<Arc<dyn ExceptionTranslator>>) -> Self {
        self.translator = translator;
        self
    }

    pub fn connection(&self) -> &'c C {
        self.conn
    }

    fn fail(&self, error: Error, sql: &str, params: Vec<Value>) -> Error {
        let ctx = TranslateContext {
            sql,
            rows: std::slice::from_ref(&params),
        };
        match self.translator.as_ref().and_then(|t| t.translate(&error, &ctx)) {
            Some(mapped) => mapped,
            None => Error::execution("Cannot execute SQL statement", sql, params, Some(error)),
        }
    }

    /// Execute one statement and return the affected row count.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Parameter]) -> Outcome<u64, Error> {
        let values = match bind_all(self.conn.dialect(), params) {
            Ok(values) => values,
            Err(e) => return Outcome::Err(e),
        };
        tracing::trace!(sql = %sql, params = values.len(), "Executing statement");
        match self.conn.execute(cx, sql, &values).await {
            Outcome::Ok(count) => Outcome::Ok(count),
            Outcome::Err(e) => Outcome::Err(self.fail(e, sql, values)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run one query and return its rows.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Parameter]) -> Outcome<Vec<Row>, Error> {
        let values = match bind_all(self.conn.dialect(), params) {
            Ok(values) => values,
            Err(e) => return Outcome::Err(e),
        };
        tracing::trace!(sql = %sql, params = values.len(), "Executing query");
        match self.conn.query(cx, sql, &values).await {
            Outcome::Ok(rows) => Outcome::Ok(rows),
            Outcome::Err(e) => Outcome::Err(self.fail(e, sql, values)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Open a batch for `sql`. The caller must [`close`](BatchContext::close)
    /// it; [`Executor::run_batch`] does so on every path.
    pub async fn open_batch(
        &self,
        cx: &Cx,
        sql: &str,
        ids: GeneratedIdSpec,
    ) -> Outcome<BatchContext<'c, C>, Error> {
        BatchContext::open(self.conn, cx, sql, ids, self.translator.clone()).await
    }

    /// Open, stage `rows`, execute, read ids and close.
    #[tracing::instrument(level = "debug", skip(self, cx, ids, rows, translator), fields(rows = rows.len()))]
    pub async fn run_batch(
        &self,
        cx: &Cx,
        sql: &str,
        ids: GeneratedIdSpec,
        rows: &[Vec<Parameter>],
        translator: Option<&dyn ExceptionTranslator>,
    ) -> Outcome<BatchResult, Error> {
        let mut batch = match self.open_batch(cx, sql, ids).await {
            Outcome::Ok(batch) => batch,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = batch.run(cx, rows, translator).await;
        let closed = batch.close(cx).await;
        match result {
            Outcome::Ok(result) => match closed {
                Outcome::Ok(()) => Outcome::Ok(result),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            failed => {
                if let Outcome::Err(e) = &closed {
                    tracing::warn!(error = %e, "Failed to close batch statement after an error");
                }
                failed
            }
        }
    }
}

impl<C: Connection> fmt::Debug for Executor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("dialect", &self.conn.dialect())
            .field("translator", &self.translator.is_some())
            .finish()
    }
}

/// One prepared batch statement and its staged rows.
pub struct BatchContext<'c, C: Connection> {
    conn: &'c C,
    dialect: Dialect,
    sql: String,
    statement: Option<PreparedStatement>,
    savepoint: Option<String>,
    ids: GeneratedIdSpec,
    client_translator: Option<Arc<dyn ExceptionTranslator>>,
    rows: Vec<Vec<Value>>,
    outcome: Option<BatchOutcome>,
}

impl<'c, C: Connection> BatchContext<'c, C> {
    /// Take a savepoint if the dialect needs one, then prepare `sql`.
    pub async fn open(
        conn: &'c C,
        cx: &Cx,
        sql: &str,
        ids: GeneratedIdSpec,
        client_translator: Option<Arc<dyn ExceptionTranslator>>,
    ) -> Outcome<Self, Error> {
        let dialect = conn.dialect();
        let savepoint = if dialect.is_transaction_aborted_by_error() {
            let name = next_savepoint_name();
            match conn.savepoint(cx, &name).await {
                Outcome::Ok(()) => Some(name),
                Outcome::Err(e) => {
                    return Outcome::Err(savepoint_error(
                        TransactionErrorKind::SavepointFailed,
                        format!("cannot create savepoint {name} before batch: {e}"),
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            None
        };

        let statement = match conn.prepare(cx, sql, ids.keys.clone()).await {
            Outcome::Ok(statement) => statement,
            Outcome::Err(e) => {
                if let Some(name) = &savepoint {
                    release_quietly(conn, cx, name).await;
                }
                return Outcome::Err(Error::execution(
                    "Cannot create the batch SQL statement",
                    sql,
                    Vec::new(),
                    Some(e),
                ));
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        tracing::trace!(sql = %sql, savepoint = ?savepoint, "Opened batch");

        Outcome::Ok(Self {
            conn,
            dialect,
            sql: sql.to_string(),
            statement: Some(statement),
            savepoint,
            ids,
            client_translator,
            rows: Vec::new(),
            outcome: None,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of staged rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Bind and stage one row.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, params: &[Parameter]) -> Result<()> {
        let values = bind_all(self.dialect, params).map_err(|e| {
            Error::execution(
                "Cannot add batch into the batch SQL statement",
                self.sql.as_str(),
                Vec::new(),
                Some(e),
            )
        })?;
        self.rows.push(values);
        Ok(())
    }

    /// Run the staged rows and return one update count per row.
    ///
    /// On failure the savepoint (if any) is rolled back, then `translator`
    /// gets the error; without one the client-wide translator does. An
    /// unmapped failure is wrapped with the statement text.
    #[tracing::instrument(level = "debug", skip(self, cx, translator), fields(sql = %self.sql, rows = self.rows.len()))]
    pub async fn execute(
        &mut self,
        cx: &Cx,
        translator: Option<&dyn ExceptionTranslator>,
    ) -> Outcome<Vec<u64>, Error> {
        let Some(statement) = &self.statement else {
            return Outcome::Err(Error::Custom(format!(
                "batch statement is already closed: {}",
                self.sql
            )));
        };
        let error = match self.conn.execute_batch(cx, statement, &self.rows).await {
            Outcome::Ok(outcome) => {
                if let Some(name) = self.savepoint.take() {
                    release_quietly(self.conn, cx, &name).await;
                }
                let counts = outcome.update_counts.clone();
                self.outcome = Some(outcome);
                return Outcome::Ok(counts);
            }
            Outcome::Err(e) => e,
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        tracing::debug!(error = %error, "Batch execution failed");
        if let Some(name) = self.savepoint.take() {
            match self.conn.rollback_to(cx, &name).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    return Outcome::Err(savepoint_error(
                        TransactionErrorKind::RollbackFailed,
                        format!("cannot roll back to savepoint {name} after \"{error}\": {e}"),
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            release_quietly(self.conn, cx, &name).await;
        }

        let ctx = TranslateContext {
            sql: &self.sql,
            rows: &self.rows,
        };
        let translated = match translator {
            Some(translator) => translator.translate(&error, &ctx),
            None => self
                .client_translator
                .as_ref()
                .and_then(|t| t.translate(&error, &ctx)),
        };
        Outcome::Err(translated.unwrap_or_else(|| {
            Error::batch_execution(
                "Cannot execute the batch SQL statement",
                self.sql.as_str(),
                self.rows.clone(),
                Some(error),
            )
        }))
    }

    /// One generated id per staged row in staging order, converted by the
    /// id property's converter. Empty when no ids were requested.
    ///
    /// A NULL entry means the row produced no id (an ignored conflict).
    #[allow(clippy::result_large_err)]
    pub fn generated_ids(&self) -> Result<Vec<Value>> {
        if !self.ids.keys.is_requested() {
            return Ok(Vec::new());
        }
        let fail = |message: String, source: Option<Error>| {
            Error::execution(message, self.sql.as_str(), Vec::new(), source)
        };
        let Some(outcome) = &self.outcome else {
            return Err(fail(
                "Cannot get generated ids before the batch is executed".to_string(),
                None,
            ));
        };
        if outcome.generated_keys.len() != self.rows.len() {
            return Err(fail(
                format!(
                    "Cannot get generated ids for batch SQL statement, expected {} but the driver returned {}",
                    self.rows.len(),
                    outcome.generated_keys.len()
                ),
                None,
            ));
        }
        outcome
            .generated_keys
            .iter()
            .map(|id| match (&self.ids.converter, id) {
                (_, Value::Null) | (None, _) => Ok(id.clone()),
                (Some(converter), _) => converter.from_sql(id.clone()),
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                fail(
                    "Cannot get generated ids for batch SQL statement".to_string(),
                    Some(e),
                )
            })
    }

    /// Release the prepared statement and any savepoint still held.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        let closed = match self.statement.take() {
            Some(statement) => self.conn.close_statement(cx, statement).await,
            None => Outcome::Ok(()),
        };
        if let Some(name) = self.savepoint.take() {
            release_quietly(self.conn, cx, &name).await;
        }
        match closed {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(Error::execution(
                "Cannot close the batch SQL statement",
                self.sql.as_str(),
                Vec::new(),
                Some(e),
            )),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn run(
        &mut self,
        cx: &Cx,
        rows: &[Vec<Parameter>],
        translator: Option<&dyn ExceptionTranslator>,
    ) -> Outcome<BatchResult, Error> {
        for row in rows {
            if let Err(e) = self.add(row) {
                return Outcome::Err(e);
            }
        }
        let update_counts = match self.execute(cx, translator).await {
            Outcome::Ok(counts) => counts,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.generated_ids() {
            Ok(generated_ids) => Outcome::Ok(BatchResult {
                update_counts,
                generated_ids,
            }),
            Err(e) => Outcome::Err(e),
        }
    }
}

async fn release_quietly<C: Connection>(conn: &C, cx: &Cx, name: &str) {
    if let Outcome::Err(e) = conn.release_savepoint(cx, name).await {
        tracing::warn!(savepoint = name, error = %e, "Failed to release savepoint");
    }
}

impl<C: Connection> Drop for BatchContext<'_, C> {
    fn drop(&mut self) {
        if self.statement.is_some() {
            tracing::warn!(sql = %self.sql, "Batch context dropped without close");
        }
    }
}

impl<C: Connection> fmt::Debug for BatchContext<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchContext")
            .field("sql", &self.sql)
            .field("rows", &self.rows.len())
            .field("savepoint", &self.savepoint)
            .field("ids", &self.ids)
            .field("executed", &self.outcome.is_some())
            .finish_non_exhaustive()
    }
}
