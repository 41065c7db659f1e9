//! Error types for SQLSave operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all save operations.
#[derive(Debug)]
pub enum Error {
    /// Driver-level query failures (constraint violations, syntax, deadlocks)
    Query(QueryError),
    /// A value could not be converted to or from its column type
    Type(TypeError),
    /// Savepoint and transaction errors
    Transaction(TransactionError),
    /// Classification, validation and resolution failures of a save
    Save(SaveError),
    /// A driver failure wrapped with the offending SQL and parameters
    Execution(ExecutionError),
    /// Entity metadata or save options that cannot work together
    Config(ConfigError),
    /// Free-form error, typically produced by an exception translator
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    Syntax,
    /// Unique, foreign key or check constraint rejected the row
    Constraint,
    /// Unknown table or column
    NotFound,
    Deadlock,
    Serialization,
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The savepoint guarding a batch could not be taken
    SavepointFailed,
    /// A failed batch could not be rolled back to its savepoint
    RollbackFailed,
}

/// A fatal error raised while classifying, validating or resolving drafts.
///
/// None of these are retried; they abort the whole save call.
#[derive(Debug, Clone)]
pub struct SaveError {
    pub kind: SaveErrorKind,
    /// Entity type being saved
    pub entity: String,
    /// Association path the entity was reached through, `<root>` for the root
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveErrorKind {
    /// Draft has neither an id nor any business-key property
    NeitherIdNorKey,
    /// Draft has some, but not all, business-key properties
    NoKey,
    /// A remote association child carries more than its id
    LongRemoteAssociation,
    /// A referenced id does not exist
    IllegalTargetId,
    /// The remote service could not be asked to validate ids
    FailedRemoteValidation,
    /// No id generator is configured for an entity without an id
    NoIdGenerator,
    /// A draft interceptor changed an id or key column
    IllegalInterceptorBehavior,
}

impl SaveErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SaveErrorKind::NeitherIdNorKey => "NEITHER_ID_NOR_KEY",
            SaveErrorKind::NoKey => "NO_KEY",
            SaveErrorKind::LongRemoteAssociation => "LONG_REMOTE_ASSOCIATION",
            SaveErrorKind::IllegalTargetId => "ILLEGAL_TARGET_ID",
            SaveErrorKind::FailedRemoteValidation => "FAILED_REMOTE_VALIDATION",
            SaveErrorKind::NoIdGenerator => "NO_ID_GENERATOR",
            SaveErrorKind::IllegalInterceptorBehavior => "ILLEGAL_INTERCEPTOR_BEHAVIOR",
        }
    }
}

/// A statement failed and no translator mapped the failure.
#[derive(Debug)]
pub struct ExecutionError {
    pub message: String,
    pub sql: String,
    /// Parameter values of a failing single statement
    pub params: Vec<Value>,
    /// Staged rows of a failing batch, in staging order
    pub batch: Vec<Vec<Value>>,
    pub source: Option<Box<Error>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Build a save error of the given kind.
    pub fn save(
        kind: SaveErrorKind,
        entity: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Save(SaveError {
            kind,
            entity: entity.into(),
            path: path.into(),
            message: message.into(),
        })
    }

    /// Wrap a failure with the SQL text and parameters that produced it.
    pub fn execution(
        message: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Value>,
        source: Option<Error>,
    ) -> Self {
        Error::Execution(ExecutionError {
            message: message.into(),
            sql: sql.into(),
            params,
            batch: Vec::new(),
            source: source.map(Box::new),
        })
    }

    /// Wrap a batch failure with the SQL text and every staged row.
    pub fn batch_execution(
        message: impl Into<String>,
        sql: impl Into<String>,
        batch: Vec<Vec<Value>>,
        source: Option<Error>,
    ) -> Self {
        Error::Execution(ExecutionError {
            message: message.into(),
            sql: sql.into(),
            params: Vec::new(),
            batch,
            source: source.map(Box::new),
        })
    }

    /// The save error kind, if this is a save error.
    pub fn save_kind(&self) -> Option<SaveErrorKind> {
        match self {
            Error::Save(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Deadlocks and serialization failures may succeed on a fresh
    /// transaction. Looks through execution wrappers to the driver failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Execution(e) => e.source.as_deref().is_some_and(Error::is_retryable),
            _ => false,
        }
    }

    /// SQLSTATE of the underlying driver failure.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Execution(e) => e.source.as_deref().and_then(Error::sqlstate),
            _ => None,
        }
    }

    /// Statement text attached to the failure.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Execution(e) => Some(&e.sql),
            _ => None,
        }
    }
}

impl QueryError {
    /// Unique or primary key conflict (SQLSTATE 23505).
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                write!(f, "Database error: {}", e)
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => match e.kind {
                TransactionErrorKind::SavepointFailed => write!(f, "Savepoint error: {}", e.message),
                TransactionErrorKind::RollbackFailed => write!(f, "Rollback error: {}", e.message),
            },
            Error::Save(e) => write!(f, "Save error: {}", e),
            Error::Execution(e) => write!(f, "Execution error: {}", e),
            Error::Config(e) => write!(f, "Invalid configuration: {}", e.message),
            Error::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Execution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        match &self.sqlstate {
            Some(state) => write!(f, " [{state}]"),
            None => Ok(()),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, got {}", self.expected, self.actual)?;
        if let Some(column) = &self.column {
            write!(f, " (column \"{column}\")")?;
        }
        Ok(())
    }
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] cannot save \"{}\" at path \"{}\": {}",
            self.kind.as_str(),
            self.entity,
            self.path,
            self.message
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.sql)?;
        if !self.params.is_empty() {
            write!(f, ", variables: {:?}", self.params)?;
        }
        if !self.batch.is_empty() {
            write!(f, ", batch variables: {:?}", self.batch)?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for SaveError {}

/// Result type alias for SQLSave operations.
pub type Result<T> = std::result::Result<T, Error>;
