//! Core types and traits for SQLSave Rust.
//!
//! This crate provides the vocabulary shared by the save pipeline:
//!
//! - `Value` and `Key` for dynamically-typed column values and identities
//! - `EntityType` / `PropInfo` metadata describing entities and their properties
//! - `Draft`, a partially populated entity that tracks which properties are loaded
//! - `Connection` trait for the statements, batches and savepoints a save issues
//! - `Dialect` answering the capability questions that drive save resolution
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod draft;
pub mod error;
pub mod fields_set;
pub mod meta;
pub mod row;
pub mod value;

pub use connection::{BatchOutcome, Connection, GeneratedKeys, PreparedStatement};
pub use dialect::Dialect;
pub use draft::{Draft, PropValue};
pub use error::{
    ConfigError, Error, ExecutionError, QueryError, QueryErrorKind, Result, SaveError,
    SaveErrorKind, TransactionError, TransactionErrorKind, TypeError,
};
pub use fields_set::FieldsSet;
pub use meta::{
    DefaultValue, EntityType, EntityTypeBuilder, KeyUniqueConstraint, LogicalDeletedInfo,
    PropInfo, PropKind, ValueConverter,
};
pub use row::{ColumnInfo, Row};
pub use value::{Key, Value};
