//! Rows read back by lookups.
//!
//! A looked-up row is the "original" of a draft: interceptors see it, key
//! lookups index it by business key and id lookups by id. Column names are
//! property column names, so a row can be addressed with [`PropInfo::column_name`].
//!
//! [`PropInfo::column_name`]: crate::PropInfo::column_name

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::{Key, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Column names of a result set, shared by all of its rows.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let positions = names
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.clone(), pos))
            .collect();
        Self { names, positions }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One row of a lookup result.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(names: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_columns(Arc::new(ColumnInfo::new(names)), values)
    }

    /// A row of a result set whose column names are already known.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .position(name)
            .and_then(|pos| self.values.get(pos))
    }

    /// Value of a column the lookup was asked to fetch.
    #[allow(clippy::result_large_err)]
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: "fetched column",
                actual: "a row without it".to_string(),
                column: Some(name.to_string()),
            })
        })
    }

    /// Key made of the given columns; a column the row lacks counts as NULL.
    pub fn key_of(&self, columns: &[&str]) -> Key {
        Key::composite(
            columns
                .iter()
                .map(|column| self.get_by_name(column).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// (column, value) pairs in result-set order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(&self.values)
    }
}
