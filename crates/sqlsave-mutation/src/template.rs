//! SQL text for one batch.
//!
//! A template is built from a [`Shape`], so every draft of the batch binds
//! the same properties in the same order. Only the statements the save path
//! needs are covered: INSERT, UPDATE by id or key, and the native upserts of
//! Postgres, SQLite and MySQL.

use crate::executor::Parameter;
use crate::options::SaveMode;
use crate::shape::{Batch, Shape};
use sqlsave_core::{ConfigError, Dialect, Draft, EntityType, Error, Result};

/// Which statement a template renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Upsert { ignore_update: bool },
}

/// Statement text plus the property ordinals bound per row.
#[derive(Debug, Clone)]
pub struct StatementTemplate {
    kind: StatementKind,
    sql: String,
    binds: Vec<usize>,
    /// Version property checked and incremented by an UPDATE
    version: Option<usize>,
    /// The id is not part of the shape; the database generates it
    generates_id: bool,
}

fn config(message: String) -> Error {
    Error::Config(ConfigError { message })
}

struct Placeholders {
    dialect: Dialect,
    next: usize,
}

impl Placeholders {
    fn new(dialect: Dialect) -> Self {
        Self { dialect, next: 0 }
    }

    fn next(&mut self) -> String {
        self.next += 1;
        self.dialect.placeholder(self.next)
    }
}

fn column(dialect: Dialect, ty: &EntityType, ordinal: usize) -> String {
    dialect.quote_identifier(ty.prop(ordinal).column_name)
}

fn insert_prefix(dialect: Dialect, ty: &EntityType, shape: &Shape, ignore: bool) -> String {
    let table = dialect.quote_identifier(ty.table());
    let verb = if ignore { "INSERT IGNORE INTO" } else { "INSERT INTO" };
    if shape.is_empty() {
        return match dialect {
            Dialect::Mysql => format!("{verb} {table}() VALUES()"),
            _ => format!("{verb} {table} DEFAULT VALUES"),
        };
    }
    let mut placeholders = Placeholders::new(dialect);
    let columns: Vec<String> = shape.props().iter().map(|o| column(dialect, ty, *o)).collect();
    let values: Vec<String> = shape.props().iter().map(|_| placeholders.next()).collect();
    format!(
        "{verb} {table}({}) VALUES({})",
        columns.join(", "),
        values.join(", ")
    )
}

impl StatementTemplate {
    /// `INSERT INTO t(cols) VALUES(...)`.
    pub fn insert(dialect: Dialect, ty: &EntityType, shape: &Shape) -> Self {
        Self {
            kind: StatementKind::Insert,
            sql: insert_prefix(dialect, ty, shape, false),
            binds: shape.props().to_vec(),
            version: None,
            generates_id: !shape.contains(ty.id_prop()),
        }
    }

    /// UPDATE by id when the shape has it, otherwise by `key_props`.
    ///
    /// A loaded version is compared in the WHERE clause and incremented.
    /// Returns `None` when the shape has nothing to set.
    #[allow(clippy::result_large_err)]
    pub fn update(
        dialect: Dialect,
        ty: &EntityType,
        shape: &Shape,
        key_props: &[usize],
    ) -> Result<Option<Self>> {
        let id = ty.id_prop();
        let conditions: Vec<usize> = if shape.contains(id) {
            vec![id]
        } else {
            if key_props.is_empty() || key_props.iter().any(|o| !shape.contains(*o)) {
                return Err(config(format!(
                    "cannot update \"{}\" without its id or its complete key",
                    ty.name()
                )));
            }
            key_props.to_vec()
        };
        let version = ty.version_prop().filter(|v| shape.contains(*v));
        let assigned: Vec<usize> = shape
            .props()
            .iter()
            .copied()
            .filter(|o| !conditions.contains(o) && Some(*o) != version)
            .collect();
        if assigned.is_empty() {
            return Ok(None);
        }

        let mut placeholders = Placeholders::new(dialect);
        let mut sets: Vec<String> = assigned
            .iter()
            .map(|o| format!("{} = {}", column(dialect, ty, *o), placeholders.next()))
            .collect();
        let mut wheres: Vec<String> = conditions
            .iter()
            .map(|o| format!("{} = {}", column(dialect, ty, *o), placeholders.next()))
            .collect();
        let mut binds = assigned;
        binds.extend(&conditions);
        if let Some(v) = version {
            let version_column = column(dialect, ty, v);
            sets.push(format!("{version_column} = {version_column} + 1"));
            wheres.push(format!("{version_column} = {}", placeholders.next()));
            binds.push(v);
        }

        Ok(Some(Self {
            kind: StatementKind::Update,
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                dialect.quote_identifier(ty.table()),
                sets.join(", "),
                wheres.join(" AND ")
            ),
            binds,
            version,
            generates_id: false,
        }))
    }

    /// Native upsert resolving conflicts on the id, or on `key_props` when
    /// the shape has no id.
    #[allow(clippy::result_large_err)]
    pub fn upsert(
        dialect: Dialect,
        ty: &EntityType,
        shape: &Shape,
        key_props: &[usize],
        ignore_update: bool,
    ) -> Result<Self> {
        let id = ty.id_prop();
        let target: Vec<usize> = if shape.contains(id) {
            vec![id]
        } else {
            if key_props.is_empty() || key_props.iter().any(|o| !shape.contains(*o)) {
                return Err(config(format!(
                    "cannot upsert \"{}\" without its id or its complete key",
                    ty.name()
                )));
            }
            key_props.to_vec()
        };
        let version = ty.version_prop().filter(|v| shape.contains(*v));
        let assigned: Vec<usize> = shape
            .props()
            .iter()
            .copied()
            .filter(|o| !target.contains(o) && *o != id && Some(*o) != version)
            .collect();
        let ignore = ignore_update || assigned.is_empty();
        let table = dialect.quote_identifier(ty.table());

        let sql = match dialect {
            Dialect::Postgres | Dialect::Sqlite => {
                let conflict: Vec<String> = target.iter().map(|o| column(dialect, ty, *o)).collect();
                let mut sql = format!(
                    "{} ON CONFLICT({})",
                    insert_prefix(dialect, ty, shape, false),
                    conflict.join(", ")
                );
                if ignore {
                    sql.push_str(" DO NOTHING");
                } else {
                    let mut sets: Vec<String> = assigned
                        .iter()
                        .map(|o| {
                            let c = column(dialect, ty, *o);
                            format!("{c} = EXCLUDED.{c}")
                        })
                        .collect();
                    if let Some(v) = version {
                        let c = column(dialect, ty, v);
                        sets.push(format!("{c} = {table}.{c} + 1"));
                        sql.push_str(&format!(
                            " DO UPDATE SET {} WHERE {table}.{c} = EXCLUDED.{c}",
                            sets.join(", ")
                        ));
                    } else {
                        sql.push_str(&format!(" DO UPDATE SET {}", sets.join(", ")));
                    }
                }
                sql
            }
            Dialect::Mysql => {
                if ignore {
                    insert_prefix(dialect, ty, shape, true)
                } else {
                    let sets: Vec<String> = assigned
                        .iter()
                        .map(|o| {
                            let c = column(dialect, ty, *o);
                            format!("{c} = VALUES({c})")
                        })
                        .collect();
                    format!(
                        "{} ON DUPLICATE KEY UPDATE {}",
                        insert_prefix(dialect, ty, shape, false),
                        sets.join(", ")
                    )
                }
            }
            Dialect::Generic => {
                return Err(config(format!(
                    "dialect {:?} has no upsert statement for \"{}\"",
                    dialect,
                    ty.name()
                )));
            }
        };

        Ok(Self {
            kind: StatementKind::Upsert { ignore_update },
            sql,
            binds: shape.props().to_vec(),
            version: None,
            generates_id: !shape.contains(id),
        })
    }

    /// The statement for `batch`, chosen by its mode.
    #[allow(clippy::result_large_err)]
    pub fn for_batch(
        dialect: Dialect,
        ty: &EntityType,
        batch: &Batch,
        key_props: &[usize],
    ) -> Result<Option<Self>> {
        match batch.mode() {
            SaveMode::InsertOnly => Ok(Some(Self::insert(dialect, ty, batch.shape()))),
            SaveMode::UpdateOnly => Self::update(dialect, ty, batch.shape(), key_props),
            SaveMode::Upsert | SaveMode::NonIdempotentUpsert => {
                Self::upsert(dialect, ty, batch.shape(), key_props, false).map(Some)
            }
            SaveMode::InsertIfAbsent => {
                Self::upsert(dialect, ty, batch.shape(), key_props, true).map(Some)
            }
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Ordinals bound per row, in placeholder order.
    pub fn binds(&self) -> &[usize] {
        &self.binds
    }

    /// Version property this UPDATE checks and increments.
    pub fn version(&self) -> Option<usize> {
        self.version
    }

    /// Does the database produce the id of inserted rows?
    pub fn generates_id(&self) -> bool {
        self.generates_id
    }

    /// Parameters of one row, converted to their SQL representation.
    #[allow(clippy::result_large_err)]
    pub fn bind(&self, draft: &Draft) -> Result<Vec<Parameter>> {
        let ty = draft.entity_type();
        self.binds
            .iter()
            .map(|ordinal| {
                let prop = ty.prop(*ordinal);
                let value = draft.column_value(*ordinal).ok_or_else(|| {
                    config(format!(
                        "property \"{}.{}\" is bound by \"{}\" but not loaded",
                        ty.name(),
                        prop.name,
                        self.sql
                    ))
                })?;
                let value = match &prop.converter {
                    Some(converter) if !value.is_null() => converter.to_sql(value)?,
                    _ => value,
                };
                Ok(Parameter::Value(value))
            })
            .collect()
    }
}
