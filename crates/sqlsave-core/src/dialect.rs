//! SQL dialects and the capabilities the save engine asks them about.

use serde::{Deserialize, Serialize};

/// SQL dialect of the connected database.
///
/// Besides placeholder and quoting rules, a dialect answers the yes/no
/// questions that decide whether a save can trust the database to resolve
/// insert-vs-update on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// Portable SQL without any upsert statement
    Generic,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql | Dialect::Generic => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Generic => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Can the dialect express insert-or-update in one statement?
    pub const fn is_upsert_supported(self) -> bool {
        !matches!(self, Dialect::Generic)
    }

    /// Can the upsert statement carry an optimistic-lock predicate on its
    /// update branch?
    pub const fn is_upsert_with_optimistic_lock_supported(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Can the upsert name the one unique constraint it resolves against,
    /// when the table has other unique constraints too?
    pub const fn is_upsert_with_multiple_unique_constraint_supported(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Does the upsert treat NULL key columns as equal to each other?
    pub const fn is_upsert_with_nullable_key_supported(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Does any statement error abort the enclosing transaction, so that a
    /// batch needs a savepoint to fail without losing the transaction?
    pub const fn is_transaction_aborted_by_error(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}
