//! Pre-existence lookups.
//!
//! A [`RowLookup`] fetches the rows that already exist for a set of ids or
//! business keys. Returned rows use property column names; references carry
//! the target id in their foreign key column.

use crate::hooks::BoxFuture;
use asupersync::{Cx, Outcome};
use sqlsave_core::{Connection, Dialect, EntityType, Error, Key, Row, Value};

/// Properties to fetch for each looked-up row, by ordinal.
///
/// The id is always first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    props: Vec<usize>,
}

impl FetchSpec {
    pub fn id_only(ty: &EntityType) -> Self {
        Self {
            props: vec![ty.id_prop()],
        }
    }

    /// Add a property; duplicates are ignored.
    pub fn with(mut self, ordinal: usize) -> Self {
        if !self.props.contains(&ordinal) {
            self.props.push(ordinal);
        }
        self
    }

    pub fn props(&self) -> &[usize] {
        &self.props
    }

    /// Column names to select, skipping properties without a column.
    pub fn columns<'t>(&self, ty: &'t EntityType) -> Vec<&'t str> {
        self.props
            .iter()
            .map(|ordinal| ty.prop(*ordinal))
            .filter(|prop| prop.is_column_definition())
            .map(|prop| prop.column_name)
            .collect()
    }
}

/// Finds existing rows before a save decides between insert and update.
pub trait RowLookup: Send + Sync {
    /// Rows whose id is in `ids`.
    fn find_by_ids<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
        fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    /// Rows whose `key_props` columns equal one of `keys`.
    fn find_by_keys<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        key_props: &'a [usize],
        keys: &'a [Key],
        fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    /// The subset of `ids` that exist, ignoring every row filter
    /// (including logical deletion).
    fn find_existing_ids<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Value>, Error>>;
}

fn select_list(dialect: Dialect, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT <columns> FROM <table> WHERE <id> IN (...)`.
pub fn select_by_ids_sql(dialect: Dialect, ty: &EntityType, columns: &[&str], ids: usize) -> String {
    let id_column = ty.prop(ty.id_prop()).column_name;
    let placeholders: Vec<String> = (1..=ids).map(|i| dialect.placeholder(i)).collect();
    format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        select_list(dialect, columns),
        dialect.quote_identifier(ty.table()),
        dialect.quote_identifier(id_column),
        placeholders.join(", ")
    )
}

/// SELECT by business key, one OR-ed conjunction per key.
///
/// NULL key parts compare with `IS NULL` and bind nothing.
pub fn select_by_keys_sql(
    dialect: Dialect,
    ty: &EntityType,
    columns: &[&str],
    key_props: &[usize],
    keys: &[Key],
) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let mut disjuncts = Vec::with_capacity(keys.len());
    for key in keys {
        let mut conjuncts = Vec::with_capacity(key_props.len());
        for (ordinal, value) in key_props.iter().zip(key.values()) {
            let column = dialect.quote_identifier(ty.prop(*ordinal).column_name);
            if value.is_null() {
                conjuncts.push(format!("{} IS NULL", column));
            } else {
                params.push(value.clone());
                conjuncts.push(format!("{} = {}", column, dialect.placeholder(params.len())));
            }
        }
        disjuncts.push(format!("({})", conjuncts.join(" AND ")));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list(dialect, columns),
        dialect.quote_identifier(ty.table()),
        disjuncts.join(" OR ")
    );
    (sql, params)
}

/// [`RowLookup`] issuing plain SELECTs on a borrowed connection.
#[derive(Debug)]
pub struct SqlRowLookup<'c, C: Connection> {
    conn: &'c C,
}

impl<'c, C: Connection> SqlRowLookup<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }
}

impl<C: Connection> RowLookup for SqlRowLookup<'_, C> {
    fn find_by_ids<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
        fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Outcome::Ok(Vec::new());
            }
            let sql = select_by_ids_sql(self.conn.dialect(), ty, &fetch.columns(ty), ids.len());
            tracing::trace!(sql = %sql, ids = ids.len(), "Looking up rows by id");
            self.conn.query(cx, &sql, ids).await
        })
    }

    fn find_by_keys<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        key_props: &'a [usize],
        keys: &'a [Key],
        fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Outcome::Ok(Vec::new());
            }
            let (sql, params) =
                select_by_keys_sql(self.conn.dialect(), ty, &fetch.columns(ty), key_props, keys);
            tracing::trace!(sql = %sql, keys = keys.len(), "Looking up rows by key");
            self.conn.query(cx, &sql, &params).await
        })
    }

    fn find_existing_ids<'a>(
        &'a self,
        cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Value>, Error>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Outcome::Ok(Vec::new());
            }
            let id_column = ty.prop(ty.id_prop()).column_name;
            let sql = select_by_ids_sql(self.conn.dialect(), ty, &[id_column], ids.len());
            tracing::trace!(sql = %sql, ids = ids.len(), "Checking referenced ids");
            match self.conn.query(cx, &sql, ids).await {
                Outcome::Ok(rows) => Outcome::Ok(
                    rows.iter()
                        .filter_map(|row| row.get_by_name(id_column).cloned())
                        .collect(),
                ),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        })
    }
}
