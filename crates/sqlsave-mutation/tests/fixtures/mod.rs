//! Shared fixtures: entity types, an in-memory connection that understands
//! the statements the save pipeline renders, and a counting row lookup over
//! the same rows.

#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use sqlsave_core::{
    BatchOutcome, Connection, Dialect, EntityType, Error, GeneratedKeys, Key, KeyUniqueConstraint,
    PreparedStatement, PropInfo, QueryError, QueryErrorKind, Row, Value,
};
use sqlsave_mutation::{BoxFuture, FetchSpec, RemoteExchange, RowLookup};
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub const STRICT: KeyUniqueConstraint = KeyUniqueConstraint {
    no_more_unique_constraints: true,
    null_not_distinct: true,
};

/// `Book(id, name, edition, price, store -> BookStore, authors -> [Author])`
/// keyed by `(name, edition)`.
pub fn book() -> Arc<EntityType> {
    EntityType::builder("Book", "book")
        .id("id")
        .prop(PropInfo::scalar("name"))
        .prop(PropInfo::scalar("edition"))
        .prop(PropInfo::scalar("price").default_value(Value::Int(0)))
        .prop(PropInfo::reference("store", "store_id", "BookStore"))
        .prop(PropInfo::reference_list("authors", "Author"))
        .key(&["name", "edition"])
        .key_unique_constraint(STRICT)
        .build()
        .expect("valid book type")
}

/// `Book` plus a version column and a logical-delete flag.
pub fn versioned_book() -> Arc<EntityType> {
    EntityType::builder("Book", "book")
        .id("id")
        .prop(PropInfo::scalar("name"))
        .prop(PropInfo::scalar("edition"))
        .prop(PropInfo::scalar("price"))
        .prop(PropInfo::scalar("version"))
        .prop(PropInfo::scalar("deleted"))
        .key(&["name", "edition"])
        .version("version")
        .logical_deleted("deleted", false)
        .key_unique_constraint(STRICT)
        .build()
        .expect("valid versioned book type")
}

/// An author living in another service.
pub fn remote_author() -> Arc<EntityType> {
    EntityType::builder("Author", "author")
        .id("id")
        .prop(PropInfo::scalar("first_name"))
        .microservice("author-service")
        .build()
        .expect("valid author type")
}

pub fn book_row(id: i64, name: &str, edition: i32, price: i32) -> Row {
    Row::new(
        vec!["id".into(), "name".into(), "edition".into(), "price".into()],
        vec![
            Value::BigInt(id),
            Value::Text(name.into()),
            Value::Int(edition),
            Value::Int(price),
        ],
    )
}

pub fn constraint_violation(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: Some(sql.to_string()),
        sqlstate: Some("23505".to_string()),
        message: "duplicate key value violates unique constraint".to_string(),
        source: None,
    })
}

fn get(row: &Row, column: &str) -> Value {
    row.get_by_name(column).cloned().unwrap_or(Value::Null)
}

fn with_values(row: &Row, updates: &[(String, Value)]) -> Row {
    let mut names: Vec<String> = row.iter().map(|(name, _)| name.to_string()).collect();
    let mut values: Vec<Value> = row.iter().map(|(_, value)| value.clone()).collect();
    for (column, value) in updates {
        match names.iter().position(|name| name == column) {
            Some(idx) => values[idx] = value.clone(),
            None => {
                names.push(column.clone());
                values.push(value.clone());
            }
        }
    }
    Row::new(names, values)
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches(|c| c == '"' || c == '`').to_string()
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim();
    s.starts_with('?') || s.starts_with('$')
}

/// Identifiers of the first parenthesized list after `marker`.
fn paren_list(sql: &str, marker: &str) -> Vec<String> {
    let Some(start) = sql.find(marker) else {
        return Vec::new();
    };
    let rest = &sql[start + marker.len()..];
    let (Some(open), Some(close)) = (rest.find('('), rest.find(')')) else {
        return Vec::new();
    };
    if close < open || rest[..open].contains("VALUES") {
        return Vec::new();
    }
    rest[open + 1..close]
        .split(',')
        .map(unquote)
        .filter(|s| !s.is_empty())
        .collect()
}

fn bump(value: Value) -> Value {
    match value {
        Value::Int(v) => Value::Int(v + 1),
        Value::BigInt(v) => Value::BigInt(v + 1),
        other => other,
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Rows of the single table every statement targets
    pub rows: Vec<Row>,
    /// Columns forming a unique constraint checked on plain inserts
    pub unique: Vec<&'static str>,
    pub next_id: i64,
    pub log: Vec<String>,
    pub queries: Vec<String>,
    pub batches: Vec<(String, Vec<Vec<Value>>)>,
    pub lookup_by_id: usize,
    pub lookup_by_key: usize,
    pub lookup_existing: usize,
}

impl MockState {
    fn lookup_calls(&self) -> usize {
        self.lookup_by_id + self.lookup_by_key + self.lookup_existing
    }

    /// Apply a whole batch or nothing.
    fn apply(&mut self, sql: &str, want_keys: bool, rows: &[Vec<Value>]) -> Result<BatchOutcome, Error> {
        let mut table = self.rows.clone();
        let mut next_id = self.next_id;
        let mut outcome = BatchOutcome::default();

        if sql.starts_with("INSERT") {
            let columns = paren_list(sql, "INTO");
            let conflict = paren_list(sql, "ON CONFLICT");
            let ignore = sql.contains("DO NOTHING");
            for params in rows {
                let values: Vec<(String, Value)> =
                    columns.iter().cloned().zip(params.iter().cloned()).collect();
                let staged = |column: &str| {
                    values
                        .iter()
                        .find(|(name, _)| name == column)
                        .map_or(Value::Null, |(_, v)| v.clone())
                };
                let existing = if conflict.is_empty() {
                    None
                } else {
                    table
                        .iter()
                        .position(|row| conflict.iter().all(|c| get(row, c) == staged(c)))
                };
                match existing {
                    Some(_) if ignore => {
                        outcome.update_counts.push(0);
                        outcome.generated_keys.push(Value::Null);
                    }
                    Some(idx) => {
                        let updates: Vec<(String, Value)> = values
                            .iter()
                            .filter(|(name, _)| !conflict.contains(name))
                            .cloned()
                            .collect();
                        outcome.generated_keys.push(get(&table[idx], "id"));
                        table[idx] = with_values(&table[idx], &updates);
                        outcome.update_counts.push(1);
                    }
                    None => {
                        let checks_unique = !self.unique.is_empty()
                            && self.unique.iter().all(|c| columns.iter().any(|n| n == c));
                        if checks_unique
                            && table
                                .iter()
                                .any(|row| self.unique.iter().all(|c| get(row, c) == staged(c)))
                        {
                            return Err(constraint_violation(sql));
                        }
                        let id = if columns.iter().any(|c| c == "id") {
                            staged("id")
                        } else {
                            next_id += 1;
                            Value::BigInt(next_id)
                        };
                        let mut all = vec![("id".to_string(), id.clone())];
                        all.extend(values.iter().filter(|(name, _)| name != "id").cloned());
                        table.push(with_values(&Row::new(Vec::new(), Vec::new()), &all));
                        outcome.update_counts.push(1);
                        outcome.generated_keys.push(id);
                    }
                }
            }
        } else if let Some(rest) = sql.strip_prefix("UPDATE") {
            let set_start = rest.find(" SET ").map_or(0, |i| i + 5);
            let where_start = rest.find(" WHERE ").unwrap_or(rest.len());
            let set_part = &rest[set_start..where_start];
            let where_part = rest.get(where_start + 7..).unwrap_or("");
            for params in rows {
                let mut params = params.iter().cloned();
                let mut updates = Vec::new();
                let mut increments = Vec::new();
                for item in set_part.split(", ") {
                    let Some((column, rhs)) = item.split_once(" = ") else {
                        continue;
                    };
                    if is_placeholder(rhs) {
                        updates.push((unquote(column), params.next().unwrap_or(Value::Null)));
                    } else {
                        increments.push(unquote(column));
                    }
                }
                let conditions: Vec<(String, Value)> = where_part
                    .split(" AND ")
                    .filter_map(|item| item.split_once(" = "))
                    .map(|(column, _)| (unquote(column), params.next().unwrap_or(Value::Null)))
                    .collect();
                let mut count = 0;
                for row in &mut table {
                    if conditions.iter().all(|(c, v)| get(row, c) == *v) {
                        let mut all = updates.clone();
                        for column in &increments {
                            all.push((column.clone(), bump(get(row, column))));
                        }
                        *row = with_values(row, &all);
                        count += 1;
                    }
                }
                outcome.update_counts.push(count);
            }
        }

        if !want_keys {
            outcome.generated_keys.clear();
        }
        self.rows = table;
        self.next_id = next_id;
        Ok(outcome)
    }

    /// Rows selected by the id or key SELECTs of `SqlRowLookup`.
    fn select(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        let Some((_, where_part)) = sql.split_once(" WHERE ") else {
            return self.rows.clone();
        };
        if let Some((column, _)) = where_part.split_once(" IN (") {
            let column = unquote(column);
            return self
                .rows
                .iter()
                .filter(|row| params.contains(&get(row, &column)))
                .cloned()
                .collect();
        }
        let mut params = params.iter().cloned();
        let disjuncts: Vec<Vec<(String, Value)>> = where_part
            .split(" OR ")
            .map(|d| {
                d.trim()
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .split(" AND ")
                    .map(|c| match c.split_once(" IS NULL") {
                        Some((column, _)) => (unquote(column), Value::Null),
                        None => {
                            let (column, _) = c.split_once(" = ").unwrap_or((c, ""));
                            (unquote(column), params.next().unwrap_or(Value::Null))
                        }
                    })
                    .collect()
            })
            .collect();
        self.rows
            .iter()
            .filter(|row| {
                disjuncts
                    .iter()
                    .any(|conds| conds.iter().all(|(c, v)| get(row, c) == *v))
            })
            .cloned()
            .collect()
    }
}

/// Connection over one in-memory table.
#[derive(Debug, Clone)]
pub struct MockConnection {
    pub state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self::with_rows(dialect, Vec::new())
    }

    pub fn with_rows(dialect: Dialect, rows: Vec<Row>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                rows,
                unique: vec!["name", "edition"],
                next_id: 99,
                ..Default::default()
            })),
            dialect,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").log.clone()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().expect("lock poisoned").rows.clone()
    }

    /// SQL text of every executed batch.
    pub fn batch_sql(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .batches
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").queries.clone()
    }

    pub fn lookup_calls(&self) -> usize {
        self.state.lock().expect("lock poisoned").lookup_calls()
    }

    /// A row lookup reading the same rows as this connection.
    pub fn lookup(&self) -> CountingLookup {
        CountingLookup {
            state: Arc::clone(&self.state),
        }
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.queries.push(sql.clone());
            Outcome::Ok(guard.select(&sql, &params))
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.log.push("execute".to_string());
            match guard.apply(&sql, false, &[params]) {
                Ok(outcome) => Outcome::Ok(outcome.update_counts.iter().sum()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
        generated_keys: GeneratedKeys,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.log.push("prepare".to_string());
            let id = guard.log.len() as u64;
            Outcome::Ok(PreparedStatement::new(id, sql, generated_keys))
        }
    }

    fn execute_batch(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        rows: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<BatchOutcome, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = stmt.sql().to_string();
        let want_keys = stmt.generated_keys().is_requested();
        let rows = rows.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.log.push(format!("execute_batch({})", rows.len()));
            guard.batches.push((sql.clone(), rows.clone()));
            match guard.apply(&sql, want_keys, &rows) {
                Ok(outcome) => Outcome::Ok(outcome),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn close_statement(
        &self,
        _cx: &Cx,
        _stmt: PreparedStatement,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").log.push("close".to_string());
            Outcome::Ok(())
        }
    }

    fn savepoint(&self, _cx: &Cx, _name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").log.push("savepoint".to_string());
            Outcome::Ok(())
        }
    }

    fn rollback_to(&self, _cx: &Cx, _name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").log.push("rollback".to_string());
            Outcome::Ok(())
        }
    }

    fn release_savepoint(
        &self,
        _cx: &Cx,
        _name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").log.push("release".to_string());
            Outcome::Ok(())
        }
    }
}

/// Row lookup over the mock table that counts its calls.
#[derive(Debug, Clone)]
pub struct CountingLookup {
    state: Arc<Mutex<MockState>>,
}

impl CountingLookup {
    pub fn by_id(&self) -> usize {
        self.state.lock().expect("lock poisoned").lookup_by_id
    }

    pub fn by_key(&self) -> usize {
        self.state.lock().expect("lock poisoned").lookup_by_key
    }

    pub fn existing(&self) -> usize {
        self.state.lock().expect("lock poisoned").lookup_existing
    }

    pub fn total(&self) -> usize {
        self.state.lock().expect("lock poisoned").lookup_calls()
    }
}

impl RowLookup for CountingLookup {
    fn find_by_ids<'a>(
        &'a self,
        _cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
        _fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.lookup_by_id += 1;
            let id_column = ty.prop(ty.id_prop()).column_name;
            let rows = guard
                .rows
                .iter()
                .filter(|row| ids.contains(&get(row, id_column)))
                .cloned()
                .collect();
            Outcome::Ok(rows)
        })
    }

    fn find_by_keys<'a>(
        &'a self,
        _cx: &'a Cx,
        ty: &'a EntityType,
        key_props: &'a [usize],
        keys: &'a [Key],
        _fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.lookup_by_key += 1;
            let columns: Vec<&str> = key_props
                .iter()
                .map(|ordinal| ty.prop(*ordinal).column_name)
                .collect();
            let rows = guard
                .rows
                .iter()
                .filter(|row| keys.contains(&row.key_of(&columns)))
                .cloned()
                .collect();
            Outcome::Ok(rows)
        })
    }

    fn find_existing_ids<'a>(
        &'a self,
        _cx: &'a Cx,
        ty: &'a EntityType,
        ids: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Value>, Error>> {
        Box::pin(async move {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.lookup_existing += 1;
            let id_column = ty.prop(ty.id_prop()).column_name;
            let found = guard
                .rows
                .iter()
                .map(|row| get(row, id_column))
                .filter(|id| ids.contains(id))
                .collect();
            Outcome::Ok(found)
        })
    }
}

/// Remote service answering id lookups from a fixed set of rows.
#[derive(Debug, Default)]
pub struct MockExchange {
    pub rows: Vec<Row>,
    pub unavailable: bool,
    pub calls: Mutex<Vec<String>>,
}

impl RemoteExchange for MockExchange {
    fn find_by_ids<'a>(
        &'a self,
        _cx: &'a Cx,
        service: &'a str,
        ids: &'a [Value],
        _fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("lock poisoned")
                .push(service.to_string());
            if self.unavailable {
                return Outcome::Err(Error::Custom(format!("{service} is unavailable")));
            }
            let rows = self
                .rows
                .iter()
                .filter(|row| ids.contains(&get(row, "id")))
                .cloned()
                .collect();
            Outcome::Ok(rows)
        })
    }
}
