//! Batch contexts driven by hand: savepoints, generated ids and error
//! translation.

mod fixtures;

use asupersync::Cx;
use asupersync::runtime::RuntimeBuilder;
use fixtures::{MockConnection, book, unwrap_err, unwrap_outcome};
use sqlsave_core::{Dialect, Error, Value};
use sqlsave_mutation::{
    ExceptionTranslator, Executor, GeneratedIdSpec, IdGenerator, Parameter, TranslateContext,
};
use std::sync::Arc;

const INSERT: &str = r#"INSERT INTO "book"("name", "edition") VALUES($1, $2)"#;

struct Labelled(&'static str);

impl ExceptionTranslator for Labelled {
    fn translate(&self, error: &Error, _ctx: &TranslateContext<'_>) -> Option<Error> {
        error
            .sqlstate()
            .map(|state| Error::Custom(format!("{}: {}", self.0, state)))
    }
}

fn row(name: &str, edition: i32) -> Vec<Parameter> {
    vec![Value::from(name).into(), Value::Int(edition).into()]
}

#[test]
fn single_row_batch_returns_one_generated_id() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new(Dialect::Postgres);
    let executor = Executor::new(&conn);
    let ty = book();

    rt.block_on(async {
        let ids = GeneratedIdSpec::for_type(&ty, Some(&IdGenerator::Identity));
        let mut batch = unwrap_outcome(executor.open_batch(&cx, INSERT, ids).await);
        assert!(batch.is_empty());
        batch.add(&row("A", 1)).expect("row staged");
        assert_eq!(batch.len(), 1);

        let counts = unwrap_outcome(batch.execute(&cx, None).await);
        assert_eq!(counts, vec![1]);
        assert_eq!(batch.generated_ids().expect("ids"), vec![Value::BigInt(100)]);
        unwrap_outcome(batch.close(&cx).await);
    });
    assert_eq!(
        conn.log(),
        vec!["savepoint", "prepare", "execute_batch(1)", "release", "close"]
    );
}

#[test]
fn ids_are_not_read_without_a_database_generator() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new(Dialect::Sqlite);
    let executor = Executor::new(&conn);

    rt.block_on(async {
        let result = unwrap_outcome(
            executor
                .run_batch(
                    &cx,
                    INSERT,
                    GeneratedIdSpec::none(),
                    &[row("A", 1), row("B", 1)],
                    None,
                )
                .await,
        );
        assert_eq!(result.update_counts, vec![1, 1]);
        assert!(result.generated_ids.is_empty());
    });
    assert_eq!(conn.log(), vec!["prepare", "execute_batch(2)", "close"]);
}

#[test]
fn per_call_translator_takes_precedence() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new(Dialect::Postgres);
    let client: Arc<dyn ExceptionTranslator> = Arc::new(Labelled("client"));
    let executor = Executor::new(&conn).with_translator(Some(client));
    let duplicates = [row("A", 1), row("A", 1)];

    rt.block_on(async {
        let err = unwrap_err(
            executor
                .run_batch(&cx, INSERT, GeneratedIdSpec::none(), &duplicates, None)
                .await,
        );
        assert_eq!(err.to_string(), "client: 23505");

        let call: &dyn ExceptionTranslator = &Labelled("call");
        let err = unwrap_err(
            executor
                .run_batch(&cx, INSERT, GeneratedIdSpec::none(), &duplicates, Some(call))
                .await,
        );
        assert_eq!(err.to_string(), "call: 23505");
    });
    assert!(conn.rows().is_empty());
    let rollbacks = conn.log().iter().filter(|entry| *entry == "rollback").count();
    assert_eq!(rollbacks, 2);
}

#[test]
fn typed_list_is_bound_as_array() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new(Dialect::Postgres);
    let executor = Executor::new(&conn);
    let list = Parameter::TypedList {
        sql_element_type: "bigint",
        values: vec![Value::BigInt(1), Value::BigInt(2)],
    };

    rt.block_on(async {
        let rows = unwrap_outcome(
            executor
                .query(&cx, r#"SELECT "id" FROM "book" WHERE "id" = ANY($1)"#, &[list])
                .await,
        );
        assert!(rows.is_empty());
    });
    assert_eq!(conn.queries().len(), 1);
}

#[test]
fn single_statement_failure_names_the_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new(Dialect::Sqlite);
    let executor = Executor::new(&conn);

    rt.block_on(async {
        let first = unwrap_outcome(executor.execute(&cx, INSERT, &row("A", 1)).await);
        assert_eq!(first, 1);

        let err = unwrap_err(executor.execute(&cx, INSERT, &row("A", 1)).await);
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(err.sql(), Some(INSERT));
        assert_eq!(err.sqlstate(), Some("23505"));
    });
    assert_eq!(conn.rows().len(), 1);
}
