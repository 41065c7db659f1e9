//! Save resolution and shaped batch execution for SQLSave Rust.
//!
//! `sqlsave-mutation` is the **write path**. Given partially populated
//! drafts and a [`SaveMode`], it decides per draft whether a row already
//! exists, groups drafts with the same loaded columns into one prepared
//! statement, and runs those batches on a borrowed connection.
//!
//! # Role In The Architecture
//!
//! - **Resolution**: [`PreHandler`] classifies drafts by id, business key or
//!   neither, decides through [`QueryReason`] whether a lookup is needed and
//!   splits drafts into inserted, updated and merged [`ShapedEntityMap`]s.
//! - **Execution**: [`Executor`] and [`BatchContext`] run one statement per
//!   [`Batch`], guarded by a savepoint on dialects where an error aborts the
//!   transaction.
//! - **Driver**: [`Saver`] wires both together with [`StatementTemplate`]s
//!   and writes generated ids and versions back.
//!
//! # Example
//!
//! ```ignore
//! let options = SaveOptions::new(SaveMode::Upsert)
//!     .dialect(Dialect::Postgres)
//!     .with_id_generator("Book", IdGenerator::Identity);
//! let saver = Saver::new(&conn, &options);
//!
//! let draft = Draft::new(Arc::clone(&book))
//!     .with("name", "GraphQL in Action")
//!     .with("edition", 3);
//! let result = saver.save(&cx, SavePath::root(book), vec![draft]).await?;
//! ```

pub mod executor;
pub mod hooks;
pub mod lookup;
pub mod options;
pub mod pre_handler;
pub mod query_reason;
pub mod saver;
pub mod shape;
pub mod template;

pub use executor::{BatchContext, BatchResult, DbLiteral, Executor, GeneratedIdSpec, Parameter};
pub use hooks::{
    BoxFuture, DraftInterceptor, DraftPreProcessor, ExceptionTranslator, IdGenerator,
    RemoteExchange, TranslateContext, UserIdGenerator,
};
pub use lookup::{FetchSpec, RowLookup, SqlRowLookup, select_by_ids_sql, select_by_keys_sql};
pub use options::{PathStep, SaveMode, SaveOptions, SavePath, WildObjects};
pub use pre_handler::{PreHandler, ResolvedMaps};
pub use query_reason::{QueryReason, ReasonContext};
pub use saver::{SaveResult, Saver};
pub use shape::{Batch, DraftId, PropFilter, Shape, ShapedEntityMap};
pub use template::{StatementKind, StatementTemplate};
