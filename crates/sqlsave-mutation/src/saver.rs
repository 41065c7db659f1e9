//! Save driver.
//!
//! [`Saver`] runs one save path end to end: classify the drafts, resolve
//! them, then execute every batch (inserted, updated, merged) and copy
//! generated ids and new versions back into the drafts.

use crate::executor::{Executor, GeneratedIdSpec, Parameter};
use crate::lookup::{RowLookup, SqlRowLookup};
use crate::options::{SaveMode, SaveOptions, SavePath};
use crate::pre_handler::PreHandler;
use crate::template::{StatementKind, StatementTemplate};
use asupersync::{Cx, Outcome};
use sqlsave_core::{ConfigError, Connection, Draft, Error, Result, Value};
use std::sync::Arc;

/// What a save call wrote.
#[derive(Debug, Clone)]
pub struct SaveResult {
    /// The drafts in the order they were passed, with generated ids and
    /// bumped versions applied
    pub drafts: Vec<Draft>,
    /// Sum of the affected-row counts of every statement
    pub affected_rows: u64,
    /// Number of batch statements executed
    pub batches: usize,
}

/// Saves drafts through a borrowed connection.
#[derive(Debug)]
pub struct Saver<'a, C: Connection> {
    executor: Executor<'a, C>,
    options: &'a SaveOptions,
}

fn bumped(version: Value) -> Value {
    match version {
        Value::SmallInt(v) => Value::SmallInt(v.wrapping_add(1)),
        Value::Int(v) => Value::Int(v.wrapping_add(1)),
        Value::BigInt(v) => Value::BigInt(v.wrapping_add(1)),
        other => other,
    }
}

impl<'a, C: Connection> Saver<'a, C> {
    pub fn new(conn: &'a C, options: &'a SaveOptions) -> Self {
        Self {
            executor: Executor::new(conn).with_translator(options.exception_translator().cloned()),
            options,
        }
    }

    /// Save `drafts` reached through `path`, looking rows up with plain
    /// SELECTs on the same connection.
    pub async fn save(&self, cx: &Cx, path: SavePath, drafts: Vec<Draft>) -> Outcome<SaveResult, Error> {
        let lookup = SqlRowLookup::new(self.executor.connection());
        self.save_with(cx, path, drafts, &lookup).await
    }

    /// Save `drafts` using a caller-supplied row lookup.
    #[tracing::instrument(level = "debug", skip(self, cx, drafts, lookup), fields(path = %path, mode = %self.options.mode, drafts = drafts.len()))]
    pub async fn save_with(
        &self,
        cx: &Cx,
        path: SavePath,
        drafts: Vec<Draft>,
        lookup: &dyn RowLookup,
    ) -> Outcome<SaveResult, Error> {
        let mut handler = match PreHandler::new(path, self.options, lookup) {
            Ok(handler) => handler,
            Err(e) => return Outcome::Err(e),
        };
        for draft in drafts {
            if let Err(e) = handler.add(draft) {
                return Outcome::Err(e);
            }
        }
        let batches = match handler.batches(cx).await {
            Outcome::Ok(batches) => batches,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let ty = Arc::clone(handler.entity_type());
        let key_props = handler.key_props().to_vec();
        let dialect = self.executor.connection().dialect();
        let generator = self.options.id_generator(ty.name());
        let mut affected_rows = 0u64;
        let mut executed = 0usize;

        if !dialect.is_upsert_supported() {
            let merged = batches.iter().find(|batch| {
                matches!(
                    batch.mode(),
                    SaveMode::Upsert | SaveMode::InsertIfAbsent | SaveMode::NonIdempotentUpsert
                )
            });
            if let Some(batch) = merged {
                return Outcome::Err(Error::Config(ConfigError {
                    message: format!(
                        "save mode {} needs a native upsert for {} \"{}\" drafts, \
                         but dialect {:?} has none; save them with UPSERT so existing rows are looked up first",
                        batch.mode(),
                        batch.len(),
                        ty.name(),
                        dialect
                    ),
                }));
            }
        }

        for batch in &batches {
            let template = match StatementTemplate::for_batch(dialect, &ty, batch, &key_props) {
                Ok(Some(template)) => template,
                Ok(None) => {
                    tracing::debug!(drafts = batch.len(), "Nothing to update in batch, skipped");
                    continue;
                }
                Err(e) => return Outcome::Err(e),
            };
            let rows = match batch
                .drafts()
                .iter()
                .map(|id| template.bind(handler.draft(*id)))
                .collect::<Result<Vec<Vec<Parameter>>>>()
            {
                Ok(rows) => rows,
                Err(e) => return Outcome::Err(e),
            };
            let ids = if template.generates_id() && template.kind() != StatementKind::Update {
                GeneratedIdSpec::for_type(&ty, generator)
            } else {
                GeneratedIdSpec::none()
            };

            let result = match self
                .executor
                .run_batch(cx, template.sql(), ids, &rows, None)
                .await
            {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            executed += 1;
            affected_rows += result.update_counts.iter().sum::<u64>();

            for (id, generated) in batch.drafts().iter().zip(result.generated_ids) {
                if !generated.is_null() {
                    handler.draft_mut(*id).set_id(generated);
                }
            }
            if let Some(version) = template.version() {
                for (id, count) in batch.drafts().iter().zip(&result.update_counts) {
                    if *count == 0 {
                        tracing::debug!(draft = id.index(), "Versioned update matched no row");
                        continue;
                    }
                    let draft = handler.draft_mut(*id);
                    if let Some(current) = draft.column_value(version) {
                        draft.set_value(version, bumped(current));
                    }
                }
            }
        }

        tracing::info!(
            entity = %ty.name(),
            batches = executed,
            affected_rows = affected_rows,
            "Save complete"
        );
        Outcome::Ok(SaveResult {
            drafts: handler.into_drafts(),
            affected_rows,
            batches: executed,
        })
    }
}
