//! Save resolution.
//!
//! A [`PreHandler`] receives the drafts of one entity type reached through
//! one save path, classifies them by identity completeness, decides whether
//! existing rows must be looked up, and splits them into inserted, updated
//! and merged shape maps. Drafts are owned by the handler and addressed by
//! [`DraftId`].
//!
//! A handler serves exactly one save call. Lookup results are cached inside
//! it and die with it.

use crate::hooks::{DraftInterceptor, DraftPreProcessor, IdGenerator};
use crate::lookup::{FetchSpec, RowLookup};
use crate::options::{SaveMode, SaveOptions, SavePath};
use crate::query_reason::{QueryReason, ReasonContext};
use crate::shape::{Batch, DraftId, PropFilter, ShapedEntityMap};
use asupersync::{Cx, Outcome};
use sqlsave_core::{
    ConfigError, Draft, EntityType, Error, Key, Result, Row, SaveErrorKind, Value,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Resolution strategy selected by the save mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Insert,
    Update,
    Upsert { ignore_update: bool },
}

impl Variant {
    fn of(mode: SaveMode) -> Self {
        match mode {
            SaveMode::InsertOnly => Variant::Insert,
            SaveMode::UpdateOnly => Variant::Update,
            SaveMode::InsertIfAbsent => Variant::Upsert {
                ignore_update: true,
            },
            SaveMode::Upsert | SaveMode::NonIdempotentUpsert => Variant::Upsert {
                ignore_update: false,
            },
        }
    }

    /// Only a full insert fills declared default values.
    fn assigns_default_values(self) -> bool {
        matches!(self, Variant::Insert)
    }
}

/// The shape maps produced by resolution.
#[derive(Debug, Clone)]
pub struct ResolvedMaps {
    inserted: ShapedEntityMap,
    updated: ShapedEntityMap,
    merged: ShapedEntityMap,
}

impl ResolvedMaps {
    /// Drafts known to be new.
    pub fn inserted(&self) -> &ShapedEntityMap {
        &self.inserted
    }

    /// Drafts known to exist.
    pub fn updated(&self) -> &ShapedEntityMap {
        &self.updated
    }

    /// Drafts left to a native upsert.
    pub fn merged(&self) -> &ShapedEntityMap {
        &self.merged
    }

    /// Inserted, then updated, then merged batches.
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .chain(self.merged.iter())
    }
}

/// Resolves the drafts of one save path into executable batches.
pub struct PreHandler<'a> {
    path: SavePath,
    path_name: String,
    options: &'a SaveOptions,
    lookup: &'a dyn RowLookup,
    variant: Variant,
    key_props: Vec<usize>,
    pre_processor: Option<Arc<dyn DraftPreProcessor>>,
    interceptor: Option<Arc<dyn DraftInterceptor>>,
    id_generator: Option<IdGenerator>,
    accepts_wild: bool,

    drafts: Vec<Draft>,
    /// Ids of id-only references to check, when the path requires it
    validated_ids: Option<Vec<Value>>,
    validated_seen: HashSet<Key>,
    with_id: Vec<DraftId>,
    with_key: Vec<DraftId>,
    wild: Vec<DraftId>,

    id_row_map: Option<HashMap<Key, Row>>,
    key_row_map: Option<HashMap<Key, Row>>,
    fetch_spec: Option<FetchSpec>,
    association_map: Option<ShapedEntityMap>,
    resolved: Option<ResolvedMaps>,
}

impl<'a> PreHandler<'a> {
    /// Create a handler for `path`, reading hooks and policies from `options`.
    #[allow(clippy::result_large_err)]
    pub fn new(path: SavePath, options: &'a SaveOptions, lookup: &'a dyn RowLookup) -> Result<Self> {
        let ty = Arc::clone(path.entity_type());
        let key_props = options.key_props(&ty)?;
        let validated_ids = path
            .step()
            .filter(|step| options.is_auto_checking(step.declaring_type, step.prop))
            .map(|_| Vec::new());
        Ok(Self {
            path_name: path.to_string(),
            path,
            options,
            lookup,
            variant: Variant::of(options.mode),
            key_props,
            pre_processor: options.pre_processor(ty.name()).cloned(),
            interceptor: options.interceptor(ty.name()).cloned(),
            id_generator: options.id_generator(ty.name()).cloned(),
            accepts_wild: options.accepts_wild_objects(),
            drafts: Vec::new(),
            validated_ids,
            validated_seen: HashSet::new(),
            with_id: Vec::new(),
            with_key: Vec::new(),
            wild: Vec::new(),
            id_row_map: None,
            key_row_map: None,
            fetch_spec: None,
            association_map: None,
            resolved: None,
        })
    }

    pub fn path(&self) -> &SavePath {
        &self.path
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        self.path.entity_type()
    }

    /// Effective business key of this save.
    pub fn key_props(&self) -> &[usize] {
        &self.key_props
    }

    /// Classify one draft.
    ///
    /// Id-only drafts are references, not writes: they are kept (and their
    /// id queued for validation when the path requires it) but never
    /// batched.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, mut draft: Draft) -> Result<DraftId> {
        let ty = Arc::clone(self.path.entity_type());
        if draft.entity_type().name() != ty.name() {
            return Err(Error::Config(ConfigError {
                message: format!(
                    "cannot add a draft of \"{}\" to the save path of \"{}\"",
                    draft.entity_type().name(),
                    ty.name()
                ),
            }));
        }
        let id_prop = ty.id_prop();
        let has_non_id_values = draft.has_non_id_values();

        if draft.is_loaded(id_prop) && !has_non_id_values {
            if let (Some(ids), Some(id)) = (self.validated_ids.as_mut(), draft.id()) {
                if self.validated_seen.insert(Key::single(id.clone())) {
                    ids.push(id);
                }
            }
            return Ok(self.store(draft));
        }
        if self.path.is_remote() && has_non_id_values {
            return Err(self.error(
                SaveErrorKind::LongRemoteAssociation,
                "objects of a remote association can only be referenced by id".to_string(),
            ));
        }
        if let Some(processor) = &self.pre_processor {
            processor.before_save(&mut draft);
        }

        if draft.is_loaded(id_prop) {
            let id = self.store(draft);
            self.with_id.push(id);
            return Ok(id);
        }

        let loaded_keys = self
            .key_props
            .iter()
            .filter(|ordinal| draft.is_loaded(**ordinal))
            .count();
        if loaded_keys == 0 {
            if !self.accepts_wild {
                return Err(self.error(
                    SaveErrorKind::NeitherIdNorKey,
                    format!(
                        "neither the id property \"{}\" nor the key properties [{}] are specified",
                        ty.prop(id_prop).name,
                        self.key_names()
                    ),
                ));
            }
            let id = self.store(draft);
            self.wild.push(id);
            return Ok(id);
        }
        if let Some(unloaded) = self
            .key_props
            .iter()
            .copied()
            .find(|ordinal| !draft.is_loaded(*ordinal))
        {
            if !self.accepts_wild {
                return Err(self.error(
                    SaveErrorKind::NoKey,
                    format!(
                        "the key property \"{}\" is not specified, all of [{}] are required",
                        ty.prop(unloaded).name,
                        self.key_names()
                    ),
                ));
            }
            let id = self.store(draft);
            self.wild.push(id);
            return Ok(id);
        }
        let id = self.store(draft);
        self.with_key.push(id);
        Ok(id)
    }

    fn store(&mut self, draft: Draft) -> DraftId {
        let id = DraftId(self.drafts.len());
        self.drafts.push(draft);
        id
    }

    fn key_names(&self) -> String {
        let ty = self.path.entity_type();
        self.key_props
            .iter()
            .map(|ordinal| ty.prop(*ordinal).name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn error(&self, kind: SaveErrorKind, message: String) -> Error {
        Error::save(kind, self.path.entity_type().name(), &self.path_name, message)
    }

    /// Resolve all added drafts. Repeated calls return the same maps without
    /// further lookups.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(path = %self.path_name))]
    pub async fn resolve(&mut self, cx: &Cx) -> Outcome<&ResolvedMaps, Error> {
        let maps = match self.resolved.take() {
            Some(maps) => maps,
            None => {
                match self.validate_alone_ids(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let resolved = match self.variant {
                    Variant::Insert => match self.resolve_insert() {
                        Ok(maps) => Outcome::Ok(maps),
                        Err(e) => Outcome::Err(e),
                    },
                    Variant::Update => self.resolve_update(cx).await,
                    Variant::Upsert { ignore_update } => {
                        self.resolve_upsert(cx, ignore_update).await
                    }
                };
                let maps = match resolved {
                    Outcome::Ok(maps) => maps,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                tracing::debug!(
                    entity = %self.path.entity_type().name(),
                    inserted = maps.inserted.draft_count(),
                    updated = maps.updated.draft_count(),
                    merged = maps.merged.draft_count(),
                    "Resolved drafts"
                );
                maps
            }
        };
        Outcome::Ok(self.resolved.insert(maps))
    }

    pub async fn inserted_map(&mut self, cx: &Cx) -> Outcome<&ShapedEntityMap, Error> {
        self.resolve(cx).await.map(|maps| &maps.inserted)
    }

    pub async fn updated_map(&mut self, cx: &Cx) -> Outcome<&ShapedEntityMap, Error> {
        self.resolve(cx).await.map(|maps| &maps.updated)
    }

    pub async fn merged_map(&mut self, cx: &Cx) -> Outcome<&ShapedEntityMap, Error> {
        self.resolve(cx).await.map(|maps| &maps.merged)
    }

    /// All batches: inserted, then updated, then merged.
    pub async fn batches(&mut self, cx: &Cx) -> Outcome<Vec<Batch>, Error> {
        self.resolve(cx)
            .await
            .map(|maps| maps.batches().cloned().collect())
    }

    /// Resolved drafts regrouped by id plus associations stored outside the
    /// entity's table, for the association-table writes that follow.
    pub async fn association_batches(&mut self, cx: &Cx) -> Outcome<&ShapedEntityMap, Error> {
        let map = match self.association_map.take() {
            Some(map) => map,
            None => {
                let ids: Vec<DraftId> = match self.resolve(cx).await {
                    Outcome::Ok(maps) => maps
                        .batches()
                        .flat_map(|batch| batch.drafts().iter().copied())
                        .collect(),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let mut map = ShapedEntityMap::new(
                    SaveMode::Upsert,
                    PropFilter::IdAndAssociations,
                    self.key_props.clone(),
                );
                for id in ids {
                    map.add(id, &self.drafts[id.0]);
                }
                map
            }
        };
        Outcome::Ok(self.association_map.insert(map))
    }

    /// Ids queued for reference validation.
    pub fn validated_ids(&self) -> &[Value] {
        self.validated_ids.as_deref().unwrap_or(&[])
    }

    /// Rows found by id lookups (and by key lookups, indexed by their id).
    pub fn original_id_map(&self) -> Option<&HashMap<Key, Row>> {
        self.id_row_map.as_ref()
    }

    /// Rows found by key lookups.
    pub fn original_key_map(&self) -> Option<&HashMap<Key, Row>> {
        self.key_row_map.as_ref()
    }

    /// The draft behind an id handed out by [`PreHandler::add`].
    ///
    /// # Panics
    ///
    /// Panics if the id came from another handler.
    pub fn draft(&self, id: DraftId) -> &Draft {
        &self.drafts[id.0]
    }

    pub fn draft_mut(&mut self, id: DraftId) -> &mut Draft {
        &mut self.drafts[id.0]
    }

    /// Give the drafts back in the order they were added.
    pub fn into_drafts(self) -> Vec<Draft> {
        self.drafts
    }

    /// Properties fetched for each looked-up row: the id, the key, the
    /// interceptor's dependencies and a frozen back reference.
    #[allow(clippy::result_large_err)]
    pub fn original_fetch_spec(&mut self) -> Result<&FetchSpec> {
        let spec = match self.fetch_spec.take() {
            Some(spec) => spec,
            None => {
                let ty = self.path.entity_type();
                let mut spec = FetchSpec::id_only(ty);
                for ordinal in &self.key_props {
                    spec = spec.with(*ordinal);
                }
                if let Some(interceptor) = &self.interceptor {
                    for name in interceptor.dependencies() {
                        let ordinal = ty.ordinal_of(name).ok_or_else(|| {
                            Error::Config(ConfigError {
                                message: format!(
                                    "draft interceptor of \"{}\" depends on unknown property \"{}\"",
                                    ty.name(),
                                    name
                                ),
                            })
                        })?;
                        spec = spec.with(ordinal);
                    }
                }
                if let Some(step) = self.path.step() {
                    if let (true, Some(back_reference)) =
                        (step.back_reference_frozen, step.back_reference)
                    {
                        spec = spec.with(back_reference);
                    }
                }
                spec
            }
        };
        Ok(self.fetch_spec.insert(spec))
    }

    async fn validate_alone_ids(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let ids = match &self.validated_ids {
            Some(ids) if !ids.is_empty() => ids.clone(),
            _ => return Outcome::Ok(()),
        };
        let ty = Arc::clone(self.path.entity_type());
        let id_column = ty.prop(ty.id_prop()).column_name;

        let found: Vec<Value> = if self.path.is_remote() {
            let Some(exchange) = self.options.remote_exchange() else {
                return Outcome::Err(Error::Config(ConfigError {
                    message: format!(
                        "\"{}\" is remote but no remote exchange is configured",
                        self.path_name
                    ),
                }));
            };
            let Some(service) = ty.microservice() else {
                return Outcome::Err(Error::Config(ConfigError {
                    message: format!("remote type \"{}\" has no microservice name", ty.name()),
                }));
            };
            tracing::debug!(service = service, ids = ids.len(), "Validating remote references");
            let fetch = FetchSpec::id_only(&ty);
            match exchange.find_by_ids(cx, service, &ids, &fetch).await {
                Outcome::Ok(rows) => rows
                    .iter()
                    .filter_map(|row| row.get_by_name(id_column).cloned())
                    .collect(),
                Outcome::Err(e) => {
                    return Outcome::Err(self.error(
                        SaveErrorKind::FailedRemoteValidation,
                        format!(
                            "cannot validate the ids of \"{}\" in service \"{}\": {}",
                            ty.name(),
                            service,
                            e
                        ),
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            tracing::debug!(ids = ids.len(), "Validating references");
            match self.lookup.find_existing_ids(cx, &ty, &ids).await {
                Outcome::Ok(found) => found,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let found: HashSet<Key> = found.into_iter().map(Key::single).collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains(&Key::single((*id).clone())))
            .map(ToString::to_string)
            .collect();
        if missing.is_empty() {
            Outcome::Ok(())
        } else {
            Outcome::Err(self.error(
                SaveErrorKind::IllegalTargetId,
                format!("referenced ids [{}] do not exist", missing.join(", ")),
            ))
        }
    }

    #[allow(clippy::result_large_err)]
    fn reason(&self, has_id: bool, bucket: &[DraftId]) -> Result<QueryReason> {
        let ty = self.path.entity_type();
        let ctx = ReasonContext {
            ty,
            path: &self.path_name,
            mode: self.options.mode,
            dialect: self.options.dialect,
            trigger_enabled: self.options.trigger_enabled,
            back_reference_frozen: self.path.is_back_reference_frozen(),
            has_interceptor: self.interceptor.is_some(),
            id_generator: self.id_generator.as_ref(),
            user_optimistic_lock: self.options.is_user_optimistic_lock(ty.name()),
            key_props: &self.key_props,
        };
        let reason = ctx.decide(has_id, bucket.iter().map(|id| &self.drafts[id.0]))?;
        tracing::debug!(
            entity = %ty.name(),
            bucket = if has_id { "id" } else { "key" },
            drafts = bucket.len(),
            reason = %reason,
            "Computed query reason"
        );
        Ok(reason)
    }

    async fn find_by_ids(&mut self, cx: &Cx, reason: QueryReason) -> Outcome<(), Error> {
        if self.id_row_map.is_some() {
            return Outcome::Ok(());
        }
        let fetch = match self.original_fetch_spec() {
            Ok(spec) => spec.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let ty = Arc::clone(self.path.entity_type());
        let ids: Vec<Value> = self
            .with_id
            .iter()
            .filter_map(|id| self.drafts[id.0].id())
            .collect();
        tracing::debug!(reason = %reason, ids = ids.len(), "Looking up existing rows by id");
        let rows = match self.lookup.find_by_ids(cx, &ty, &ids, &fetch).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let id_column = ty.prop(ty.id_prop()).column_name;
        let map = rows
            .into_iter()
            .filter_map(|row| {
                row.get_by_name(id_column)
                    .cloned()
                    .map(|id| (Key::single(id), row))
            })
            .collect();
        self.id_row_map = Some(map);
        Outcome::Ok(())
    }

    async fn find_by_keys(&mut self, cx: &Cx, reason: QueryReason) -> Outcome<(), Error> {
        if self.key_row_map.is_some() {
            return Outcome::Ok(());
        }
        let fetch = match self.original_fetch_spec() {
            Ok(spec) => spec.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let ty = Arc::clone(self.path.entity_type());
        let mut seen = HashSet::new();
        let keys: Vec<Key> = self
            .with_key
            .iter()
            .filter_map(|id| self.drafts[id.0].key_of(&self.key_props))
            .filter(|key| seen.insert(key.clone()))
            .collect();
        tracing::debug!(reason = %reason, keys = keys.len(), "Looking up existing rows by key");
        let rows = match self
            .lookup
            .find_by_keys(cx, &ty, &self.key_props, &keys, &fetch)
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let key_columns: Vec<&str> = self
            .key_props
            .iter()
            .map(|ordinal| ty.prop(*ordinal).column_name)
            .collect();
        let key_map: HashMap<Key, Row> = rows
            .into_iter()
            .map(|row| (row.key_of(&key_columns), row))
            .collect();

        if !key_map.is_empty() {
            let id_column = ty.prop(ty.id_prop()).column_name;
            let id_map = self.id_row_map.get_or_insert_with(HashMap::new);
            for row in key_map.values() {
                if let Some(id) = row.get_by_name(id_column) {
                    id_map.insert(Key::single(id.clone()), row.clone());
                }
            }
        }
        self.key_row_map = Some(key_map);
        Outcome::Ok(())
    }

    fn original_by_id(&self, id: DraftId) -> Option<Row> {
        let value = self.drafts[id.0].id()?;
        self.id_row_map.as_ref()?.get(&Key::single(value)).cloned()
    }

    fn original_by_key(&self, id: DraftId) -> Option<Row> {
        let key = self.drafts[id.0].key_of(&self.key_props)?;
        self.key_row_map.as_ref()?.get(&key).cloned()
    }

    /// Take over the id of the row matched by key.
    fn adopt_id(&mut self, id: DraftId, original: &Row) {
        let ty = Arc::clone(self.path.entity_type());
        if let Some(value) = original.get_by_name(ty.prop(ty.id_prop()).column_name) {
            self.drafts[id.0].set_id(value.clone());
        }
    }

    fn new_map(&self, mode: SaveMode) -> ShapedEntityMap {
        ShapedEntityMap::new(mode, PropFilter::Columns, self.key_props.clone())
    }

    /// Identity defaults for new drafts, then the interceptor under an
    /// id/key freeze.
    #[allow(clippy::result_large_err)]
    fn call_interceptor(&mut self, id: DraftId, original: Option<&Row>) -> Result<()> {
        let ty = Arc::clone(self.path.entity_type());
        let draft = &mut self.drafts[id.0];

        if original.is_none() && self.variant != Variant::Update {
            if !draft.is_loaded(ty.id_prop()) {
                if let Some(value) = self.id_generator.as_ref().and_then(|g| g.allocate(&ty)) {
                    draft.set_id(value);
                }
            }
            if let Some(version) = ty.version_prop() {
                if !draft.is_loaded(version) {
                    draft.set_value(version, Value::Int(0));
                }
            }
            if let Some(info) = ty.logical_deleted() {
                draft.set_value(info.prop, info.allocate_initialized_value());
            }
            if self.variant.assigns_default_values() {
                for (ordinal, prop) in ty.props().iter().enumerate() {
                    if draft.is_loaded(ordinal) {
                        continue;
                    }
                    if let Some(default) = &prop.default {
                        draft.set_value(ordinal, default.evaluate());
                    }
                }
            }
        }

        let Some(interceptor) = &self.interceptor else {
            return Ok(());
        };
        let frozen: Vec<(usize, Value)> = std::iter::once(ty.id_prop())
            .chain(self.key_props.iter().copied())
            .filter_map(|ordinal| draft.column_value(ordinal).map(|value| (ordinal, value)))
            .collect();
        interceptor.before_save(draft, original);
        for (ordinal, before) in frozen {
            if draft.column_value(ordinal).as_ref() != Some(&before) {
                return Err(Error::save(
                    SaveErrorKind::IllegalInterceptorBehavior,
                    ty.name(),
                    &self.path_name,
                    format!(
                        "the draft interceptor cannot change the id or key property \"{}\"",
                        ty.prop(ordinal).name
                    ),
                ));
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn resolve_insert(&mut self) -> Result<ResolvedMaps> {
        let ty = Arc::clone(self.path.entity_type());
        if let Some(generator @ IdGenerator::User(_)) = &self.id_generator {
            for id in &self.with_key {
                let draft = &mut self.drafts[id.0];
                // A failed earlier resolve may already have assigned one
                if draft.is_loaded(ty.id_prop()) {
                    continue;
                }
                if let Some(value) = generator.allocate(&ty) {
                    draft.set_id(value);
                }
            }
        }
        let order: Vec<DraftId> = self
            .wild
            .iter()
            .chain(&self.with_id)
            .chain(&self.with_key)
            .copied()
            .collect();
        for id in &order {
            self.call_interceptor(*id, None)?;
        }
        let mut inserted = self.new_map(SaveMode::InsertOnly);
        for id in order {
            inserted.add(id, &self.drafts[id.0]);
        }
        Ok(ResolvedMaps {
            inserted,
            updated: ShapedEntityMap::empty(SaveMode::UpdateOnly),
            merged: ShapedEntityMap::empty(SaveMode::Upsert),
        })
    }

    async fn resolve_update(&mut self, cx: &Cx) -> Outcome<ResolvedMaps, Error> {
        let mut kept_by_id = Vec::new();
        let mut kept_by_key = Vec::new();
        let mut dropped = 0usize;

        if !self.with_id.is_empty() {
            let reason = match self.reason(true, &self.with_id) {
                Ok(reason) => reason,
                Err(e) => return Outcome::Err(e),
            };
            if reason.is_none() {
                kept_by_id.clone_from(&self.with_id);
            } else {
                match self.find_by_ids(cx, reason).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                for id in self.with_id.clone() {
                    match self.original_by_id(id) {
                        Some(original) => {
                            if let Err(e) = self.call_interceptor(id, Some(&original)) {
                                return Outcome::Err(e);
                            }
                            kept_by_id.push(id);
                        }
                        None => dropped += 1,
                    }
                }
            }
        }

        if !self.with_key.is_empty() {
            let reason = match self.reason(false, &self.with_key) {
                Ok(reason) => reason,
                Err(e) => return Outcome::Err(e),
            };
            if reason.is_none() {
                kept_by_key.clone_from(&self.with_key);
            } else {
                match self.find_by_keys(cx, reason).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                for id in self.with_key.clone() {
                    match self.original_by_key(id) {
                        Some(original) => {
                            self.adopt_id(id, &original);
                            if let Err(e) = self.call_interceptor(id, Some(&original)) {
                                return Outcome::Err(e);
                            }
                            kept_by_key.push(id);
                        }
                        None => dropped += 1,
                    }
                }
            }
        }

        if dropped > 0 {
            tracing::debug!(dropped = dropped, "Skipped drafts without an existing row");
        }
        let mut updated = self.new_map(SaveMode::UpdateOnly);
        for id in kept_by_id.into_iter().chain(kept_by_key) {
            updated.add(id, &self.drafts[id.0]);
        }
        Outcome::Ok(ResolvedMaps {
            inserted: ShapedEntityMap::empty(SaveMode::InsertOnly),
            updated,
            merged: ShapedEntityMap::empty(SaveMode::Upsert),
        })
    }

    async fn resolve_upsert(&mut self, cx: &Cx, ignore_update: bool) -> Outcome<ResolvedMaps, Error> {
        let mut inserted_list = Vec::new();
        let mut updated_list = Vec::new();
        let mut updated_by_key = Vec::new();
        let mut merged_list = Vec::new();

        for id in self.wild.clone() {
            if let Err(e) = self.call_interceptor(id, None) {
                return Outcome::Err(e);
            }
        }

        if !self.with_id.is_empty() {
            let reason = match self.reason(true, &self.with_id) {
                Ok(reason) => reason,
                Err(e) => return Outcome::Err(e),
            };
            if reason.is_none() {
                merged_list.extend_from_slice(&self.with_id);
            } else {
                match self.find_by_ids(cx, reason).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                for id in self.with_id.clone() {
                    let original = self.original_by_id(id);
                    if original.is_some() {
                        updated_list.push(id);
                    } else {
                        inserted_list.push(id);
                    }
                    if let Err(e) = self.call_interceptor(id, original.as_ref()) {
                        return Outcome::Err(e);
                    }
                }
            }
        }

        if !self.with_key.is_empty() {
            let reason = match self.reason(false, &self.with_key) {
                Ok(reason) => reason,
                Err(e) => return Outcome::Err(e),
            };
            if reason.is_none() {
                merged_list.extend_from_slice(&self.with_key);
            } else {
                match self.find_by_keys(cx, reason).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                for id in self.with_key.clone() {
                    let original = self.original_by_key(id);
                    match &original {
                        Some(row) => {
                            self.adopt_id(id, row);
                            updated_by_key.push(id);
                        }
                        None => inserted_list.push(id),
                    }
                    if let Err(e) = self.call_interceptor(id, original.as_ref()) {
                        return Outcome::Err(e);
                    }
                }
            }
        }

        let mut inserted = self.new_map(SaveMode::InsertOnly);
        for id in inserted_list.into_iter().chain(self.wild.iter().copied()) {
            inserted.add(id, &self.drafts[id.0]);
        }

        let mut updated = self.new_map(SaveMode::UpdateOnly);
        if ignore_update {
            let untouched = updated_list.len() + updated_by_key.len();
            if untouched > 0 {
                tracing::debug!(untouched = untouched, "Existing rows left as they are");
            }
        } else {
            for id in updated_list {
                updated.add(id, &self.drafts[id.0]);
            }
            for id in updated_by_key {
                updated.add_without_key(id, &self.drafts[id.0]);
            }
        }

        let merge_mode = if ignore_update {
            SaveMode::InsertIfAbsent
        } else {
            SaveMode::Upsert
        };
        let mut merged = self.new_map(merge_mode);
        for id in merged_list {
            merged.add(id, &self.drafts[id.0]);
        }

        Outcome::Ok(ResolvedMaps {
            inserted,
            updated,
            merged,
        })
    }
}

impl fmt::Debug for PreHandler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreHandler")
            .field("path", &self.path_name)
            .field("variant", &self.variant)
            .field("key_props", &self.key_props)
            .field("drafts", &self.drafts.len())
            .field("with_id", &self.with_id)
            .field("with_key", &self.with_key)
            .field("wild", &self.wild)
            .field("validated_ids", &self.validated_ids)
            .field("resolved", &self.resolved.is_some())
            .finish_non_exhaustive()
    }
}
