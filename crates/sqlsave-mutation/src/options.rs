//! Save options and the entity path a save runs on.

use crate::hooks::{DraftInterceptor, DraftPreProcessor, ExceptionTranslator, IdGenerator, RemoteExchange};
use serde::{Deserialize, Serialize};
use sqlsave_core::{ConfigError, Dialect, EntityType, Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What a save call is allowed to do with each draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveMode {
    /// Every draft becomes an INSERT
    InsertOnly,
    /// Drafts without an existing row are dropped
    UpdateOnly,
    /// Insert new rows, update existing ones
    #[default]
    Upsert,
    /// Insert new rows, leave existing ones untouched
    InsertIfAbsent,
    /// Like `Upsert`, but drafts without id or key are inserted
    NonIdempotentUpsert,
}

impl SaveMode {
    /// Does this mode accept drafts with neither id nor full key unless
    /// configured otherwise?
    pub const fn accepts_wild_objects(self) -> bool {
        matches!(
            self,
            SaveMode::InsertOnly | SaveMode::InsertIfAbsent | SaveMode::NonIdempotentUpsert
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SaveMode::InsertOnly => "INSERT_ONLY",
            SaveMode::UpdateOnly => "UPDATE_ONLY",
            SaveMode::Upsert => "UPSERT",
            SaveMode::InsertIfAbsent => "INSERT_IF_ABSENT",
            SaveMode::NonIdempotentUpsert => "NON_IDEMPOTENT_UPSERT",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy for drafts that carry neither an id nor a complete business key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WildObjects {
    /// Follow [`SaveMode::accepts_wild_objects`]
    #[default]
    ModeDefault,
    /// Accept them in every mode except `UpdateOnly`
    Allow,
    /// Reject them with `NeitherIdNorKey` / `NoKey`
    Deny,
}

/// Configuration of one save call.
///
/// Per-type settings are keyed by entity type name.
#[derive(Clone, Default)]
pub struct SaveOptions {
    pub mode: SaveMode,
    pub dialect: Dialect,
    /// Row-change triggers are enabled; every change needs the old row
    pub trigger_enabled: bool,
    pub wild_objects: WildObjects,
    key_overrides: HashMap<&'static str, Vec<&'static str>>,
    user_optimistic_lock: HashSet<&'static str>,
    auto_checking: HashSet<(&'static str, &'static str)>,
    id_generators: HashMap<&'static str, IdGenerator>,
    pre_processors: HashMap<&'static str, Arc<dyn DraftPreProcessor>>,
    interceptors: HashMap<&'static str, Arc<dyn DraftInterceptor>>,
    exception_translator: Option<Arc<dyn ExceptionTranslator>>,
    remote_exchange: Option<Arc<dyn RemoteExchange>>,
}

impl SaveOptions {
    /// Create options for the given mode with defaults for everything else.
    pub fn new(mode: SaveMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn trigger_enabled(mut self, enabled: bool) -> Self {
        self.trigger_enabled = enabled;
        self
    }

    pub fn wild_objects(mut self, policy: WildObjects) -> Self {
        self.wild_objects = policy;
        self
    }

    /// Use `props` instead of the declared business key of `type_name`.
    pub fn with_key_props(mut self, type_name: &'static str, props: &[&'static str]) -> Self {
        self.key_overrides.insert(type_name, props.to_vec());
        self
    }

    /// Treat `type_name` as optimistically locked by the caller.
    pub fn with_user_optimistic_lock(mut self, type_name: &'static str) -> Self {
        self.user_optimistic_lock.insert(type_name);
        self
    }

    /// Validate that ids referenced through `declaring_type.prop` exist.
    pub fn with_auto_checking(mut self, declaring_type: &'static str, prop: &'static str) -> Self {
        self.auto_checking.insert((declaring_type, prop));
        self
    }

    pub fn with_id_generator(mut self, type_name: &'static str, generator: IdGenerator) -> Self {
        self.id_generators.insert(type_name, generator);
        self
    }

    pub fn with_pre_processor(
        mut self,
        type_name: &'static str,
        processor: Arc<dyn DraftPreProcessor>,
    ) -> Self {
        self.pre_processors.insert(type_name, processor);
        self
    }

    pub fn with_interceptor(
        mut self,
        type_name: &'static str,
        interceptor: Arc<dyn DraftInterceptor>,
    ) -> Self {
        self.interceptors.insert(type_name, interceptor);
        self
    }

    /// Client-wide translator, used when a statement has none of its own.
    pub fn with_exception_translator(mut self, translator: Arc<dyn ExceptionTranslator>) -> Self {
        self.exception_translator = Some(translator);
        self
    }

    pub fn with_remote_exchange(mut self, exchange: Arc<dyn RemoteExchange>) -> Self {
        self.remote_exchange = Some(exchange);
        self
    }

    /// Is a draft without id or full key acceptable in this save?
    pub fn accepts_wild_objects(&self) -> bool {
        match self.wild_objects {
            WildObjects::ModeDefault => self.mode.accepts_wild_objects(),
            WildObjects::Allow => self.mode != SaveMode::UpdateOnly,
            WildObjects::Deny => false,
        }
    }

    /// Business-key ordinals of `ty` for this save, override first.
    #[allow(clippy::result_large_err)]
    pub fn key_props(&self, ty: &EntityType) -> Result<Vec<usize>> {
        let Some(names) = self.key_overrides.get(ty.name()) else {
            return Ok(ty.key_props().to_vec());
        };
        names
            .iter()
            .map(|name| {
                ty.ordinal_of(name).ok_or_else(|| {
                    Error::Config(ConfigError {
                        message: format!(
                            "key override of \"{}\" names unknown property \"{}\"",
                            ty.name(),
                            name
                        ),
                    })
                })
            })
            .collect()
    }

    pub fn is_user_optimistic_lock(&self, type_name: &str) -> bool {
        self.user_optimistic_lock.contains(type_name)
    }

    pub fn is_auto_checking(&self, declaring_type: &str, prop: &str) -> bool {
        self.auto_checking
            .iter()
            .any(|(ty, p)| *ty == declaring_type && *p == prop)
    }

    pub fn id_generator(&self, type_name: &str) -> Option<&IdGenerator> {
        self.id_generators.get(type_name)
    }

    pub fn pre_processor(&self, type_name: &str) -> Option<&Arc<dyn DraftPreProcessor>> {
        self.pre_processors.get(type_name)
    }

    pub fn interceptor(&self, type_name: &str) -> Option<&Arc<dyn DraftInterceptor>> {
        self.interceptors.get(type_name)
    }

    pub fn exception_translator(&self) -> Option<&Arc<dyn ExceptionTranslator>> {
        self.exception_translator.as_ref()
    }

    pub fn remote_exchange(&self) -> Option<&Arc<dyn RemoteExchange>> {
        self.remote_exchange.as_ref()
    }
}

impl fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOptions")
            .field("mode", &self.mode)
            .field("dialect", &self.dialect)
            .field("trigger_enabled", &self.trigger_enabled)
            .field("wild_objects", &self.wild_objects)
            .field("key_overrides", &self.key_overrides)
            .field("user_optimistic_lock", &self.user_optimistic_lock)
            .field("auto_checking", &self.auto_checking)
            .field("id_generators", &self.id_generators)
            .field("pre_processors", &self.pre_processors.len())
            .field("interceptors", &self.interceptors.len())
            .field("exception_translator", &self.exception_translator.is_some())
            .field("remote_exchange", &self.remote_exchange.is_some())
            .finish()
    }
}

/// The association a child entity is saved through.
#[derive(Debug, Clone)]
pub struct PathStep {
    /// Entity type declaring the association
    pub declaring_type: &'static str,
    /// Association property on the declaring type
    pub prop: &'static str,
    /// The association points into another service
    pub remote: bool,
    /// Ordinal of the child's reference back to its parent, if any
    pub back_reference: Option<usize>,
    /// Children must already belong to the parent they are saved under
    pub back_reference_frozen: bool,
}

impl PathStep {
    pub fn new(declaring_type: &'static str, prop: &'static str) -> Self {
        Self {
            declaring_type,
            prop,
            remote: false,
            back_reference: None,
            back_reference_frozen: false,
        }
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Declare the child's back reference; `frozen` forbids moving children
    /// between parents.
    pub fn back_reference(mut self, ordinal: usize, frozen: bool) -> Self {
        self.back_reference = Some(ordinal);
        self.back_reference_frozen = frozen;
        self
    }
}

/// Entity type being saved plus the association step that led to it.
#[derive(Debug, Clone)]
pub struct SavePath {
    ty: Arc<EntityType>,
    step: Option<PathStep>,
}

impl SavePath {
    /// Path of the root objects handed to a save call.
    pub fn root(ty: Arc<EntityType>) -> Self {
        Self { ty, step: None }
    }

    /// Path of children reached through `step`.
    pub fn child(ty: Arc<EntityType>, step: PathStep) -> Self {
        Self {
            ty,
            step: Some(step),
        }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.ty
    }

    pub fn step(&self) -> Option<&PathStep> {
        self.step.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.step.as_ref().is_some_and(|s| s.remote)
    }

    pub fn is_back_reference_frozen(&self) -> bool {
        self.step.as_ref().is_some_and(|s| s.back_reference_frozen)
    }
}

impl fmt::Display for SavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}.{}", step.declaring_type, step.prop),
            None => f.write_str("<root>"),
        }
    }
}
