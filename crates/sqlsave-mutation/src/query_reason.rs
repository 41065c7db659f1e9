//! Deciding whether a save must look up existing rows first.

use crate::hooks::IdGenerator;
use crate::options::SaveMode;
use serde::{Deserialize, Serialize};
use sqlsave_core::{Dialect, Draft, EntityType, Error, Result, SaveErrorKind};
use std::fmt;

/// Why a pre-existence lookup is unavoidable.
///
/// `None` means the database can be trusted to choose between insert and
/// update by itself (native upsert), so no lookup is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryReason {
    None,
    Trigger,
    TargetNotTransferable,
    Interceptor,
    IdentityGeneratorRequired,
    UpsertNotSupported,
    OptimisticLock,
    KeyUniqueConstraintRequired,
    NoMoreUniqueConstraintsRequired,
    NullNotDistinctRequired,
}

impl QueryReason {
    pub const fn is_none(self) -> bool {
        matches!(self, QueryReason::None)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            QueryReason::None => "NONE",
            QueryReason::Trigger => "TRIGGER",
            QueryReason::TargetNotTransferable => "TARGET_NOT_TRANSFERABLE",
            QueryReason::Interceptor => "INTERCEPTOR",
            QueryReason::IdentityGeneratorRequired => "IDENTITY_GENERATOR_REQUIRED",
            QueryReason::UpsertNotSupported => "UPSERT_NOT_SUPPORTED",
            QueryReason::OptimisticLock => "OPTIMISTIC_LOCK",
            QueryReason::KeyUniqueConstraintRequired => "KEY_UNIQUE_CONSTRAINT_REQUIRED",
            QueryReason::NoMoreUniqueConstraintsRequired => "NO_MORE_UNIQUE_CONSTRAINTS_REQUIRED",
            QueryReason::NullNotDistinctRequired => "NULL_NOT_DISTINCT_REQUIRED",
        }
    }
}

impl fmt::Display for QueryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the decision depends on, gathered once per save path.
#[derive(Debug, Clone, Copy)]
pub struct ReasonContext<'a> {
    pub ty: &'a EntityType,
    /// Rendered save path, for error messages
    pub path: &'a str,
    pub mode: SaveMode,
    pub dialect: Dialect,
    pub trigger_enabled: bool,
    pub back_reference_frozen: bool,
    pub has_interceptor: bool,
    pub id_generator: Option<&'a IdGenerator>,
    pub user_optimistic_lock: bool,
    /// Effective business key of this save
    pub key_props: &'a [usize],
}

impl ReasonContext<'_> {
    /// Decide for one bucket of drafts; the first matching rule wins.
    ///
    /// `has_id` tells whether the bucket is the id bucket. A missing id
    /// generator for a key bucket that may insert is a fatal error, not a
    /// reason.
    #[allow(clippy::result_large_err)]
    pub fn decide<'d>(
        &self,
        has_id: bool,
        drafts: impl IntoIterator<Item = &'d Draft>,
    ) -> Result<QueryReason> {
        if self.trigger_enabled {
            return Ok(QueryReason::Trigger);
        }
        if self.back_reference_frozen {
            return Ok(QueryReason::TargetNotTransferable);
        }
        if self.has_interceptor {
            return Ok(QueryReason::Interceptor);
        }
        if !has_id && self.mode != SaveMode::UpdateOnly {
            match self.id_generator {
                None => {
                    return Err(Error::save(
                        SaveErrorKind::NoIdGenerator,
                        self.ty.name(),
                        self.path,
                        "objects without id can only be inserted when an id generator is configured",
                    ));
                }
                Some(generator) if !generator.is_identity() => {
                    return Ok(QueryReason::IdentityGeneratorRequired);
                }
                Some(_) => {}
            }
        }
        if self.mode != SaveMode::Upsert {
            return Ok(QueryReason::None);
        }
        if !self.dialect.is_upsert_supported() {
            return Ok(QueryReason::UpsertNotSupported);
        }
        if !self.dialect.is_upsert_with_optimistic_lock_supported()
            && (self.user_optimistic_lock || self.ty.version_prop().is_some())
        {
            return Ok(QueryReason::OptimisticLock);
        }
        if has_id {
            return Ok(QueryReason::None);
        }
        let Some(constraint) = self.ty.key_unique_constraint() else {
            return Ok(QueryReason::KeyUniqueConstraintRequired);
        };
        if !constraint.no_more_unique_constraints
            && !self.dialect.is_upsert_with_multiple_unique_constraint_supported()
        {
            return Ok(QueryReason::NoMoreUniqueConstraintsRequired);
        }
        if !constraint.null_not_distinct || !self.dialect.is_upsert_with_nullable_key_supported() {
            let nullable: Vec<usize> = self
                .key_props
                .iter()
                .copied()
                .filter(|ordinal| self.ty.prop(*ordinal).nullable)
                .collect();
            if !nullable.is_empty() {
                for draft in drafts {
                    let has_null = nullable
                        .iter()
                        .any(|ordinal| draft.get(*ordinal).is_none_or(|v| v.is_null()));
                    if has_null {
                        return Ok(QueryReason::NullNotDistinctRequired);
                    }
                }
            }
        }
        Ok(QueryReason::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlsave_core::{KeyUniqueConstraint, PropInfo, Value};
    use std::sync::Arc;

    fn book(versioned: bool, constraint: Option<KeyUniqueConstraint>) -> Arc<EntityType> {
        let mut builder = EntityType::builder("Book", "book")
            .id("id")
            .prop(PropInfo::scalar("name"))
            .prop(PropInfo::scalar("edition").nullable(true))
            .prop(PropInfo::scalar("version"))
            .key(&["name", "edition"]);
        if versioned {
            builder = builder.version("version");
        }
        if let Some(constraint) = constraint {
            builder = builder.key_unique_constraint(constraint);
        }
        builder.build().expect("valid type")
    }

    fn ctx<'a>(ty: &'a EntityType, generator: Option<&'a IdGenerator>) -> ReasonContext<'a> {
        ReasonContext {
            ty,
            path: "<root>",
            mode: SaveMode::Upsert,
            dialect: Dialect::Postgres,
            trigger_enabled: false,
            back_reference_frozen: false,
            has_interceptor: false,
            id_generator: generator,
            user_optimistic_lock: false,
            key_props: ty.key_props(),
        }
    }

    const STRICT: KeyUniqueConstraint = KeyUniqueConstraint {
        no_more_unique_constraints: true,
        null_not_distinct: true,
    };

    #[test]
    fn test_priority_order() {
        let ty = book(false, Some(STRICT));
        let identity = IdGenerator::Identity;
        let mut c = ctx(&ty, Some(&identity));
        c.trigger_enabled = true;
        c.back_reference_frozen = true;
        c.has_interceptor = true;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::Trigger);
        c.trigger_enabled = false;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::TargetNotTransferable);
        c.back_reference_frozen = false;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::Interceptor);
        c.has_interceptor = false;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::None);
    }

    #[test]
    fn test_missing_generator_is_fatal() {
        let ty = book(false, Some(STRICT));
        let c = ctx(&ty, None);
        let err = c.decide(false, []).unwrap_err();
        assert_eq!(err.save_kind(), Some(SaveErrorKind::NoIdGenerator));

        // The id bucket never needs a generator
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::None);

        // Neither does UPDATE_ONLY
        let mut c = c;
        c.mode = SaveMode::UpdateOnly;
        assert_eq!(c.decide(false, []).unwrap(), QueryReason::None);
    }

    #[test]
    fn test_non_identity_generator() {
        let ty = book(false, Some(STRICT));
        let sequence = IdGenerator::Sequence {
            name: "book_id_seq".into(),
        };
        let c = ctx(&ty, Some(&sequence));
        assert_eq!(
            c.decide(false, []).unwrap(),
            QueryReason::IdentityGeneratorRequired
        );
    }

    #[test]
    fn test_upsert_dialect_rules() {
        let identity = IdGenerator::Identity;

        let ty = book(false, Some(STRICT));
        let mut c = ctx(&ty, Some(&identity));
        c.dialect = Dialect::Generic;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::UpsertNotSupported);

        let ty = book(true, Some(STRICT));
        let mut c = ctx(&ty, Some(&identity));
        c.dialect = Dialect::Mysql;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::OptimisticLock);

        let ty = book(false, Some(STRICT));
        let mut c = ctx(&ty, Some(&identity));
        c.dialect = Dialect::Mysql;
        c.user_optimistic_lock = true;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::OptimisticLock);

        // Postgres combines upsert and optimistic lock
        let ty = book(true, Some(STRICT));
        let c = ctx(&ty, Some(&identity));
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::None);
    }

    #[test]
    fn test_key_bucket_constraint_rules() {
        let identity = IdGenerator::Identity;

        let ty = book(false, None);
        let c = ctx(&ty, Some(&identity));
        assert_eq!(
            c.decide(false, []).unwrap(),
            QueryReason::KeyUniqueConstraintRequired
        );

        let loose = KeyUniqueConstraint {
            no_more_unique_constraints: false,
            null_not_distinct: true,
        };
        let ty = book(false, Some(loose));
        let mut c = ctx(&ty, Some(&identity));
        c.dialect = Dialect::Mysql;
        assert_eq!(
            c.decide(false, []).unwrap(),
            QueryReason::NoMoreUniqueConstraintsRequired
        );
    }

    #[test]
    fn test_null_key_requires_lookup() {
        let identity = IdGenerator::Identity;
        let distinct = KeyUniqueConstraint {
            no_more_unique_constraints: true,
            null_not_distinct: false,
        };
        let ty = book(false, Some(distinct));
        let c = ctx(&ty, Some(&identity));

        let complete = Draft::new(Arc::clone(&ty))
            .with("name", "GraphQL in Action")
            .with("edition", 1);
        let null_edition = Draft::new(Arc::clone(&ty))
            .with("name", "Learning GraphQL")
            .with("edition", Value::Null);

        assert_eq!(c.decide(false, [&complete]).unwrap(), QueryReason::None);
        assert_eq!(
            c.decide(false, [&complete, &null_edition]).unwrap(),
            QueryReason::NullNotDistinctRequired
        );

        // NULLS NOT DISTINCT on Postgres is safe
        let ty = book(false, Some(STRICT));
        let c = ctx(&ty, Some(&identity));
        let null_edition = Draft::new(Arc::clone(&ty))
            .with("name", "Learning GraphQL")
            .with("edition", Value::Null);
        assert_eq!(c.decide(false, [&null_edition]).unwrap(), QueryReason::None);
    }

    #[test]
    fn test_non_upsert_modes_skip_dialect_rules() {
        let identity = IdGenerator::Identity;
        let ty = book(true, None);
        let mut c = ctx(&ty, Some(&identity));
        c.dialect = Dialect::Generic;
        c.mode = SaveMode::InsertIfAbsent;
        assert_eq!(c.decide(false, []).unwrap(), QueryReason::None);
        c.mode = SaveMode::NonIdempotentUpsert;
        assert_eq!(c.decide(true, []).unwrap(), QueryReason::None);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(QueryReason::NullNotDistinctRequired.to_string(), "NULL_NOT_DISTINCT_REQUIRED");
        let json = serde_json::to_string(&QueryReason::UpsertNotSupported).unwrap();
        assert_eq!(json, "\"UPSERT_NOT_SUPPORTED\"");
    }
}
