//! Collaborators a save call consults: id generators, draft hooks, remote
//! services and exception translators.

use crate::lookup::FetchSpec;
use asupersync::{Cx, Outcome};
use sqlsave_core::{Draft, EntityType, Error, GeneratedKeys, Row, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Application-supplied id source (UUIDs, snowflakes, ...).
pub trait UserIdGenerator: Send + Sync {
    fn generate(&self, ty: &EntityType) -> Value;
}

/// How ids of new rows are produced.
#[derive(Clone)]
pub enum IdGenerator {
    /// The database fills an identity / auto-increment column
    Identity,
    /// The database draws the id from a named sequence
    Sequence { name: String },
    /// The application allocates ids before the INSERT
    User(Arc<dyn UserIdGenerator>),
}

impl IdGenerator {
    /// Allocate an id on the client side.
    ///
    /// Returns `None` when the database generates the id.
    pub fn allocate(&self, ty: &EntityType) -> Option<Value> {
        match self {
            IdGenerator::Identity | IdGenerator::Sequence { .. } => None,
            IdGenerator::User(generator) => Some(generator.generate(ty)),
        }
    }

    pub const fn is_identity(&self) -> bool {
        matches!(self, IdGenerator::Identity)
    }

    pub const fn is_user(&self) -> bool {
        matches!(self, IdGenerator::User(_))
    }

    /// How an INSERT of `ty` reads its generated id back.
    pub fn generated_keys(&self, ty: &EntityType) -> GeneratedKeys {
        match self {
            IdGenerator::Identity => GeneratedKeys::Auto,
            IdGenerator::Sequence { .. } => {
                GeneratedKeys::Column(ty.prop(ty.id_prop()).column_name.to_string())
            }
            IdGenerator::User(_) => GeneratedKeys::None,
        }
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdGenerator::Identity => f.write_str("Identity"),
            IdGenerator::Sequence { name } => f.debug_struct("Sequence").field("name", name).finish(),
            IdGenerator::User(_) => f.write_str("User"),
        }
    }
}

/// Transforms every draft of a type before it is classified.
pub trait DraftPreProcessor: Send + Sync {
    fn before_save(&self, draft: &mut Draft);
}

/// Enriches drafts right before they are written.
///
/// The interceptor sees the existing row when one was looked up. It may set
/// any property except the id and the business key.
pub trait DraftInterceptor: Send + Sync {
    fn before_save(&self, draft: &mut Draft, original: Option<&Row>);

    /// Properties the interceptor reads from `original`; they are added to
    /// the lookup.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Access to entities owned by other services.
pub trait RemoteExchange: Send + Sync {
    /// Fetch the rows of `ids` from `service`.
    fn find_by_ids<'a>(
        &'a self,
        cx: &'a Cx,
        service: &'a str,
        ids: &'a [Value],
        fetch: &'a FetchSpec,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;
}

/// Statement being executed when a driver failure is translated.
#[derive(Debug, Clone, Copy)]
pub struct TranslateContext<'a> {
    pub sql: &'a str,
    /// Bound values per row: every staged row of a batch, or the single
    /// row of a plain statement
    pub rows: &'a [Vec<Value>],
}

/// Maps driver failures to application errors.
pub trait ExceptionTranslator: Send + Sync {
    /// Return `Some` to replace the error, `None` to keep it.
    fn translate(&self, error: &Error, ctx: &TranslateContext<'_>) -> Option<Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter(AtomicI64);

    impl UserIdGenerator for Counter {
        fn generate(&self, _ty: &EntityType) -> Value {
            Value::BigInt(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn book() -> Arc<EntityType> {
        EntityType::builder("Book", "book")
            .id("id")
            .build()
            .expect("valid type")
    }

    #[test]
    fn test_allocate() {
        let ty = book();
        assert_eq!(IdGenerator::Identity.allocate(&ty), None);
        assert_eq!(
            IdGenerator::Sequence {
                name: "book_id_seq".into()
            }
            .allocate(&ty),
            None
        );
        let user = IdGenerator::User(Arc::new(Counter(AtomicI64::new(100))));
        assert_eq!(user.allocate(&ty), Some(Value::BigInt(100)));
        assert_eq!(user.allocate(&ty), Some(Value::BigInt(101)));
    }

    #[test]
    fn test_generated_keys() {
        let ty = book();
        assert_eq!(IdGenerator::Identity.generated_keys(&ty), GeneratedKeys::Auto);
        assert_eq!(
            IdGenerator::Sequence {
                name: "book_id_seq".into()
            }
            .generated_keys(&ty),
            GeneratedKeys::Column("id".into())
        );
        let user = IdGenerator::User(Arc::new(Counter(AtomicI64::new(0))));
        assert_eq!(user.generated_keys(&ty), GeneratedKeys::None);
        assert!(user.is_user());
        assert!(!user.is_identity());
    }
}
