//! Entity and property metadata.
//!
//! In a full application these descriptors are produced by code generation;
//! the save engine only reads them. Every property has a stable ordinal (its
//! index in [`EntityType::props`]) that drafts, shapes and lookups use instead
//! of names.

use crate::Result;
use crate::error::{ConfigError, Error};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a property maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    /// A plain column
    Scalar,
    /// Many-to-one reference stored as a foreign key column on this table
    Reference { target: &'static str },
    /// Collection of references stored outside this table (middle table or
    /// the children's foreign keys)
    ReferenceList { target: &'static str },
}

/// Default value assigned to unloaded properties of inserted drafts.
#[derive(Debug, Clone)]
pub enum DefaultValue {
    Constant(Value),
    Generated(fn() -> Value),
}

impl DefaultValue {
    pub fn evaluate(&self) -> Value {
        match self {
            DefaultValue::Constant(v) => v.clone(),
            DefaultValue::Generated(f) => f(),
        }
    }
}

/// Converts between a property's domain value and what the driver stores.
pub trait ValueConverter: Send + Sync {
    /// Domain value to SQL value.
    #[allow(clippy::result_large_err)]
    fn to_sql(&self, value: Value) -> Result<Value>;

    /// SQL value (as read back from the driver) to domain value.
    #[allow(clippy::result_large_err)]
    fn from_sql(&self, value: Value) -> Result<Value>;
}

/// Metadata about one entity property.
#[derive(Clone)]
pub struct PropInfo {
    /// Property name
    pub name: &'static str,
    /// Column name; for references this is the foreign key column
    pub column_name: &'static str,
    pub kind: PropKind,
    pub nullable: bool,
    /// Association whose target lives in another service
    pub remote: bool,
    pub default: Option<DefaultValue>,
    pub converter: Option<Arc<dyn ValueConverter>>,
}

impl PropInfo {
    /// A non-null scalar column named like the property.
    pub const fn scalar(name: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            kind: PropKind::Scalar,
            nullable: false,
            remote: false,
            default: None,
            converter: None,
        }
    }

    /// A many-to-one reference with a foreign key column.
    pub const fn reference(
        name: &'static str,
        column_name: &'static str,
        target: &'static str,
    ) -> Self {
        Self {
            name,
            column_name,
            kind: PropKind::Reference { target },
            nullable: true,
            remote: false,
            default: None,
            converter: None,
        }
    }

    /// A collection association without a column on this table.
    pub const fn reference_list(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            kind: PropKind::ReferenceList { target },
            nullable: false,
            remote: false,
            default: None,
            converter: None,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    pub const fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub const fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Constant(value.into()));
        self
    }

    pub fn default_with(mut self, f: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Generated(f));
        self
    }

    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Is this property backed by a column of the entity's own table?
    pub const fn is_column_definition(&self) -> bool {
        matches!(self.kind, PropKind::Scalar | PropKind::Reference { .. })
    }

    /// Is this an association to another entity (either direction)?
    pub const fn is_association(&self) -> bool {
        !matches!(self.kind, PropKind::Scalar)
    }

    /// Is this a single-valued reference whose column holds the target id?
    pub const fn is_reference(&self) -> bool {
        matches!(self.kind, PropKind::Reference { .. })
    }
}

impl fmt::Debug for PropInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropInfo")
            .field("name", &self.name)
            .field("column_name", &self.column_name)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .field("remote", &self.remote)
            .field("default", &self.default)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

/// Logical ("soft") delete column and the value meaning "not deleted".
#[derive(Debug, Clone)]
pub struct LogicalDeletedInfo {
    pub prop: usize,
    pub initialized: Value,
}

impl LogicalDeletedInfo {
    pub fn allocate_initialized_value(&self) -> Value {
        self.initialized.clone()
    }
}

/// Declares that the business key is backed by a database unique
/// constraint, which is what makes a native upsert by key safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyUniqueConstraint {
    /// The key constraint is the only unique constraint besides the id
    pub no_more_unique_constraints: bool,
    /// The constraint is declared `NULLS NOT DISTINCT`
    pub null_not_distinct: bool,
}

/// Metadata about an entity type.
#[derive(Debug)]
pub struct EntityType {
    name: &'static str,
    table: &'static str,
    props: Vec<PropInfo>,
    prop_index: HashMap<&'static str, usize>,
    id: usize,
    key: Vec<usize>,
    version: Option<usize>,
    logical_deleted: Option<LogicalDeletedInfo>,
    key_unique_constraint: Option<KeyUniqueConstraint>,
    microservice: Option<&'static str>,
}

impl EntityType {
    /// Start describing an entity type.
    pub fn builder(name: &'static str, table: &'static str) -> EntityTypeBuilder {
        EntityTypeBuilder {
            name,
            table,
            props: Vec::new(),
            id: None,
            key: Vec::new(),
            version: None,
            logical_deleted: None,
            key_unique_constraint: None,
            microservice: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// All properties in ordinal order.
    pub fn props(&self) -> &[PropInfo] {
        &self.props
    }

    /// Property by ordinal.
    ///
    /// # Panics
    ///
    /// Panics if the ordinal does not belong to this type.
    pub fn prop(&self, ordinal: usize) -> &PropInfo {
        &self.props[ordinal]
    }

    /// Ordinal of a property by name.
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.prop_index.get(name).copied()
    }

    pub fn id_prop(&self) -> usize {
        self.id
    }

    /// Declared business-key ordinals, in declaration order.
    pub fn key_props(&self) -> &[usize] {
        &self.key
    }

    pub fn version_prop(&self) -> Option<usize> {
        self.version
    }

    pub fn logical_deleted(&self) -> Option<&LogicalDeletedInfo> {
        self.logical_deleted.as_ref()
    }

    pub fn key_unique_constraint(&self) -> Option<KeyUniqueConstraint> {
        self.key_unique_constraint
    }

    /// Name of the service owning this type, if it is remote.
    pub fn microservice(&self) -> Option<&'static str> {
        self.microservice
    }
}

/// Builder for [`EntityType`]; names are resolved to ordinals in `build`.
#[derive(Debug)]
pub struct EntityTypeBuilder {
    name: &'static str,
    table: &'static str,
    props: Vec<PropInfo>,
    id: Option<&'static str>,
    key: Vec<&'static str>,
    version: Option<&'static str>,
    logical_deleted: Option<(&'static str, Value)>,
    key_unique_constraint: Option<KeyUniqueConstraint>,
    microservice: Option<&'static str>,
}

impl EntityTypeBuilder {
    pub fn prop(mut self, prop: PropInfo) -> Self {
        self.props.push(prop);
        self
    }

    /// Add the id property (a scalar column) and mark it as the id.
    pub fn id(mut self, name: &'static str) -> Self {
        self.props.push(PropInfo::scalar(name));
        self.id = Some(name);
        self
    }

    /// Add a fully described id property, e.g. one with a converter.
    pub fn id_prop(mut self, prop: PropInfo) -> Self {
        self.id = Some(prop.name);
        self.props.push(prop);
        self
    }

    pub fn key(mut self, names: &[&'static str]) -> Self {
        self.key = names.to_vec();
        self
    }

    pub fn version(mut self, name: &'static str) -> Self {
        self.version = Some(name);
        self
    }

    pub fn logical_deleted(mut self, name: &'static str, initialized: impl Into<Value>) -> Self {
        self.logical_deleted = Some((name, initialized.into()));
        self
    }

    pub fn key_unique_constraint(mut self, constraint: KeyUniqueConstraint) -> Self {
        self.key_unique_constraint = Some(constraint);
        self
    }

    pub fn microservice(mut self, name: &'static str) -> Self {
        self.microservice = Some(name);
        self
    }

    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Arc<EntityType>> {
        let mut prop_index = HashMap::with_capacity(self.props.len());
        for (ordinal, prop) in self.props.iter().enumerate() {
            if prop_index.insert(prop.name, ordinal).is_some() {
                return Err(self.invalid(format!("duplicate property \"{}\"", prop.name)));
            }
        }
        let resolve = |name: &'static str| -> Result<usize> {
            prop_index
                .get(name)
                .copied()
                .ok_or_else(|| self.invalid(format!("unknown property \"{}\"", name)))
        };

        let id_name = self
            .id
            .ok_or_else(|| self.invalid("no id property declared".to_string()))?;
        let id = resolve(id_name)?;
        let key = self
            .key
            .iter()
            .map(|name| resolve(name))
            .collect::<Result<Vec<_>>>()?;
        if key.contains(&id) {
            return Err(self.invalid("the id cannot be part of the business key".to_string()));
        }
        let version = self.version.map(resolve).transpose()?;
        let logical_deleted = match &self.logical_deleted {
            Some((name, initialized)) => Some(LogicalDeletedInfo {
                prop: resolve(name)?,
                initialized: initialized.clone(),
            }),
            None => None,
        };
        for ordinal in key.iter().copied().chain(version) {
            if !self.props[ordinal].is_column_definition() {
                return Err(self.invalid(format!(
                    "\"{}\" must be a column to be part of the key or the version",
                    self.props[ordinal].name
                )));
            }
        }

        Ok(Arc::new(EntityType {
            name: self.name,
            table: self.table,
            props: self.props,
            prop_index,
            id,
            key,
            version,
            logical_deleted,
            key_unique_constraint: self.key_unique_constraint,
            microservice: self.microservice,
        }))
    }

    fn invalid(&self, message: String) -> Error {
        Error::Config(ConfigError {
            message: format!("invalid entity type \"{}\": {}", self.name, message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Arc<EntityType> {
        EntityType::builder("Book", "book")
            .id("id")
            .prop(PropInfo::scalar("name"))
            .prop(PropInfo::scalar("edition"))
            .prop(PropInfo::scalar("version"))
            .prop(PropInfo::reference("store", "store_id", "BookStore"))
            .prop(PropInfo::reference_list("authors", "Author"))
            .key(&["name", "edition"])
            .version("version")
            .build()
            .expect("valid book type")
    }

    #[test]
    fn test_ordinals_follow_declaration_order() {
        let ty = book();
        assert_eq!(ty.id_prop(), 0);
        assert_eq!(ty.key_props(), &[1, 2]);
        assert_eq!(ty.version_prop(), Some(3));
        assert_eq!(ty.ordinal_of("store"), Some(4));
        assert_eq!(ty.prop(4).column_name, "store_id");
    }

    #[test]
    fn test_column_definitions() {
        let ty = book();
        assert!(ty.prop(4).is_column_definition());
        assert!(ty.prop(4).is_reference());
        assert!(!ty.prop(5).is_column_definition());
        assert!(ty.prop(5).is_association());
        assert!(!ty.prop(1).is_association());
    }

    #[test]
    fn test_build_rejects_unknown_key() {
        let err = EntityType::builder("Book", "book")
            .id("id")
            .key(&["isbn"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown property \"isbn\""));
    }

    #[test]
    fn test_build_requires_id() {
        let err = EntityType::builder("Book", "book")
            .prop(PropInfo::scalar("name"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no id property"));
    }

    #[test]
    fn test_default_value_evaluation() {
        fn now() -> Value {
            Value::Timestamp(1_700_000_000)
        }
        let constant = PropInfo::scalar("price").default_value(Value::Int(0));
        let generated = PropInfo::scalar("created_time").default_with(now);
        assert_eq!(constant.default.unwrap().evaluate(), Value::Int(0));
        assert_eq!(
            generated.default.unwrap().evaluate(),
            Value::Timestamp(1_700_000_000)
        );
    }
}
