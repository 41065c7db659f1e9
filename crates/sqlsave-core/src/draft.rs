//! Mutable entity drafts.
//!
//! A draft is a partially populated entity: only the properties that were
//! explicitly assigned are "loaded". Unloaded properties are left out of
//! generated SQL entirely, which is what makes two drafts of the same type
//! have different shapes.

use crate::fields_set::FieldsSet;
use crate::meta::{EntityType, PropKind};
use crate::value::{Key, Value};
use std::sync::Arc;

/// Value of a loaded property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Scalar column value
    Scalar(Value),
    /// Many-to-one reference, represented by the target's id (or none)
    Reference(Option<Value>),
    /// Collection of target ids
    References(Vec<Value>),
}

impl PropValue {
    /// The value stored in this entity's own column.
    ///
    /// A null reference is NULL; a collection is bound as an array.
    pub fn column_value(&self) -> Value {
        match self {
            PropValue::Scalar(v) => v.clone(),
            PropValue::Reference(Some(id)) => id.clone(),
            PropValue::Reference(None) => Value::Null,
            PropValue::References(ids) => Value::Array(ids.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            PropValue::Scalar(v) => v.is_null(),
            PropValue::Reference(target) => target.as_ref().is_none_or(Value::is_null),
            PropValue::References(_) => false,
        }
    }
}

/// A partially populated entity of one [`EntityType`].
#[derive(Debug, Clone)]
pub struct Draft {
    ty: Arc<EntityType>,
    loaded: FieldsSet,
    values: Vec<PropValue>,
}

impl Draft {
    /// An empty draft with nothing loaded.
    pub fn new(ty: Arc<EntityType>) -> Self {
        let len = ty.props().len();
        let values = ty
            .props()
            .iter()
            .map(|prop| match prop.kind {
                PropKind::Scalar => PropValue::Scalar(Value::Null),
                PropKind::Reference { .. } => PropValue::Reference(None),
                PropKind::ReferenceList { .. } => PropValue::References(Vec::new()),
            })
            .collect();
        Self {
            ty,
            loaded: FieldsSet::empty(len),
            values,
        }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.ty
    }

    /// Which properties are loaded.
    pub fn loaded(&self) -> &FieldsSet {
        &self.loaded
    }

    pub fn is_loaded(&self, ordinal: usize) -> bool {
        self.loaded.is_set(ordinal)
    }

    /// Loaded value of a property, or `None` when it is unloaded.
    pub fn get(&self, ordinal: usize) -> Option<&PropValue> {
        if self.loaded.is_set(ordinal) {
            self.values.get(ordinal)
        } else {
            None
        }
    }

    /// Loaded column value of a property.
    pub fn column_value(&self, ordinal: usize) -> Option<Value> {
        self.get(ordinal).map(PropValue::column_value)
    }

    /// Load a property by ordinal.
    ///
    /// # Panics
    ///
    /// Panics if the ordinal does not belong to the draft's type.
    pub fn set_at(&mut self, ordinal: usize, value: PropValue) {
        self.values[ordinal] = value;
        self.loaded.set(ordinal);
    }

    /// Load a scalar (or the id of a reference) by property name.
    ///
    /// # Panics
    ///
    /// Panics if the type has no property with that name.
    pub fn set(&mut self, prop: &str, value: impl Into<Value>) {
        let ordinal = self.ordinal(prop);
        self.set_value(ordinal, value.into());
    }

    /// Load a property by ordinal from a column value.
    ///
    /// References take the target id; collections take an array of ids.
    pub fn set_value(&mut self, ordinal: usize, value: Value) {
        let value = match self.ty.prop(ordinal).kind {
            PropKind::Scalar => PropValue::Scalar(value),
            PropKind::Reference { .. } if value.is_null() => PropValue::Reference(None),
            PropKind::Reference { .. } => PropValue::Reference(Some(value)),
            PropKind::ReferenceList { .. } => match value {
                Value::Array(ids) => PropValue::References(ids),
                other => PropValue::References(vec![other]),
            },
        };
        self.set_at(ordinal, value);
    }

    /// Builder form of [`Draft::set`].
    pub fn with(mut self, prop: &str, value: impl Into<Value>) -> Self {
        self.set(prop, value);
        self
    }

    /// Make a property unloaded again.
    pub fn unload(&mut self, ordinal: usize) {
        self.loaded.clear(ordinal);
    }

    /// Loaded id value.
    pub fn id(&self) -> Option<Value> {
        self.column_value(self.ty.id_prop())
    }

    pub fn set_id(&mut self, id: Value) {
        self.set_at(self.ty.id_prop(), PropValue::Scalar(id));
    }

    /// Business key of the draft if every key property is loaded.
    pub fn key(&self) -> Option<Key> {
        self.key_of(self.ty.key_props())
    }

    /// Key made of the given properties if all are loaded.
    pub fn key_of(&self, props: &[usize]) -> Option<Key> {
        if props.is_empty() {
            return None;
        }
        props
            .iter()
            .map(|ordinal| self.column_value(*ordinal))
            .collect::<Option<Vec<_>>>()
            .map(Key::composite)
    }

    /// Is any property other than the id loaded?
    pub fn has_non_id_values(&self) -> bool {
        let id = self.ty.id_prop();
        self.loaded.iter().any(|ordinal| ordinal != id)
    }

    fn ordinal(&self, prop: &str) -> usize {
        match self.ty.ordinal_of(prop) {
            Some(ordinal) => ordinal,
            None => panic!("type \"{}\" has no property \"{}\"", self.ty.name(), prop),
        }
    }
}
