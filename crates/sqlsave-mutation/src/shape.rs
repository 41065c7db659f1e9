//! Shapes and shape-grouped batches.
//!
//! Two drafts with the same shape load exactly the same persisted columns,
//! so one statement text serves both.

use crate::options::SaveMode;
use sqlsave_core::{Draft, EntityType};
use std::collections::HashMap;

/// Index of a draft owned by a [`PreHandler`](crate::PreHandler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DraftId(pub(crate) usize);

impl DraftId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which loaded properties take part in a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropFilter {
    /// Properties backed by a column of the entity's table
    Columns,
    /// The id plus associations stored outside the table
    IdAndAssociations,
}

impl PropFilter {
    fn accepts(self, ty: &EntityType, ordinal: usize) -> bool {
        let prop = ty.prop(ordinal);
        match self {
            PropFilter::Columns => prop.is_column_definition(),
            PropFilter::IdAndAssociations => {
                ordinal == ty.id_prop() || (prop.is_association() && !prop.is_column_definition())
            }
        }
    }
}

/// The sorted ordinals of the loaded properties that pass a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    props: Vec<usize>,
}

impl Shape {
    /// Shape of `draft`, leaving out `excluded` ordinals.
    pub fn of(draft: &Draft, filter: PropFilter, excluded: &[usize]) -> Self {
        let ty = draft.entity_type();
        let props = draft
            .loaded()
            .iter()
            .filter(|ordinal| filter.accepts(ty, *ordinal) && !excluded.contains(ordinal))
            .collect();
        Self { props }
    }

    pub fn props(&self) -> &[usize] {
        &self.props
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.props.binary_search(&ordinal).is_ok()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// Same-shape drafts in the order they were added.
#[derive(Debug, Clone)]
pub struct Batch {
    shape: Shape,
    mode: SaveMode,
    drafts: Vec<DraftId>,
}

impl Batch {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Statement kind: `InsertOnly`, `UpdateOnly`, `Upsert` or
    /// `InsertIfAbsent`.
    pub fn mode(&self) -> SaveMode {
        self.mode
    }

    pub fn drafts(&self) -> &[DraftId] {
        &self.drafts
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

/// Shape to batch map, iterated in first-seen shape order.
#[derive(Debug, Clone)]
pub struct ShapedEntityMap {
    mode: SaveMode,
    filter: PropFilter,
    key_props: Vec<usize>,
    index: HashMap<Shape, usize>,
    batches: Vec<Batch>,
}

impl ShapedEntityMap {
    pub fn new(mode: SaveMode, filter: PropFilter, key_props: Vec<usize>) -> Self {
        Self {
            mode,
            filter,
            key_props,
            index: HashMap::new(),
            batches: Vec::new(),
        }
    }

    pub fn empty(mode: SaveMode) -> Self {
        Self::new(mode, PropFilter::Columns, Vec::new())
    }

    pub fn mode(&self) -> SaveMode {
        self.mode
    }

    /// Add a draft to the batch of its shape.
    pub fn add(&mut self, id: DraftId, draft: &Draft) {
        let shape = Shape::of(draft, self.filter, &[]);
        self.push(shape, id);
    }

    /// Add a draft matched by key: its key columns are not rewritten, so
    /// they are left out of the shape.
    pub fn add_without_key(&mut self, id: DraftId, draft: &Draft) {
        let shape = Shape::of(draft, self.filter, &self.key_props);
        self.push(shape, id);
    }

    fn push(&mut self, shape: Shape, id: DraftId) {
        let idx = match self.index.get(&shape) {
            Some(idx) => *idx,
            None => {
                let idx = self.batches.len();
                self.index.insert(shape.clone(), idx);
                self.batches.push(Batch {
                    shape,
                    mode: self.mode,
                    drafts: Vec::new(),
                });
                idx
            }
        };
        self.batches[idx].drafts.push(id);
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of drafts in all batches.
    pub fn draft_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Every draft id in batch order.
    pub fn draft_ids(&self) -> impl Iterator<Item = DraftId> + '_ {
        self.batches.iter().flat_map(|b| b.drafts.iter().copied())
    }
}

impl<'a> IntoIterator for &'a ShapedEntityMap {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.iter()
    }
}
