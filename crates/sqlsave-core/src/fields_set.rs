//! Fixed-size bitset of property ordinals.
//!
//! Drafts use it to record which properties were explicitly assigned
//! ("loaded"); shapes are built from it.

/// A bitset indexed by property ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldsSet {
    bits: Vec<u64>,
    len: usize,
}

impl FieldsSet {
    /// A set of `len` ordinals with nothing set.
    pub fn empty(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// A set of `len` ordinals with everything set.
    pub fn all(len: usize) -> Self {
        let mut set = Self::empty(len);
        for idx in 0..len {
            set.set(idx);
        }
        set
    }

    /// Number of ordinals this set can hold.
    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.len, "ordinal {idx} out of range {}", self.len);
        self.bits[idx / 64] |= 1u64 << (idx % 64);
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] &= !(1u64 << (idx % 64));
        }
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.len && self.bits[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Number of set ordinals.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set ordinals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|idx| self.is_set(*idx))
    }
}
