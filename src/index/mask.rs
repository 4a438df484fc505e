//! Removed-document masks.
//!
//! A [`DocumentMask`] is the persisted set of logically removed documents of
//! one segment version. [`LiveDocs`] is its dense in-memory complement used
//! for O(1) liveness checks.

use std::collections::BTreeSet;

use bit_vec::BitVec;

use crate::index::{DocId, doc_limits};

/// Sorted set of removed document ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMask {
    removed: BTreeSet<DocId>,
}

impl DocumentMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `doc` removed. Returns `true` if it was live before.
    pub fn insert(&mut self, doc: DocId) -> bool {
        self.removed.insert(doc)
    }

    pub fn contains(&self, doc: DocId) -> bool {
        self.removed.contains(&doc)
    }

    pub fn len(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    /// Removed ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = DocId> + '_ {
        self.removed.iter().copied()
    }

    /// Ids removed here but not in `older`.
    pub fn difference<'a>(&'a self, older: &'a DocumentMask) -> impl Iterator<Item = DocId> + 'a {
        self.removed.difference(&older.removed).copied()
    }

    pub fn extend(&mut self, other: &DocumentMask) {
        self.removed.extend(other.removed.iter().copied());
    }

    pub fn to_vec(&self) -> Vec<DocId> {
        self.iter().collect()
    }
}

impl FromIterator<DocId> for DocumentMask {
    fn from_iter<T: IntoIterator<Item = DocId>>(iter: T) -> Self {
        DocumentMask {
            removed: iter.into_iter().collect(),
        }
    }
}

/// Dense liveness bitmap indexed by [`DocId`].
#[derive(Debug, Clone)]
pub struct LiveDocs {
    bits: BitVec,
    live: usize,
}

impl LiveDocs {
    /// Build the complement of `mask` over `MIN..=docs_count`.
    pub fn new(docs_count: DocId, mask: &DocumentMask) -> Self {
        let len = docs_count as usize + 1;
        let mut bits = BitVec::from_elem(len, true);
        bits.set(doc_limits::INVALID as usize, false);

        let mut live = docs_count as usize;
        for doc in mask.iter() {
            let idx = doc as usize;
            if idx < len && bits.get(idx).unwrap_or(false) {
                bits.set(idx, false);
                live -= 1;
            }
        }

        LiveDocs { bits, live }
    }

    pub fn is_live(&self, doc: DocId) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Number of live documents.
    pub fn count(&self) -> usize {
        self.live
    }
}
