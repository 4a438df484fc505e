//! Per-segment inverted lists.
//!
//! Postings are kept deliberately simple: a field maps each term to the
//! ascending list of documents containing it. The term dictionary and query
//! evaluation live outside the engine; this is the narrow surface filters and
//! merges need.

use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::index::DocId;
use crate::index::document::IndexFeatures;
use crate::index::iterator::SortedDocIterator;

/// Terms of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPostings {
    pub features: IndexFeatures,
    pub terms: BTreeMap<Vec<u8>, Vec<DocId>>,
}

/// Immutable postings of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postings {
    fields: BTreeMap<String, FieldPostings>,
}

impl Postings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in ascending order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.keys().map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&FieldPostings> {
        self.fields.get(name)
    }

    pub fn docs(&self, field: &str, term: &[u8]) -> Option<&[DocId]> {
        self.fields
            .get(field)
            .and_then(|f| f.terms.get(term))
            .map(Vec::as_slice)
    }

    /// Iterator over the documents of `field:term`; empty if either is unknown.
    pub fn iterator(&self, field: &str, term: &[u8]) -> SortedDocIterator {
        match self.docs(field, term) {
            Some(docs) => SortedDocIterator::new(docs.to_vec()),
            None => SortedDocIterator::empty(),
        }
    }

    /// Copy every posting of `self` into `builder`, translating document ids
    /// through `doc_map` (indexed by old id, `0` means dropped).
    pub(crate) fn remap_into(&self, doc_map: &[DocId], builder: &mut PostingsBuilder) {
        for (name, field) in &self.fields {
            for (term, docs) in &field.terms {
                for &doc in docs {
                    let mapped = doc_map.get(doc as usize).copied().unwrap_or(0);
                    if mapped != 0 {
                        builder.insert(name, field.features, term, mapped);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct FieldBuilder {
    features: IndexFeatures,
    terms: AHashMap<Vec<u8>, Vec<DocId>>,
}

/// Mutable postings accumulated by a segment writer or a merge.
#[derive(Debug, Default)]
pub struct PostingsBuilder {
    fields: AHashMap<String, FieldBuilder>,
    memory: usize,
}

impl PostingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `doc` contains `term` in `field`.
    ///
    /// Features of a field are the union of every document's features.
    pub fn insert(&mut self, field: &str, features: IndexFeatures, term: &[u8], doc: DocId) {
        if !self.fields.contains_key(field) {
            self.memory += field.len();
            self.fields.insert(field.to_string(), FieldBuilder::default());
        }
        let Some(entry) = self.fields.get_mut(field) else {
            return;
        };
        entry.features = entry.features.union(features);

        let docs = match entry.terms.get_mut(term) {
            Some(docs) => docs,
            None => {
                self.memory += term.len();
                entry.terms.entry(term.to_vec()).or_default()
            }
        };

        match docs.last() {
            Some(&last) if last == doc => {}
            Some(&last) if last > doc => {
                // Merges feed segments in order, but keep the list sorted anyway.
                if let Err(pos) = docs.binary_search(&doc) {
                    docs.insert(pos, doc);
                    self.memory += std::mem::size_of::<DocId>();
                }
            }
            _ => {
                docs.push(doc);
                self.memory += std::mem::size_of::<DocId>();
            }
        }
    }

    /// Drop every posting of documents `>= first`.
    pub fn truncate(&mut self, first: DocId) {
        for field in self.fields.values_mut() {
            for docs in field.terms.values_mut() {
                let keep = docs.partition_point(|&d| d < first);
                docs.truncate(keep);
            }
            field.terms.retain(|_, docs| !docs.is_empty());
        }
        self.fields.retain(|_, f| !f.terms.is_empty());
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.keys().map(String::as_str)
    }

    /// Approximate heap usage.
    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn build(self) -> Postings {
        let fields = self
            .fields
            .into_iter()
            .map(|(name, field)| {
                let terms = field.terms.into_iter().collect();
                (
                    name,
                    FieldPostings {
                        features: field.features,
                        terms,
                    },
                )
            })
            .collect();

        Postings { fields }
    }
}
