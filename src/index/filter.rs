//! Document selection for removals and replacements.
//!
//! The writer only needs one capability from a query: which documents of a
//! given segment it matches. Query languages live outside the engine and
//! adapt to [`Filter`].

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::index::DocId;
use crate::index::iterator::DocIterator;
use crate::index::segment::SegmentReader;

/// Sorted, deduplicated document ids of one segment.
pub type DocSet = Vec<DocId>;

/// Selects documents of a segment.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Documents of `segment` this filter selects, removed ones included.
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet>;
}

impl<F: Filter + ?Sized> Filter for Arc<F> {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        (**self).matches(segment)
    }
}

impl<F: Filter + ?Sized> Filter for Box<F> {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        (**self).matches(segment)
    }
}

/// Documents whose `field` was indexed with `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermFilter {
    field: String,
    term: Vec<u8>,
}

impl TermFilter {
    pub fn new(field: impl Into<String>, term: impl AsRef<[u8]>) -> Self {
        TermFilter {
            field: field.into(),
            term: term.as_ref().to_vec(),
        }
    }
}

impl Filter for TermFilter {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        Ok(segment.postings(&self.field, &self.term).collect_docs())
    }
}

/// Documents whose stored `column` value equals `value` byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    column: String,
    value: Vec<u8>,
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        ColumnFilter {
            column: column.into(),
            value: value.as_ref().to_vec(),
        }
    }
}

impl Filter for ColumnFilter {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        let Some(column) = segment.column_reader(&self.column) else {
            return Ok(DocSet::new());
        };

        let mut docs = DocSet::new();
        column.visit(|doc, value| {
            if value == self.value.as_slice() {
                docs.push(doc);
            }
            true
        })?;

        Ok(docs)
    }
}

/// Every document.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFilter;

impl Filter for AllFilter {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        Ok(segment.docs_iterator().collect_docs())
    }
}

/// No document.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyFilter;

impl Filter for EmptyFilter {
    fn matches(&self, _segment: &SegmentReader) -> Result<DocSet> {
        Ok(DocSet::new())
    }
}

/// A fixed list of ids, applied to every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIdFilter {
    docs: DocSet,
}

impl DocIdFilter {
    pub fn new(docs: impl IntoIterator<Item = DocId>) -> Self {
        let mut docs: DocSet = docs.into_iter().collect();
        docs.sort_unstable();
        docs.dedup();
        DocIdFilter { docs }
    }
}

impl Filter for DocIdFilter {
    fn matches(&self, segment: &SegmentReader) -> Result<DocSet> {
        Ok(self
            .docs
            .iter()
            .copied()
            .filter(|&doc| segment.contains(doc))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::column::ColumnstoreReader;
    use crate::index::column::ColumnstoreWriter;
    use crate::index::document::IndexFeatures;
    use crate::index::mask::DocumentMask;
    use crate::index::meta::SegmentMeta;
    use crate::index::postings::PostingsBuilder;

    fn segment() -> SegmentReader {
        let mut columns = ColumnstoreWriter::new();
        let mut postings = PostingsBuilder::new();
        for (doc, name) in [(1u32, "a"), (2, "b"), (3, "a")] {
            columns.insert("name", doc, name.as_bytes());
            postings.insert("name", IndexFeatures::NONE, name.as_bytes(), doc);
        }

        let mut meta = SegmentMeta::new("_1", "1.0");
        meta.docs_count = 3;
        meta.live_docs_count = 2;
        let mask: DocumentMask = [3].into_iter().collect();
        let columns = ColumnstoreReader::from_bytes(columns.finish().unwrap()).unwrap();

        SegmentReader::from_parts(meta, columns, Arc::new(postings.build()), mask, Vec::new())
            .unwrap()
    }

    #[test]
    fn test_filters() {
        let segment = segment();

        assert_eq!(TermFilter::new("name", "a").matches(&segment).unwrap(), vec![1, 3]);
        assert!(TermFilter::new("other", "a").matches(&segment).unwrap().is_empty());
        assert_eq!(ColumnFilter::new("name", "b").matches(&segment).unwrap(), vec![2]);
        assert!(ColumnFilter::new("missing", "b").matches(&segment).unwrap().is_empty());
        assert_eq!(AllFilter.matches(&segment).unwrap(), vec![1, 2, 3]);
        assert!(EmptyFilter.matches(&segment).unwrap().is_empty());
        assert_eq!(DocIdFilter::new([9, 2, 2]).matches(&segment).unwrap(), vec![2]);

        let boxed: Box<dyn Filter> = Box::new(AllFilter);
        assert_eq!(boxed.matches(&segment).unwrap().len(), 3);
    }
}
