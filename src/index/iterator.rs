//! Forward-only document iterators.
//!
//! Every iterator starts before the first document ([`doc_limits::INVALID`])
//! and ends on [`doc_limits::EOF`]. Positions only ever move forward: a
//! [`DocIterator::seek`] to a target at or before the current position is a
//! no-op that reports the current position.

use std::sync::Arc;

use crate::index::mask::LiveDocs;
use crate::index::{DocId, doc_limits};

/// A monotonic cursor over ascending document ids.
pub trait DocIterator {
    /// Current position.
    fn value(&self) -> DocId;

    /// Advance to the next document. Returns `false` once exhausted.
    fn next(&mut self) -> bool;

    /// Advance to the first document `>= target` and return the new position.
    fn seek(&mut self, target: DocId) -> DocId {
        if target <= self.value() {
            return self.value();
        }

        while self.next() {
            if self.value() >= target {
                break;
            }
        }

        self.value()
    }

    /// Drain the remaining documents into a vector.
    fn collect_docs(&mut self) -> Vec<DocId> {
        let mut docs = Vec::new();
        while self.next() {
            docs.push(self.value());
        }
        docs
    }
}

impl<I: DocIterator + ?Sized> DocIterator for Box<I> {
    fn value(&self) -> DocId {
        (**self).value()
    }

    fn next(&mut self) -> bool {
        (**self).next()
    }

    fn seek(&mut self, target: DocId) -> DocId {
        (**self).seek(target)
    }
}

/// Iterator over a sorted, deduplicated list of ids.
#[derive(Debug, Clone)]
pub struct SortedDocIterator {
    docs: Arc<[DocId]>,
    pos: usize,
    current: DocId,
}

impl SortedDocIterator {
    pub fn new(docs: impl Into<Arc<[DocId]>>) -> Self {
        SortedDocIterator {
            docs: docs.into(),
            pos: 0,
            current: doc_limits::INVALID,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Total number of ids, regardless of position.
    pub fn cost(&self) -> usize {
        self.docs.len()
    }
}

impl DocIterator for SortedDocIterator {
    fn value(&self) -> DocId {
        self.current
    }

    fn next(&mut self) -> bool {
        match self.docs.get(self.pos) {
            Some(&doc) => {
                self.pos += 1;
                self.current = doc;
                true
            }
            None => {
                self.current = doc_limits::EOF;
                false
            }
        }
    }

    fn seek(&mut self, target: DocId) -> DocId {
        if target <= self.current {
            return self.current;
        }

        let offset = self.docs[self.pos..].partition_point(|&doc| doc < target);
        self.pos += offset;
        self.next();
        self.current
    }
}

/// Iterator over `MIN..=docs_count`, optionally skipping removed documents.
#[derive(Debug, Clone)]
pub struct RangeDocIterator {
    live: Option<Arc<LiveDocs>>,
    last: DocId,
    current: DocId,
}

impl RangeDocIterator {
    pub(crate) fn new(docs_count: DocId, live: Option<Arc<LiveDocs>>) -> Self {
        RangeDocIterator {
            live,
            last: docs_count,
            current: doc_limits::INVALID,
        }
    }
}

impl DocIterator for RangeDocIterator {
    fn value(&self) -> DocId {
        self.current
    }

    fn next(&mut self) -> bool {
        if doc_limits::eof(self.current) {
            return false;
        }

        let mut candidate = self.current + 1;
        while candidate <= self.last {
            if self.live.as_ref().is_none_or(|live| live.is_live(candidate)) {
                self.current = candidate;
                return true;
            }
            candidate += 1;
        }

        self.current = doc_limits::EOF;
        false
    }
}

/// Filters an inner iterator down to live documents.
#[derive(Debug, Clone)]
pub struct MaskedDocIterator<I> {
    inner: I,
    live: Arc<LiveDocs>,
}

impl<I: DocIterator> MaskedDocIterator<I> {
    pub(crate) fn new(inner: I, live: Arc<LiveDocs>) -> Self {
        MaskedDocIterator { inner, live }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I: DocIterator> DocIterator for MaskedDocIterator<I> {
    fn value(&self) -> DocId {
        self.inner.value()
    }

    fn next(&mut self) -> bool {
        while self.inner.next() {
            if self.live.is_live(self.inner.value()) {
                return true;
            }
        }
        false
    }

    fn seek(&mut self, target: DocId) -> DocId {
        if target <= self.inner.value() {
            return self.inner.value();
        }

        let doc = self.inner.seek(target);
        if doc_limits::eof(doc) || self.live.is_live(doc) {
            return doc;
        }

        self.next();
        self.inner.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::mask::DocumentMask;

    #[test]
    fn test_sorted_iterator_seek_never_moves_backward() {
        let mut it = SortedDocIterator::new(vec![2, 4, 6, 8]);
        assert_eq!(it.value(), doc_limits::INVALID);

        assert_eq!(it.seek(5), 6);
        assert_eq!(it.seek(3), 6);
        assert_eq!(it.seek(6), 6);
        assert!(it.next());
        assert_eq!(it.value(), 8);
        assert_eq!(it.seek(9), doc_limits::EOF);
        assert!(!it.next());
        assert_eq!(it.value(), doc_limits::EOF);
    }

    #[test]
    fn test_range_iterator_skips_removed() {
        let mask: DocumentMask = [2, 3].into_iter().collect();
        let live = Arc::new(LiveDocs::new(5, &mask));

        let mut it = RangeDocIterator::new(5, Some(live));
        assert_eq!(it.collect_docs(), vec![1, 4, 5]);

        let mut all = RangeDocIterator::new(3, None);
        assert_eq!(all.collect_docs(), vec![1, 2, 3]);
        assert_eq!(all.value(), doc_limits::EOF);
    }

    #[test]
    fn test_masked_iterator() {
        let mask: DocumentMask = [4].into_iter().collect();
        let live = Arc::new(LiveDocs::new(8, &mask));

        let mut it = MaskedDocIterator::new(SortedDocIterator::new(vec![2, 4, 6, 8]), live);
        assert_eq!(it.seek(3), 6);
        assert_eq!(it.seek(1), 6);
        assert_eq!(it.collect_docs(), vec![8]);
    }
}
