//! In-memory segment buffers.
//!
//! A [`SegmentContext`] is the unit a transaction handle leases from a flush
//! context: the [`SegmentWriter`] currently buffering documents, the segments
//! it already sealed, and the removals/replacements queued through it. The
//! whole context is applied when its generation is flushed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::Result;
use crate::index::codec::{Codec, columns_file_name, postings_file_name};
use crate::index::column::ColumnstoreWriter;
use crate::index::document::{Document, StagedDocument};
use crate::index::filter::Filter;
use crate::index::meta::{SegmentMeta, segment_name};
use crate::index::postings::PostingsBuilder;
use crate::index::segment::SegmentReader;
use crate::index::{DocId, doc_limits};
use crate::storage::{FileRef, Storage};

/// Bookkeeping of one buffered document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DocState {
    /// Tick of the flush context when the document was inserted.
    pub generation: u64,
    /// Index of the replacement this document belongs to, if any.
    pub update: Option<usize>,
    pub rolled_back: bool,
}

impl DocState {
    pub fn insert(generation: u64) -> Self {
        DocState {
            generation,
            update: None,
            rolled_back: false,
        }
    }
}

/// A queued removal, possibly the removal half of a replacement.
#[derive(Clone)]
pub(crate) struct Modification {
    /// `None` once rolled back.
    pub filter: Option<Arc<dyn Filter>>,
    pub generation: u64,
    pub update: bool,
    /// Whether the filter removed at least one document during flush.
    pub seen: bool,
}

impl fmt::Debug for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modification")
            .field("filter", &self.filter)
            .field("generation", &self.generation)
            .field("update", &self.update)
            .field("seen", &self.seen)
            .finish()
    }
}

/// Where sealed segments go.
#[derive(Clone, Copy)]
pub(crate) struct SegmentSink<'a> {
    pub storage: &'a dyn Storage,
    pub codec: &'a dyn Codec,
    pub counter: &'a AtomicU64,
}

/// Thresholds that trigger sealing; `0` disables a threshold.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SegmentLimits {
    pub docs_max: usize,
    pub memory_max: usize,
}

/// Buffers documents of one future segment.
#[derive(Debug, Default)]
pub(crate) struct SegmentWriter {
    columns: ColumnstoreWriter,
    postings: PostingsBuilder,
    docs: Vec<DocState>,
}

impl SegmentWriter {
    pub fn docs_count(&self) -> usize {
        self.docs.len()
    }

    pub fn memory(&self) -> usize {
        self.columns.memory()
            + self.postings.memory()
            + self.docs.len() * std::mem::size_of::<DocState>()
    }

    /// Move a validated document into the buffer and return its id.
    fn commit_document(&mut self, staged: &StagedDocument, state: DocState) -> DocId {
        let doc = self.docs.len() as DocId + doc_limits::MIN;

        for (name, features, tokens) in &staged.indexed {
            for token in tokens {
                self.postings.insert(name, *features, token, doc);
            }
        }
        for (name, range) in &staged.stored {
            self.columns.insert(name, doc, &staged.data[range.clone()]);
        }

        self.docs.push(state);
        doc
    }

    /// Drop every document `>= first`.
    fn truncate(&mut self, first: DocId) {
        self.columns.truncate(first);
        self.postings.truncate(first);
        self.docs.truncate(first.saturating_sub(doc_limits::MIN) as usize);
    }

    /// Persist the buffered documents as a new segment.
    fn seal(self, sink: SegmentSink<'_>) -> Result<FlushedSegment> {
        let name = segment_name(sink.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let refs = vec![
            sink.storage.file_refs().add(&columns_file_name(&name)),
            sink.storage.file_refs().add(&postings_file_name(&name)),
        ];

        let postings = self.postings.build();
        let mut meta = SegmentMeta::new(&name, sink.codec.name());
        meta.docs_count = self.docs.len() as u64;
        meta.live_docs_count = meta.docs_count;
        meta.columns = self.columns.column_names();
        meta.fields = postings.field_names().map(str::to_string).collect();

        let columns = sink.codec.write_columns(sink.storage, &name, self.columns)?;
        let postings = sink.codec.write_postings(sink.storage, &name, &postings)?;
        meta.size = columns.size + postings.size;
        meta.files.insert(columns.name);
        meta.files.insert(postings.name);

        let reader = SegmentReader::open(sink.storage, sink.codec, &meta)?;
        debug!("sealed segment {name} with {} document(s)", meta.docs_count);

        Ok(FlushedSegment {
            meta,
            reader,
            docs: self.docs,
            refs,
        })
    }
}

/// A sealed but not yet committed segment.
#[derive(Debug)]
pub(crate) struct FlushedSegment {
    pub meta: SegmentMeta,
    pub reader: SegmentReader,
    /// Indexed by `doc - MIN`.
    pub docs: Vec<DocState>,
    pub refs: Vec<FileRef>,
}

/// Position inside a [`SegmentContext`] at which a lease started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LeaseMark {
    flushed: usize,
    docs: usize,
    modifications: usize,
}

/// Everything one transaction handle buffered into a generation.
#[derive(Debug, Default)]
pub(crate) struct SegmentContext {
    writer: SegmentWriter,
    staged: StagedDocument,
    pub flushed: Vec<FlushedSegment>,
    pub modifications: Vec<Modification>,
}

impl SegmentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) -> LeaseMark {
        LeaseMark {
            flushed: self.flushed.len(),
            docs: self.writer.docs_count(),
            modifications: self.modifications.len(),
        }
    }

    /// Stage one document through `f` and buffer it if it stayed valid.
    ///
    /// Returns `Ok(false)` for a rejected document; an error only comes from
    /// sealing the writer once a limit is reached.
    pub fn insert<F>(
        &mut self,
        state: DocState,
        limits: SegmentLimits,
        sink: SegmentSink<'_>,
        f: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut Document<'_>),
    {
        let valid = {
            let mut doc = Document::new(&mut self.staged);
            f(&mut doc);
            doc.is_valid()
        };

        self.finish_document(valid, state, limits, sink)
    }

    /// Like [`insert`](Self::insert) for a fallible staging function that
    /// also reports whether it wants to be called again. A call that added
    /// no field stages nothing.
    ///
    /// On `Err` the in-flight document is discarded and the error returned.
    pub fn try_insert<F>(
        &mut self,
        state: DocState,
        limits: SegmentLimits,
        sink: SegmentSink<'_>,
        f: F,
    ) -> Result<(bool, bool)>
    where
        F: FnOnce(&mut Document<'_>) -> Result<bool>,
    {
        let (valid, more) = {
            let mut doc = Document::new(&mut self.staged);
            let more = f(&mut doc)?;
            (doc.is_valid() && !doc.is_empty(), more)
        };

        Ok((self.finish_document(valid, state, limits, sink)?, more))
    }

    fn finish_document(
        &mut self,
        valid: bool,
        state: DocState,
        limits: SegmentLimits,
        sink: SegmentSink<'_>,
    ) -> Result<bool> {
        if !valid {
            return Ok(false);
        }

        self.writer.commit_document(&self.staged, state);

        let full = (limits.docs_max > 0 && self.writer.docs_count() >= limits.docs_max)
            || (limits.memory_max > 0 && self.writer.memory() >= limits.memory_max);
        if full {
            self.seal(sink)?;
        }

        Ok(true)
    }

    pub fn push_modification(
        &mut self,
        filter: Arc<dyn Filter>,
        generation: u64,
        update: bool,
    ) -> usize {
        self.modifications.push(Modification {
            filter: Some(filter),
            generation,
            update,
            seen: false,
        });
        self.modifications.len() - 1
    }

    /// Seal the active writer, if it holds anything.
    pub fn seal(&mut self, sink: SegmentSink<'_>) -> Result<()> {
        if self.writer.docs_count() == 0 {
            return Ok(());
        }

        let writer = std::mem::take(&mut self.writer);
        self.flushed.push(writer.seal(sink)?);
        Ok(())
    }

    /// Undo every document and modification added since `mark`.
    ///
    /// Returns the number of documents rolled back.
    pub fn rollback_since(&mut self, mark: LeaseMark) -> usize {
        let mut rolled_back = 0;

        for (i, segment) in self.flushed.iter_mut().enumerate().skip(mark.flushed) {
            let start = if i == mark.flushed { mark.docs } else { 0 };
            for state in segment.docs.iter_mut().skip(start) {
                if !state.rolled_back {
                    state.rolled_back = true;
                    rolled_back += 1;
                }
            }
        }

        let first = if self.flushed.len() == mark.flushed {
            mark.docs
        } else {
            0
        };
        rolled_back += self.writer.docs_count().saturating_sub(first);
        self.writer.truncate(first as DocId + doc_limits::MIN);

        for modification in self.modifications.iter_mut().skip(mark.modifications) {
            modification.filter = None;
        }

        rolled_back
    }

    pub fn buffered_docs(&self) -> usize {
        self.writer.docs_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::DefaultCodec;
    use crate::index::document::{Field, IndexFeatures};
    use crate::index::filter::TermFilter;
    use crate::storage::memory::MemoryStorage;

    fn sink<'a>(
        storage: &'a MemoryStorage,
        codec: &'a DefaultCodec,
        counter: &'a AtomicU64,
    ) -> SegmentSink<'a> {
        SegmentSink {
            storage,
            codec,
            counter,
        }
    }

    #[test]
    fn test_insert_and_seal() {
        let storage = MemoryStorage::new_default();
        let codec = DefaultCodec::new();
        let counter = AtomicU64::new(0);
        let sink = sink(&storage, &codec, &counter);
        let limits = SegmentLimits::default();

        let mut ctx = SegmentContext::new();
        assert!(ctx
            .insert(DocState::insert(0), limits, sink, |doc| {
                doc.insert(&Field::indexed_stored("name", ["a"], "A"));
            })
            .unwrap());
        assert!(!ctx
            .insert(DocState::insert(0), limits, sink, |doc| {
                doc.index("name", IndexFeatures::NONE, ["b"]);
                doc.index("name", IndexFeatures::all(), ["b"]);
            })
            .unwrap());
        assert_eq!(ctx.buffered_docs(), 1);

        ctx.seal(sink).unwrap();
        assert_eq!(ctx.buffered_docs(), 0);
        assert_eq!(ctx.flushed.len(), 1);

        let segment = &ctx.flushed[0];
        assert_eq!(segment.meta.name, "_1");
        assert_eq!(segment.meta.docs_count, 1);
        assert_eq!(segment.meta.fields, vec!["name".to_string()]);
        assert_eq!(
            segment.reader.column_reader("name").unwrap().value(1),
            Some(&b"A"[..])
        );
        assert!(storage.file_exists("_1.cs"));
    }

    #[test]
    fn test_docs_limit_seals() {
        let storage = MemoryStorage::new_default();
        let codec = DefaultCodec::new();
        let counter = AtomicU64::new(0);
        let sink = sink(&storage, &codec, &counter);
        let limits = SegmentLimits {
            docs_max: 2,
            memory_max: 0,
        };

        let mut ctx = SegmentContext::new();
        for _ in 0..5 {
            ctx.insert(DocState::insert(0), limits, sink, |doc| {
                doc.store("v", "x");
            })
            .unwrap();
        }

        assert_eq!(ctx.flushed.len(), 2);
        assert_eq!(ctx.buffered_docs(), 1);
    }

    #[test]
    fn test_rollback_since_mark() {
        let storage = MemoryStorage::new_default();
        let codec = DefaultCodec::new();
        let counter = AtomicU64::new(0);
        let sink = sink(&storage, &codec, &counter);
        let limits = SegmentLimits {
            docs_max: 2,
            memory_max: 0,
        };

        let mut ctx = SegmentContext::new();
        ctx.insert(DocState::insert(0), limits, sink, |_| {}).unwrap();
        let mark = ctx.mark();

        for _ in 0..2 {
            ctx.insert(DocState::insert(0), limits, sink, |_| {}).unwrap();
        }
        ctx.push_modification(Arc::new(TermFilter::new("f", "x")), 0, false);

        assert_eq!(ctx.rollback_since(mark), 2);
        assert_eq!(ctx.flushed.len(), 1);
        assert!(!ctx.flushed[0].docs[0].rolled_back);
        assert!(ctx.flushed[0].docs[1].rolled_back);
        assert_eq!(ctx.buffered_docs(), 0);
        assert!(ctx.modifications[0].filter.is_none());
    }

    #[test]
    fn test_try_insert_error_discards_document() {
        let storage = MemoryStorage::new_default();
        let codec = DefaultCodec::new();
        let counter = AtomicU64::new(0);
        let sink = sink(&storage, &codec, &counter);

        let mut ctx = SegmentContext::new();
        let result = ctx.try_insert(DocState::insert(0), SegmentLimits::default(), sink, |doc| {
            doc.store("v", "x");
            Err(crate::error::TesseraError::other("boom"))
        });

        assert!(result.is_err());
        assert_eq!(ctx.buffered_docs(), 0);
    }
}
