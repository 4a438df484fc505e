//! Read access to one immutable segment version.

use std::sync::Arc;

use log::trace;

use crate::error::{Result, TesseraError};
use crate::index::codec::{Codec, columns_file_name, postings_file_name};
use crate::index::column::{ColumnReader, ColumnstoreReader};
use crate::index::iterator::{DocIterator, MaskedDocIterator, RangeDocIterator, SortedDocIterator};
use crate::index::mask::{DocumentMask, LiveDocs};
use crate::index::meta::SegmentMeta;
use crate::index::postings::Postings;
use crate::index::{DocId, doc_limits};
use crate::storage::{FileRef, Storage};

#[derive(Debug)]
struct SegmentInner {
    meta: SegmentMeta,
    columns: ColumnstoreReader,
    postings: Arc<Postings>,
    mask: Arc<DocumentMask>,
    live: Arc<LiveDocs>,
    // Keeps the backing files from being swept while this reader lives.
    _refs: Vec<FileRef>,
}

/// Immutable view of one segment version. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    inner: Arc<SegmentInner>,
}

impl SegmentReader {
    /// Open the segment described by `meta`.
    pub fn open(storage: &dyn Storage, codec: &dyn Codec, meta: &SegmentMeta) -> Result<Self> {
        let refs = storage.file_refs().add_all(&meta.files);

        let columns_file = columns_file_name(&meta.name);
        let columns = if meta.files.contains(&columns_file) {
            codec.read_columns(storage, &columns_file)?
        } else {
            ColumnstoreReader::empty()
        };

        let postings_file = postings_file_name(&meta.name);
        let postings = if meta.files.contains(&postings_file) {
            codec.read_postings(storage, &postings_file)?
        } else {
            Postings::new()
        };

        let mask = Self::read_mask(storage, codec, meta)?;

        trace!("opened segment {} v{}", meta.name, meta.version);
        Self::from_parts(meta.clone(), columns, Arc::new(postings), mask, refs)
    }

    /// Open a newer version of this segment, sharing columns and postings
    /// when only the document mask changed.
    pub fn reopen(
        &self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        meta: &SegmentMeta,
    ) -> Result<Self> {
        let current = &self.inner.meta;
        if current.same_version(meta) {
            return Ok(self.clone());
        }

        if current.name != meta.name || current.docs_count != meta.docs_count {
            return Self::open(storage, codec, meta);
        }

        let refs = storage.file_refs().add_all(&meta.files);
        let mask = Self::read_mask(storage, codec, meta)?;

        trace!(
            "reopened segment {} v{} -> v{}",
            meta.name, current.version, meta.version
        );
        Self::from_parts(
            meta.clone(),
            self.inner.columns.clone(),
            Arc::clone(&self.inner.postings),
            mask,
            refs,
        )
    }

    fn read_mask(
        storage: &dyn Storage,
        codec: &dyn Codec,
        meta: &SegmentMeta,
    ) -> Result<DocumentMask> {
        match &meta.doc_mask {
            Some(file) => codec.read_doc_mask(storage, file),
            None => Ok(DocumentMask::new()),
        }
    }

    pub(crate) fn from_parts(
        meta: SegmentMeta,
        columns: ColumnstoreReader,
        postings: Arc<Postings>,
        mask: DocumentMask,
        refs: Vec<FileRef>,
    ) -> Result<Self> {
        let docs_count = DocId::try_from(meta.docs_count)
            .map_err(|_| TesseraError::codec(format!("segment {} is too large", meta.name)))?;
        let live = LiveDocs::new(docs_count, &mask);

        if live.count() as u64 != meta.live_docs_count {
            return Err(TesseraError::codec(format!(
                "segment {} v{}: mask leaves {} live documents, meta says {}",
                meta.name,
                meta.version,
                live.count(),
                meta.live_docs_count
            )));
        }

        Ok(SegmentReader {
            inner: Arc::new(SegmentInner {
                meta,
                columns,
                postings,
                mask: Arc::new(mask),
                live: Arc::new(live),
                _refs: refs,
            }),
        })
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.inner.meta
    }

    pub fn name(&self) -> &str {
        &self.inner.meta.name
    }

    pub fn docs_count(&self) -> u64 {
        self.inner.meta.docs_count
    }

    pub fn live_docs_count(&self) -> u64 {
        self.inner.meta.live_docs_count
    }

    pub fn is_live(&self, doc: DocId) -> bool {
        self.inner.live.is_live(doc)
    }

    /// Removed documents of this version.
    pub fn docs_mask(&self) -> &DocumentMask {
        &self.inner.mask
    }

    /// Every document, removed or not.
    pub fn docs_iterator(&self) -> RangeDocIterator {
        RangeDocIterator::new(self.max_doc(), None)
    }

    /// Live documents only.
    pub fn live_docs(&self) -> RangeDocIterator {
        RangeDocIterator::new(self.max_doc(), Some(Arc::clone(&self.inner.live)))
    }

    /// Restrict `docs` to live documents.
    pub fn mask<I: DocIterator>(&self, docs: I) -> MaskedDocIterator<I> {
        MaskedDocIterator::new(docs, Arc::clone(&self.inner.live))
    }

    pub fn column_reader(&self, name: &str) -> Option<ColumnReader> {
        self.inner.columns.column(name)
    }

    pub fn column_reader_by_id(&self, id: usize) -> Option<ColumnReader> {
        self.inner.columns.column_by_id(id)
    }

    pub fn columns(&self) -> impl Iterator<Item = ColumnReader> + '_ {
        self.inner.columns.columns()
    }

    /// Indexed field names in ascending order.
    pub fn fields(&self) -> impl Iterator<Item = &str> + '_ {
        self.inner.postings.field_names()
    }

    /// Raw postings of `field:term`, removed documents included.
    pub fn postings(&self, field: &str, term: &[u8]) -> SortedDocIterator {
        self.inner.postings.iterator(field, term)
    }

    pub(crate) fn postings_data(&self) -> &Postings {
        &self.inner.postings
    }

    fn max_doc(&self) -> DocId {
        // Checked in from_parts.
        self.inner.meta.docs_count as DocId
    }

    /// Whether the document lies inside this segment's id range.
    pub fn contains(&self, doc: DocId) -> bool {
        doc >= doc_limits::MIN && doc <= self.max_doc()
    }
}
