//! Merging segments into one.
//!
//! Live documents of every input are renumbered contiguously in input order;
//! removed documents are left behind. The per-input doc maps are kept with the
//! result so removals that land on an input after the merge started can be
//! carried over to the merged segment.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::Result;
use crate::index::codec::{Codec, columns_file_name, postings_file_name};
use crate::index::column::ColumnstoreWriter;
use crate::index::iterator::DocIterator;
use crate::index::meta::{SegmentMeta, segment_name};
use crate::index::postings::PostingsBuilder;
use crate::index::segment::SegmentReader;
use crate::index::{DocId, doc_limits};
use crate::storage::{FileRef, Storage};

/// Old id to new id, indexed by old id; `0` marks a dropped document.
pub type DocMap = Vec<DocId>;

/// Output of a merge.
#[derive(Debug)]
pub struct MergedSegment {
    pub meta: SegmentMeta,
    pub reader: SegmentReader,
    /// One map per input, in input order.
    pub doc_maps: Vec<DocMap>,
    pub(crate) refs: Vec<FileRef>,
}

/// Merges a set of segment readers into a new segment.
pub struct MergeWriter<'a> {
    storage: &'a dyn Storage,
    codec: &'a dyn Codec,
    readers: Vec<SegmentReader>,
}

impl<'a> MergeWriter<'a> {
    pub fn new(storage: &'a dyn Storage, codec: &'a dyn Codec) -> Self {
        MergeWriter {
            storage,
            codec,
            readers: Vec::new(),
        }
    }

    pub fn add(&mut self, reader: SegmentReader) {
        self.readers.push(reader);
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Merge into a segment named after the next value of `counter`.
    ///
    /// `progress` is polled between columns and inputs; once it returns
    /// `false` the merge stops and `Ok(None)` is returned without anything
    /// having been written.
    pub fn merge(
        self,
        counter: &AtomicU64,
        progress: Option<&dyn Fn() -> bool>,
    ) -> Result<Option<MergedSegment>> {
        let proceed = || progress.is_none_or(|progress| progress());

        let mut doc_maps = Vec::with_capacity(self.readers.len());
        let mut next = doc_limits::MIN;
        for reader in &self.readers {
            let mut map = vec![0 as DocId; reader.docs_count() as usize + 1];
            let mut live = reader.live_docs();
            while live.next() {
                map[live.value() as usize] = next;
                next += 1;
            }
            doc_maps.push(map);
        }
        let docs_count = u64::from(next - doc_limits::MIN);

        if !proceed() {
            return Ok(None);
        }

        let mut columns = ColumnstoreWriter::new();
        for (reader, map) in self.readers.iter().zip(&doc_maps) {
            for column in reader.columns() {
                if !proceed() {
                    return Ok(None);
                }

                let name = column.name();
                column.visit(|doc, value| {
                    let mapped = map[doc as usize];
                    if mapped != 0 {
                        columns.insert(name, mapped, value);
                    }
                    true
                })?;
            }
        }

        let mut postings = PostingsBuilder::new();
        for (reader, map) in self.readers.iter().zip(&doc_maps) {
            if !proceed() {
                return Ok(None);
            }
            reader.postings_data().remap_into(map, &mut postings);
        }
        let postings = postings.build();

        if !proceed() {
            return Ok(None);
        }

        let name = segment_name(counter.fetch_add(1, Ordering::SeqCst) + 1);
        let refs = vec![
            self.storage.file_refs().add(&columns_file_name(&name)),
            self.storage.file_refs().add(&postings_file_name(&name)),
        ];

        let mut meta = SegmentMeta::new(&name, self.codec.name());
        meta.docs_count = docs_count;
        meta.live_docs_count = docs_count;
        meta.columns = columns.column_names();
        meta.fields = postings.field_names().map(str::to_string).collect();

        let columns = self.codec.write_columns(self.storage, &name, columns)?;
        let postings = self.codec.write_postings(self.storage, &name, &postings)?;
        meta.size = columns.size + postings.size;
        meta.files.insert(columns.name);
        meta.files.insert(postings.name);
        self.storage.sync(&meta.files.iter().cloned().collect::<Vec<_>>())?;

        let reader = SegmentReader::open(self.storage, self.codec, &meta)?;

        debug!(
            "merged {} segment(s) into {name} with {docs_count} document(s)",
            self.readers.len()
        );

        Ok(Some(MergedSegment {
            meta,
            reader,
            doc_maps,
            refs,
        }))
    }
}
