//! Point-in-time view of a committed generation.
//!
//! A [`DirectoryReader`] pins the index-meta file and every segment file of
//! the generation it was opened on, so later commits and cleanups never pull
//! data out from under it. Use [`DirectoryReader::reopen`] to move to a newer
//! generation; segments that did not change are shared with the old snapshot.

use std::ops::Index;
use std::sync::Arc;

use log::{debug, trace};
use rayon::prelude::*;

use crate::error::{Result, TesseraError};
use crate::index::codec::Codec;
use crate::index::meta::IndexMeta;
use crate::index::segment::SegmentReader;
use crate::storage::{FileRef, Storage};

/// Attempts before giving up on a generation that keeps disappearing.
const MAX_OPEN_ATTEMPTS: usize = 8;

#[derive(Debug)]
struct DirectoryInner {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    file: String,
    meta: IndexMeta,
    segments: Vec<SegmentReader>,
    _meta_ref: FileRef,
}

/// Immutable snapshot of one committed generation.
///
/// Cloning is cheap; clones share the same snapshot.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tessera::index::codec::DefaultCodec;
/// use tessera::index::reader::DirectoryReader;
/// use tessera::storage::memory::MemoryStorage;
///
/// let storage = Arc::new(MemoryStorage::new_default());
/// let codec = Arc::new(DefaultCodec::new());
///
/// // Nothing was committed yet.
/// let err = DirectoryReader::open(storage, codec).unwrap_err();
/// assert!(err.is_not_found());
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryReader {
    inner: Arc<DirectoryInner>,
}

impl DirectoryReader {
    /// Open the latest committed generation.
    ///
    /// Fails with [`TesseraError::IndexNotFound`] if nothing was committed.
    pub fn open(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Result<Self> {
        Self::open_latest(storage, codec, None)
    }

    /// Snapshot of the latest generation, or `self` if nothing newer was
    /// committed.
    pub fn reopen(&self) -> Result<Self> {
        let inner = &self.inner;
        let latest = inner.codec.last_segments_file(&*inner.storage)?;
        if latest.as_deref() == Some(inner.file.as_str()) {
            return Ok(self.clone());
        }

        Self::open_latest(
            Arc::clone(&inner.storage),
            Arc::clone(&inner.codec),
            Some(inner),
        )
    }

    fn open_latest(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        previous: Option<&DirectoryInner>,
    ) -> Result<Self> {
        let mut attempt = 0;

        loop {
            let file = codec
                .last_segments_file(&*storage)?
                .ok_or_else(|| TesseraError::index_not_found("no committed generation"))?;
            // Pin before reading so a concurrent cleanup keeps it.
            let meta_ref = storage.file_refs().add(&file);

            match Self::load(&*storage, &*codec, &file, previous) {
                Ok((meta, segments)) => {
                    debug!(
                        "opened generation {} with {} segment(s)",
                        meta.generation,
                        segments.len()
                    );
                    return Ok(DirectoryReader {
                        inner: Arc::new(DirectoryInner {
                            storage,
                            codec,
                            file,
                            meta,
                            segments,
                            _meta_ref: meta_ref,
                        }),
                    });
                }
                Err(e) if e.is_not_found() && attempt + 1 < MAX_OPEN_ATTEMPTS => {
                    // A newer commit may have swept the generation we picked.
                    let latest = codec.last_segments_file(&*storage)?;
                    if latest.as_deref() == Some(file.as_str()) {
                        return Err(e);
                    }
                    trace!("{file} vanished while opening, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn load(
        storage: &dyn Storage,
        codec: &dyn Codec,
        file: &str,
        previous: Option<&DirectoryInner>,
    ) -> Result<(IndexMeta, Vec<SegmentReader>)> {
        let meta = codec.read_index_meta(storage, file)?;

        let segments = meta
            .segments
            .par_iter()
            .map(|segment| {
                let reused = previous.and_then(|prev| {
                    prev.segments.iter().find(|r| r.name() == segment.name)
                });
                match reused {
                    Some(reader) => reader.reopen(storage, codec, segment),
                    None => SegmentReader::open(storage, codec, segment),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((meta, segments))
    }

    /// Number of segments.
    pub fn size(&self) -> usize {
        self.inner.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.segments.is_empty()
    }

    /// Documents in all segments, removed ones included.
    pub fn docs_count(&self) -> u64 {
        self.inner.segments.iter().map(SegmentReader::docs_count).sum()
    }

    pub fn live_docs_count(&self) -> u64 {
        self.inner
            .segments
            .iter()
            .map(SegmentReader::live_docs_count)
            .sum()
    }

    pub fn segment(&self, index: usize) -> Option<&SegmentReader> {
        self.inner.segments.get(index)
    }

    pub fn segments(&self) -> &[SegmentReader] {
        &self.inner.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SegmentReader> {
        self.inner.segments.iter()
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.inner.meta
    }

    pub fn generation(&self) -> u64 {
        self.inner.meta.generation
    }

    /// Name of the index-meta file this snapshot was read from.
    pub fn file_name(&self) -> &str {
        &self.inner.file
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.inner.meta.payload.as_deref()
    }
}

impl Index<usize> for DirectoryReader {
    type Output = SegmentReader;

    fn index(&self, index: usize) -> &SegmentReader {
        &self.inner.segments[index]
    }
}

impl<'a> IntoIterator for &'a DirectoryReader {
    type Item = &'a SegmentReader;
    type IntoIter = std::slice::Iter<'a, SegmentReader>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::DefaultCodec;
    use crate::index::column::ColumnstoreWriter;
    use crate::index::meta::SegmentMeta;
    use crate::index::postings::Postings;
    use crate::storage::memory::MemoryStorage;

    fn write_generation(
        storage: &dyn Storage,
        codec: &dyn Codec,
        generation: u64,
        names: &[&str],
    ) -> IndexMeta {
        let mut meta = IndexMeta::new();
        meta.generation = generation;

        for name in names {
            let mut columns = ColumnstoreWriter::new();
            columns.insert("v", 1, name.as_bytes());

            let mut segment = SegmentMeta::new(*name, codec.name());
            segment.docs_count = 1;
            segment.live_docs_count = 1;
            let columns = codec.write_columns(storage, name, columns).unwrap();
            let postings = codec.write_postings(storage, name, &Postings::new()).unwrap();
            segment.files.insert(columns.name);
            segment.files.insert(postings.name);
            meta.segments.push(segment);
        }

        codec.write_index_meta(storage, &meta).unwrap();
        codec.commit_index_meta(storage, &meta).unwrap();
        meta
    }

    #[test]
    fn test_open_latest_generation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());

        write_generation(&*storage, &*codec, 1, &["_1"]);
        write_generation(&*storage, &*codec, 2, &["_1", "_2"]);

        let reader = DirectoryReader::open(Arc::clone(&storage), Arc::clone(&codec)).unwrap();
        assert_eq!(reader.generation(), 2);
        assert_eq!(reader.size(), 2);
        assert_eq!(reader.docs_count(), 2);
        assert_eq!(reader[1].name(), "_2");
        assert_eq!(reader.file_name(), "segments_2");
    }

    #[test]
    fn test_reopen_shares_unchanged_snapshot() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());
        write_generation(&*storage, &*codec, 1, &["_1"]);

        let reader = DirectoryReader::open(Arc::clone(&storage), Arc::clone(&codec)).unwrap();
        let same = reader.reopen().unwrap();
        assert!(Arc::ptr_eq(&reader.inner, &same.inner));

        write_generation(&*storage, &*codec, 2, &["_1", "_2"]);
        let newer = reader.reopen().unwrap();
        assert_eq!(newer.size(), 2);
        assert_eq!(reader.size(), 1);
    }

    #[test]
    fn test_snapshot_pins_its_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());
        write_generation(&*storage, &*codec, 1, &["_1"]);

        let reader = DirectoryReader::open(Arc::clone(&storage), Arc::clone(&codec)).unwrap();
        crate::storage::remove_unreferenced(&*storage).unwrap();

        assert!(storage.file_exists("segments_1"));
        assert!(storage.file_exists("_1.cs"));
        assert_eq!(
            reader[0].column_reader("v").unwrap().value(1),
            Some(&b"_1"[..])
        );

        drop(reader);
        crate::storage::remove_unreferenced(&*storage).unwrap();
        assert!(!storage.file_exists("segments_1"));
    }
}
