//! Columnar stored-value store of a segment.
//!
//! Each column maps document ids to byte values. A column whose values are
//! all empty is a *mask* column: it only records presence.
//!
//! # Format
//!
//! ```text
//! header:  magic u32 | version u8 | column count (varint)
//!          per column: name | kind u8 | docs count | block count
//!                      per block: first doc u32 | offset | length
//! data:    blocks of up to BLOCK_SIZE entries:
//!          count | doc deltas | value lengths (value columns) | raw bytes
//! footer:  crc32
//! ```
//!
//! Raw value bytes are stored verbatim, so every accessor hands out slices of
//! the one shared file buffer. The per-column decode cache is a sorted index
//! of `(doc, byte range)` built once on first visitation and shared by every
//! reader of the segment.

use std::ops::Range;
use std::sync::Arc;

use ahash::AHashMap;
use log::trace;
use once_cell::sync::OnceCell;

use crate::error::{Result, TesseraError};
use crate::index::iterator::DocIterator;
use crate::index::{DocId, doc_limits};
use crate::storage::structured::{StructReader, StructWriter, verify_footer};
use crate::util::varint;

const MAGIC: u32 = 0x5453_4353;
const FORMAT_VERSION: u8 = 1;

const KIND_VALUES: u8 = 0;
const KIND_MASK: u8 = 1;

/// Maximum number of entries per block.
pub const BLOCK_SIZE: usize = 64;

#[derive(Debug, Default)]
struct ColumnBuilder {
    name: String,
    docs: Vec<DocId>,
    ends: Vec<usize>,
    data: Vec<u8>,
}

impl ColumnBuilder {
    fn push(&mut self, doc: DocId, value: &[u8]) {
        self.data.extend_from_slice(value);

        if self.docs.last() == Some(&doc) {
            if let Some(end) = self.ends.last_mut() {
                *end = self.data.len();
            }
            return;
        }

        self.docs.push(doc);
        self.ends.push(self.data.len());
    }

    fn truncate(&mut self, first: DocId) {
        let keep = self.docs.partition_point(|&d| d < first);
        self.docs.truncate(keep);
        self.ends.truncate(keep);
        self.data.truncate(self.ends.last().copied().unwrap_or(0));
    }

    fn start(&self, entry: usize) -> usize {
        if entry == 0 { 0 } else { self.ends[entry - 1] }
    }
}

/// Buffers stored values of one segment and serializes them.
#[derive(Debug, Default)]
pub struct ColumnstoreWriter {
    columns: Vec<ColumnBuilder>,
    by_name: AHashMap<String, usize>,
}

impl ColumnstoreWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` to column `name` for `doc`.
    ///
    /// Documents must arrive in ascending order per column; writing the same
    /// document twice concatenates the values.
    pub fn insert(&mut self, name: &str, doc: DocId, value: &[u8]) {
        let id = match self.by_name.get(name) {
            Some(&id) => id,
            None => {
                let id = self.columns.len();
                self.columns.push(ColumnBuilder {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.by_name.insert(name.to_string(), id);
                id
            }
        };

        self.columns[id].push(doc, value);
    }

    /// Drop every value of documents `>= first`.
    pub fn truncate(&mut self, first: DocId) {
        for column in &mut self.columns {
            column.truncate(first);
        }
    }

    /// Names of the non-empty columns, in the id order [`finish`](Self::finish) assigns.
    pub fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.docs.is_empty())
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|c| c.docs.is_empty())
    }

    /// Approximate heap usage.
    pub fn memory(&self) -> usize {
        self.columns
            .iter()
            .map(|c| {
                c.name.len()
                    + c.data.len()
                    + c.docs.len() * (std::mem::size_of::<DocId>() + std::mem::size_of::<usize>())
            })
            .sum()
    }

    /// Serialize every non-empty column.
    pub fn finish(self) -> Result<Vec<u8>> {
        let columns: Vec<ColumnBuilder> = self
            .columns
            .into_iter()
            .filter(|c| !c.docs.is_empty())
            .collect();

        let mut data = Vec::new();
        let mut headers = Vec::with_capacity(columns.len());

        for column in &columns {
            let mask = column.data.is_empty();
            let mut blocks = Vec::with_capacity(column.docs.len().div_ceil(BLOCK_SIZE));

            for (chunk, docs) in column.docs.chunks(BLOCK_SIZE).enumerate() {
                let first_entry = chunk * BLOCK_SIZE;
                let offset = data.len();

                varint::encode_u64_into(docs.len() as u64, &mut data);
                let mut previous = 0;
                for &doc in docs {
                    varint::encode_u64_into(u64::from(doc - previous), &mut data);
                    previous = doc;
                }

                if !mask {
                    let block_start = column.start(first_entry);
                    let mut start = block_start;
                    for entry in first_entry..first_entry + docs.len() {
                        let end = column.ends[entry];
                        varint::encode_u64_into((end - start) as u64, &mut data);
                        start = end;
                    }
                    data.extend_from_slice(&column.data[block_start..start]);
                }

                blocks.push(BlockRef {
                    first_doc: docs[0],
                    offset: offset as u64,
                    length: (data.len() - offset) as u64,
                });
            }

            headers.push((column.name.as_str(), mask, column.docs.len(), blocks));
        }

        let mut writer = StructWriter::new(Vec::with_capacity(data.len() + 64));
        writer.write_u32(MAGIC)?;
        writer.write_u8(FORMAT_VERSION)?;
        writer.write_varint(headers.len() as u64)?;

        for (name, mask, docs_count, blocks) in &headers {
            writer.write_string(name)?;
            writer.write_u8(if *mask { KIND_MASK } else { KIND_VALUES })?;
            writer.write_varint(*docs_count as u64)?;
            writer.write_varint(blocks.len() as u64)?;
            for block in blocks {
                writer.write_u32(block.first_doc)?;
                writer.write_varint(block.offset)?;
                writer.write_varint(block.length)?;
            }
        }

        writer.write_raw(&data)?;
        writer.finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockRef {
    first_doc: DocId,
    offset: u64,
    length: u64,
}

#[derive(Debug)]
struct ColumnHeader {
    name: String,
    mask: bool,
    docs_count: usize,
    blocks: Vec<BlockRef>,
}

/// Decoded `(doc, byte range)` index of one column.
#[derive(Debug, Default)]
struct ColumnCache {
    docs: Vec<DocId>,
    ranges: Vec<Range<usize>>,
}

#[derive(Debug)]
struct Columnstore {
    buffer: Arc<[u8]>,
    data_start: usize,
    columns: Vec<ColumnHeader>,
    by_name: AHashMap<String, usize>,
    caches: Vec<OnceCell<Arc<ColumnCache>>>,
}

impl Columnstore {
    /// Walk one block, yielding absolute byte ranges into `buffer`.
    fn decode_block<F>(&self, column: usize, block: usize, mut f: F) -> Result<bool>
    where
        F: FnMut(DocId, Range<usize>) -> bool,
    {
        let header = &self.columns[column];
        let block_ref = header.blocks[block];
        let base = self.data_start + block_ref.offset as usize;
        let bytes = &self.buffer[base..base + block_ref.length as usize];

        let (count, mut pos) = varint::decode_u64(bytes)?;
        let count = count as usize;
        if count > BLOCK_SIZE {
            return Err(TesseraError::codec(format!(
                "column '{}': block of {count} entries",
                header.name
            )));
        }

        let mut docs = [0 as DocId; BLOCK_SIZE];
        let mut previous: DocId = 0;
        for slot in docs.iter_mut().take(count) {
            let (delta, n) = varint::decode_u32(&bytes[pos..])?;
            pos += n;
            previous = previous
                .checked_add(delta)
                .ok_or_else(|| TesseraError::codec("column doc id overflow"))?;
            *slot = previous;
        }

        if header.mask {
            for &doc in &docs[..count] {
                if !f(doc, base..base) {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let mut lengths = [0usize; BLOCK_SIZE];
        for slot in lengths.iter_mut().take(count) {
            let (length, n) = varint::decode_u64(&bytes[pos..])?;
            pos += n;
            *slot = length as usize;
        }

        let mut start = pos;
        for (&doc, &length) in docs[..count].iter().zip(&lengths[..count]) {
            let end = start + length;
            if end > bytes.len() {
                return Err(TesseraError::codec(format!(
                    "column '{}': value of doc {doc} overruns its block",
                    header.name
                )));
            }
            if !f(doc, base + start..base + end) {
                return Ok(false);
            }
            start = end;
        }

        Ok(true)
    }

    fn build_cache(&self, column: usize) -> Result<ColumnCache> {
        let header = &self.columns[column];
        let mut cache = ColumnCache {
            docs: Vec::with_capacity(header.docs_count),
            ranges: Vec::with_capacity(header.docs_count),
        };

        for block in 0..header.blocks.len() {
            self.decode_block(column, block, |doc, range| {
                cache.docs.push(doc);
                cache.ranges.push(range);
                true
            })?;
        }

        trace!(
            "built decode cache for column '{}' ({} entries)",
            header.name,
            cache.docs.len()
        );

        Ok(cache)
    }

    fn cache(&self, column: usize) -> Result<Arc<ColumnCache>> {
        self.caches[column]
            .get_or_try_init(|| self.build_cache(column).map(Arc::new))
            .cloned()
    }
}

/// Read-only columnstore of one segment. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ColumnstoreReader {
    store: Arc<Columnstore>,
}

impl ColumnstoreReader {
    /// Parse a serialized columnstore, verifying its checksum and the
    /// structure of every block.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let payload_len = verify_footer(&bytes)?.len();
        let buffer: Arc<[u8]> = bytes.into();

        let mut reader = StructReader::new(&buffer[..payload_len]);
        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(TesseraError::codec(format!(
                "not a columnstore (magic {magic:#010x})"
            )));
        }
        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(TesseraError::codec(format!(
                "unsupported columnstore version {version}"
            )));
        }

        let count = reader.read_varint()? as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.read_string()?;
            let mask = match reader.read_u8()? {
                KIND_VALUES => false,
                KIND_MASK => true,
                kind => {
                    return Err(TesseraError::codec(format!(
                        "column '{name}': unknown kind {kind}"
                    )));
                }
            };
            let docs_count = reader.read_varint()? as usize;
            let block_count = reader.read_varint()? as usize;

            let mut blocks = Vec::with_capacity(block_count);
            for _ in 0..block_count {
                blocks.push(BlockRef {
                    first_doc: reader.read_u32()?,
                    offset: reader.read_varint()?,
                    length: reader.read_varint()?,
                });
            }

            columns.push(ColumnHeader {
                name,
                mask,
                docs_count,
                blocks,
            });
        }

        let data_start = reader.position() as usize;
        let data_len = payload_len - data_start;
        for column in &columns {
            for block in &column.blocks {
                if block.offset + block.length > data_len as u64 {
                    return Err(TesseraError::codec(format!(
                        "column '{}': block out of bounds",
                        column.name
                    )));
                }
            }
        }

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(id, c)| (c.name.clone(), id))
            .collect();
        let caches = columns.iter().map(|_| OnceCell::new()).collect();

        let store = Columnstore {
            buffer,
            data_start,
            columns,
            by_name,
            caches,
        };
        for (column, header) in store.columns.iter().enumerate() {
            for block in 0..header.blocks.len() {
                store.decode_block(column, block, |_, _| true)?;
            }
        }

        Ok(ColumnstoreReader {
            store: Arc::new(store),
        })
    }

    /// An empty store, for segments without stored values.
    pub fn empty() -> Self {
        ColumnstoreReader {
            store: Arc::new(Columnstore {
                buffer: Arc::from(Vec::new()),
                data_start: 0,
                columns: Vec::new(),
                by_name: AHashMap::new(),
                caches: Vec::new(),
            }),
        }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.store.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.columns.is_empty()
    }

    /// Column by name; `None` if the segment never stored it.
    pub fn column(&self, name: &str) -> Option<ColumnReader> {
        self.store.by_name.get(name).map(|&id| ColumnReader {
            store: Arc::clone(&self.store),
            id,
        })
    }

    pub fn column_by_id(&self, id: usize) -> Option<ColumnReader> {
        (id < self.store.columns.len()).then(|| ColumnReader {
            store: Arc::clone(&self.store),
            id,
        })
    }

    /// Every column in id order.
    pub fn columns(&self) -> impl Iterator<Item = ColumnReader> + '_ {
        (0..self.store.columns.len()).map(|id| ColumnReader {
            store: Arc::clone(&self.store),
            id,
        })
    }
}

/// Accessor over one column.
#[derive(Debug, Clone)]
pub struct ColumnReader {
    store: Arc<Columnstore>,
    id: usize,
}

impl ColumnReader {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.store.columns[self.id].name
    }

    /// Number of documents with a value.
    pub fn size(&self) -> usize {
        self.store.columns[self.id].docs_count
    }

    /// Whether this column only records presence.
    pub fn is_mask(&self) -> bool {
        self.store.columns[self.id].mask
    }

    /// Random-access lookup function.
    ///
    /// Served from the decode cache when it was already built, otherwise by
    /// decoding the single block that may hold the document.
    pub fn values<'a>(&'a self) -> impl Fn(DocId) -> Option<&'a [u8]> + 'a {
        move |doc| self.value(doc)
    }

    /// Value of `doc`; `Some(&[])` for a present document in a mask column.
    ///
    /// Lookups cannot fail: every block was decoded once by
    /// [`ColumnstoreReader::from_bytes`].
    pub fn value(&self, doc: DocId) -> Option<&[u8]> {
        let store = &*self.store;

        if let Some(cache) = store.caches[self.id].get() {
            let idx = cache.docs.binary_search(&doc).ok()?;
            return Some(&store.buffer[cache.ranges[idx].clone()]);
        }

        let header = &store.columns[self.id];
        let block = header
            .blocks
            .partition_point(|b| b.first_doc <= doc)
            .checked_sub(1)?;

        let mut found = None;
        store
            .decode_block(self.id, block, |d, range| {
                if d == doc {
                    found = Some(range);
                    return false;
                }
                d < doc
            })
            .ok()?;
        found.map(|range| &store.buffer[range])
    }

    /// Call `f` for every `(doc, value)` in ascending order until it returns
    /// `false`. Returns `false` if visitation stopped early.
    pub fn visit<F>(&self, mut f: F) -> Result<bool>
    where
        F: FnMut(DocId, &[u8]) -> bool,
    {
        let cache = self.store.cache(self.id)?;
        for (&doc, range) in cache.docs.iter().zip(&cache.ranges) {
            if !f(doc, &self.store.buffer[range.clone()]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A fresh iterator positioned before the first document.
    pub fn iterator(&self) -> Result<ColumnIterator> {
        let cache = self.store.cache(self.id)?;
        Ok(ColumnIterator {
            store: Arc::clone(&self.store),
            mask: self.is_mask(),
            cache,
            next: 0,
            current: doc_limits::INVALID,
        })
    }
}

/// Forward iterator over a column with access to the current payload.
#[derive(Debug, Clone)]
pub struct ColumnIterator {
    store: Arc<Columnstore>,
    cache: Arc<ColumnCache>,
    mask: bool,
    next: usize,
    current: DocId,
}

impl ColumnIterator {
    /// Value at the current position; `None` for mask columns or when not
    /// positioned on a document.
    pub fn payload(&self) -> Option<&[u8]> {
        if self.mask || !doc_limits::valid(self.current) || doc_limits::eof(self.current) {
            return None;
        }
        let range = self.cache.ranges.get(self.next.checked_sub(1)?)?;
        Some(&self.store.buffer[range.clone()])
    }

    /// Total number of entries.
    pub fn cost(&self) -> usize {
        self.cache.docs.len()
    }
}

impl DocIterator for ColumnIterator {
    fn value(&self) -> DocId {
        self.current
    }

    fn next(&mut self) -> bool {
        match self.cache.docs.get(self.next) {
            Some(&doc) => {
                self.next += 1;
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

        self.next += self.cache.docs[self.next..].partition_point(|&doc| doc < target);
        self.next();
        self.current
    }
}
