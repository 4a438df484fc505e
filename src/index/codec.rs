//! Pluggable on-disk formats.
//!
//! The writer and readers never touch file contents directly; everything
//! persisted goes through a [`Codec`]. Index-meta files are written in two
//! phases: [`Codec::write_index_meta`] produces `pending_segments_<gen>` and
//! [`Codec::commit_index_meta`] atomically renames it to `segments_<gen>`.

use std::fmt;
use std::io::Write;

use log::debug;

use crate::error::{Result, TesseraError};
use crate::index::column::{ColumnstoreReader, ColumnstoreWriter};
use crate::index::mask::DocumentMask;
use crate::index::meta::{IndexMeta, parse_generation};
use crate::index::postings::Postings;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter, verify_footer};

const DOC_MASK_MAGIC: u32 = 0x5453_444d;

pub fn columns_file_name(segment: &str) -> String {
    format!("{segment}.cs")
}

pub fn postings_file_name(segment: &str) -> String {
    format!("{segment}.pst")
}

pub fn doc_mask_file_name(segment: &str, version: u64) -> String {
    format!("{segment}.{version}.dm")
}

/// A written file and its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub name: String,
    pub size: u64,
}

/// Encoding of index metadata and segment payloads.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Format identifier recorded in every segment written with this codec.
    fn name(&self) -> &str;

    /// Write `meta` as the pending file of its generation and return the file name.
    fn write_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<String>;

    /// Publish the pending file of `meta` and make it durable. Returns the
    /// committed file name.
    fn commit_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<String>;

    /// Discard the pending file of `meta`, if any.
    fn rollback_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<()>;

    fn read_index_meta(&self, storage: &dyn Storage, file_name: &str) -> Result<IndexMeta>;

    /// Committed index-meta file with the highest generation.
    fn last_segments_file(&self, storage: &dyn Storage) -> Result<Option<String>>;

    fn write_columns(
        &self,
        storage: &dyn Storage,
        segment: &str,
        columns: ColumnstoreWriter,
    ) -> Result<WrittenFile>;

    fn read_columns(&self, storage: &dyn Storage, file_name: &str) -> Result<ColumnstoreReader>;

    fn write_postings(
        &self,
        storage: &dyn Storage,
        segment: &str,
        postings: &Postings,
    ) -> Result<WrittenFile>;

    fn read_postings(&self, storage: &dyn Storage, file_name: &str) -> Result<Postings>;

    fn write_doc_mask(
        &self,
        storage: &dyn Storage,
        segment: &str,
        version: u64,
        mask: &DocumentMask,
    ) -> Result<WrittenFile>;

    fn read_doc_mask(&self, storage: &dyn Storage, file_name: &str) -> Result<DocumentMask>;
}

/// The default format: JSON index meta, binary columnstore, bincode postings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl DefaultCodec {
    pub const NAME: &'static str = "1.0";

    pub fn new() -> Self {
        DefaultCodec
    }

    fn write_file(&self, storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<WrittenFile> {
        let mut output = storage.create_output(name)?;
        output.write_all(bytes)?;
        output.close()?;

        Ok(WrittenFile {
            name: name.to_string(),
            size: bytes.len() as u64,
        })
    }

    fn read_file(&self, storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
        let mut input = storage.open_input(name)?;
        let bytes = input.read_all()?;
        input.close()?;
        Ok(bytes)
    }
}

impl Codec for DefaultCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn write_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<String> {
        let name = meta.pending_segments_file_name();
        let bytes = serde_json::to_vec(meta)?;
        self.write_file(storage, &name, &bytes)?;
        Ok(name)
    }

    fn commit_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<String> {
        let pending = meta.pending_segments_file_name();
        let committed = meta.segments_file_name();

        storage.rename_file(&pending, &committed)?;
        storage.sync(std::slice::from_ref(&committed))?;

        debug!("published {committed}");
        Ok(committed)
    }

    fn rollback_index_meta(&self, storage: &dyn Storage, meta: &IndexMeta) -> Result<()> {
        let pending = meta.pending_segments_file_name();
        if storage.file_exists(&pending) {
            storage.delete_file(&pending)?;
        }
        Ok(())
    }

    fn read_index_meta(&self, storage: &dyn Storage, file_name: &str) -> Result<IndexMeta> {
        let bytes = self.read_file(storage, file_name)?;
        let meta: IndexMeta = serde_json::from_slice(&bytes)?;

        if parse_generation(file_name).is_some_and(|generation| generation != meta.generation) {
            return Err(TesseraError::codec(format!(
                "{file_name} holds generation {}",
                meta.generation
            )));
        }

        Ok(meta)
    }

    fn last_segments_file(&self, storage: &dyn Storage) -> Result<Option<String>> {
        let last = storage
            .list_files()?
            .into_iter()
            .filter_map(|name| parse_generation(&name).map(|generation| (generation, name)))
            .max_by_key(|(generation, _)| *generation)
            .map(|(_, name)| name);

        Ok(last)
    }

    fn write_columns(
        &self,
        storage: &dyn Storage,
        segment: &str,
        columns: ColumnstoreWriter,
    ) -> Result<WrittenFile> {
        let bytes = columns.finish()?;
        self.write_file(storage, &columns_file_name(segment), &bytes)
    }

    fn read_columns(&self, storage: &dyn Storage, file_name: &str) -> Result<ColumnstoreReader> {
        ColumnstoreReader::from_bytes(self.read_file(storage, file_name)?)
    }

    fn write_postings(
        &self,
        storage: &dyn Storage,
        segment: &str,
        postings: &Postings,
    ) -> Result<WrittenFile> {
        let bytes = bincode::serialize(postings)?;
        self.write_file(storage, &postings_file_name(segment), &bytes)
    }

    fn read_postings(&self, storage: &dyn Storage, file_name: &str) -> Result<Postings> {
        let bytes = self.read_file(storage, file_name)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn write_doc_mask(
        &self,
        storage: &dyn Storage,
        segment: &str,
        version: u64,
        mask: &DocumentMask,
    ) -> Result<WrittenFile> {
        let mut writer = StructWriter::new(Vec::new());
        writer.write_u32(DOC_MASK_MAGIC)?;
        writer.write_delta_compressed_u32s(&mask.to_vec())?;
        let bytes = writer.finish()?;

        self.write_file(storage, &doc_mask_file_name(segment, version), &bytes)
    }

    fn read_doc_mask(&self, storage: &dyn Storage, file_name: &str) -> Result<DocumentMask> {
        let bytes = self.read_file(storage, file_name)?;
        let payload = verify_footer(&bytes)?;

        let mut reader = StructReader::new(payload);
        if reader.read_u32()? != DOC_MASK_MAGIC {
            return Err(TesseraError::codec(format!("{file_name} is not a document mask")));
        }

        Ok(reader.read_delta_compressed_u32s()?.into_iter().collect())
    }
}
