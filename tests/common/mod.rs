#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tessera::error::{Result, TesseraError};
use tessera::index::codec::{Codec, DefaultCodec};
use tessera::index::document::Field;
use tessera::index::reader::DirectoryReader;
use tessera::index::writer::{IndexWriter, IndexWriterConfig, OpenMode};
use tessera::storage::memory::MemoryStorage;
use tessera::storage::{FileRefs, Storage, StorageInput, StorageLock, StorageOutput};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn memory_storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new_default())
}

pub fn codec() -> Arc<dyn Codec> {
    Arc::new(DefaultCodec::new())
}

pub fn open_writer(storage: &Arc<dyn Storage>, mode: OpenMode) -> IndexWriter {
    IndexWriter::open(
        Arc::clone(storage),
        codec(),
        mode,
        IndexWriterConfig::default(),
    )
    .unwrap()
}

pub fn open_reader(storage: &Arc<dyn Storage>) -> Result<DirectoryReader> {
    DirectoryReader::open(Arc::clone(storage), codec())
}

/// Insert one document indexed and stored under `name`.
pub fn insert(writer: &IndexWriter, value: &str) {
    let mut docs = writer.documents();
    let inserted = docs
        .insert(|doc| {
            doc.insert(&Field::indexed_stored("name", [value], value.to_string()));
        })
        .unwrap();
    assert!(inserted);
}

/// Stored `name` values of the live documents of every segment, per segment.
pub fn stored_names(reader: &DirectoryReader) -> Vec<Vec<String>> {
    reader
        .iter()
        .map(|segment| {
            let column = segment.column_reader("name");
            let mut names = Vec::new();
            let mut live = segment.live_docs();
            use tessera::index::iterator::DocIterator;
            while live.next() {
                let value = column
                    .as_ref()
                    .and_then(|c| c.value(live.value()))
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                names.push(value);
            }
            names
        })
        .collect()
}

/// Memory storage whose `sync` can be switched to fail.
#[derive(Debug)]
pub struct FailingSyncStorage {
    inner: MemoryStorage,
    fail: AtomicBool,
}

impl FailingSyncStorage {
    pub fn new() -> Self {
        FailingSyncStorage {
            inner: MemoryStorage::new_default(),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Storage for FailingSyncStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.inner.create_output(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TesseraError::Io(std::io::Error::other("injected sync failure")));
        }
        self.inner.sync(names)
    }

    fn try_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        self.inner.try_lock(name)
    }

    fn file_refs(&self) -> &FileRefs {
        self.inner.file_refs()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
