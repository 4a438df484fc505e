//! Storage abstraction layer for Tessera.
//!
//! The index engine never touches a file system directly. Everything it
//! persists goes through the [`Storage`] trait, a flat namespace of named files
//! with create/open/remove/exists/list/sync/lock primitives. File and memory
//! backends can be swapped without touching the writer or the readers.
//!
//! # Architecture
//!
//! - **Storage trait**: Unified interface for all storage backends
//! - **StorageConfig enum**: Type-safe configuration for supported backends
//! - **StorageFactory**: Helper for constructing concrete storage instances
//! - **FileRefs**: Per-storage reference tracking of index files; see
//!   [`remove_unreferenced`] for the sweep that reclaims dead files
//!
//! # Example
//!
//! ```
//! use tessera::storage::{StorageConfig, StorageFactory};
//! use tessera::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! assert!(!storage.file_exists("segments_1"));
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Result, TesseraError};

pub mod file;
pub mod memory;
pub mod refs;
pub mod structured;

pub use refs::{FileRef, FileRefs};

/// A trait for storage backends that can store and retrieve data.
///
/// This provides a pluggable interface for different storage implementations
/// like file system or memory.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    ///
    /// The file must exist, or this will return [`TesseraError::FileNotFound`].
    ///
    /// # Example
    ///
    /// ```
    /// use tessera::storage::memory::{MemoryStorage, MemoryStorageConfig};
    /// use tessera::storage::Storage;
    /// use std::io::Write;
    ///
    /// # fn main() -> tessera::error::Result<()> {
    /// let storage = MemoryStorage::new(MemoryStorageConfig::default());
    ///
    /// let mut output = storage.create_output("_1.cs")?;
    /// output.write_all(b"test data")?;
    /// output.close()?;
    ///
    /// let mut input = storage.open_input("_1.cs")?;
    /// assert_eq!(input.read_all()?, b"test data");
    /// # Ok(())
    /// # }
    /// ```
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing.
    ///
    /// Creates a new file or truncates an existing one. The content becomes
    /// visible to readers once the output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file succeeds.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file, replacing the destination if it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Durably persist the named files.
    ///
    /// Returns only after the content of every listed file (and the directory
    /// entry pointing at it) survives a crash.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Try to take the named exclusive lock.
    ///
    /// Returns `Ok(None)` if another holder already owns it. The lock is held
    /// until the returned handle is released or dropped.
    fn try_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>>;

    /// Reference tracker shared by every writer and reader on this storage.
    fn file_refs(&self) -> &FileRefs;

    /// Close the storage and release all locks.
    fn close(&mut self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Read the remaining content of the input into memory.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.size()? as usize);
        self.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush buffered data and sync it to the backing medium.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, publishing its content.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A lock on a resource in storage.
///
/// Implementations release the lock when dropped.
pub trait StorageLock: Send + Sync + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
///
/// Each variant carries the configuration specific to that storage type,
/// including the path for file-based storage. The configuration object is
/// owned by the storage instance it builds; there is no process-wide default
/// beyond [`StorageConfig::default`].
///
/// # Example
///
/// ```
/// use tessera::storage::StorageConfig;
/// use tessera::storage::file::FileStorageConfig;
/// use tessera::storage::memory::MemoryStorageConfig;
///
/// let mut file_config = FileStorageConfig::new("/data/index");
/// file_config.buffer_size = 131072;
/// let config = StorageConfig::File(file_config);
///
/// let config = StorageConfig::Memory(MemoryStorageConfig::default());
/// ```
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let path = file_config.path.clone();
                let storage = file::FileStorage::new(&path, file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Delete every file in `storage` that no live [`FileRef`] points at.
///
/// Files held by a writer's committed or pending generation, by any open
/// snapshot reader, or by an in-flight flush or merge are never touched.
/// Returns the number of files removed.
pub fn remove_unreferenced(storage: &dyn Storage) -> Result<usize> {
    let refs = storage.file_refs();
    let mut removed = 0;

    for name in storage.list_files()? {
        if refs.is_referenced(&name) {
            continue;
        }

        match storage.delete_file(&name) {
            Ok(()) => removed += 1,
            Err(e) => warn!("failed to remove unreferenced file '{name}': {e}"),
        }
    }

    refs.purge();
    debug!("removed {removed} unreferenced file(s)");

    Ok(removed)
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// File already exists.
    FileExists(String),

    /// Permission denied.
    PermissionDenied(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Storage is closed.
    StorageClosed,

    /// Invalid operation.
    InvalidOperation(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::FileExists(name) => write!(f, "File already exists: {name}"),
            StorageError::PermissionDenied(name) => write!(f, "Permission denied: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
            StorageError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for TesseraError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => TesseraError::FileNotFound(name),
            StorageError::LockFailed(name) => TesseraError::LockObtainFailed(name),
            other => TesseraError::storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();

        match config {
            StorageConfig::Memory(mem_config) => {
                assert_eq!(mem_config.initial_capacity, 16);
            }
            _ => panic!("Expected Memory config"),
        }
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("test.txt".to_string());
        assert_eq!(err.to_string(), "File not found: test.txt");

        let err = StorageError::LockFailed("write.lock".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: write.lock");

        let err = StorageError::StorageClosed;
        assert_eq!(err.to_string(), "Storage is closed");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: TesseraError = StorageError::FileNotFound("segments_3".to_string()).into();
        assert!(matches!(err, TesseraError::FileNotFound(ref name) if name == "segments_3"));

        let err: TesseraError = StorageError::LockFailed("write".to_string()).into();
        assert!(matches!(err, TesseraError::LockObtainFailed(_)));

        let err: TesseraError = StorageError::StorageClosed.into();
        assert!(matches!(err, TesseraError::Storage(_)));
    }

    #[test]
    fn test_storage_factory_memory() {
        let config = StorageConfig::Memory(MemoryStorageConfig::default());
        let storage = StorageFactory::create(config).unwrap();

        assert!(!storage.file_exists("test.txt"));
    }

    #[test]
    fn test_storage_factory_file() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let file_config = FileStorageConfig::new(temp_dir.path());
        let config = StorageConfig::File(file_config);
        let storage = StorageFactory::create(config).unwrap();

        assert!(!storage.file_exists("test.txt"));
    }

    #[test]
    fn test_remove_unreferenced_keeps_referenced_files() {
        let storage = StorageFactory::create(StorageConfig::default()).unwrap();

        for name in ["_1.cs", "_1.pst", "_2.cs"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(b"data").unwrap();
            output.close().unwrap();
        }

        let keep = storage.file_refs().add("_1.cs");
        assert_eq!(remove_unreferenced(storage.as_ref()).unwrap(), 2);
        assert_eq!(storage.list_files().unwrap(), vec!["_1.cs".to_string()]);

        drop(keep);
        assert_eq!(remove_unreferenced(storage.as_ref()).unwrap(), 1);
        assert!(storage.list_files().unwrap().is_empty());
    }
}
