//! Error types for the Tessera library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`TesseraError`] enum. Resource and durability failures (`Io`,
//! `LockObtainFailed`, `IndexNotFound`, `FileNotFound`) are always surfaced to
//! the caller; per-document validation failures never reach this type, they
//! only discard the offending document.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn example_operation() -> Result<()> {
//!     Err(TesseraError::invalid_argument("segment_docs_max must be positive"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors, including failed durable writes and syncs.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The directory is exclusively locked by another writer.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// No committed index generation exists in the directory.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// A required file is missing.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Field-related errors
    #[error("Field error: {0}")]
    Field(String),

    /// Malformed or corrupted persisted data.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The operation is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Create a new lock failure.
    pub fn lock_obtain_failed<S: Into<String>>(msg: S) -> Self {
        TesseraError::LockObtainFailed(msg.into())
    }

    /// Create a new missing-index error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::IndexNotFound(msg.into())
    }

    /// Create a new missing-file error.
    pub fn file_not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::FileNotFound(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        TesseraError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new field error.
    pub fn field<S: Into<String>>(msg: S) -> Self {
        TesseraError::Field(msg.into())
    }

    /// Create a new codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        TesseraError::Codec(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        TesseraError::IllegalState(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        TesseraError::OperationCancelled(msg.into())
    }

    /// Whether this error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            TesseraError::FileNotFound(_) => true,
            TesseraError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<Box<bincode::ErrorKind>> for TesseraError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        TesseraError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = TesseraError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = TesseraError::lock_obtain_failed("write.lock");
        assert_eq!(error.to_string(), "Lock obtain failed: write.lock");

        let error = TesseraError::index_not_found("no segments file");
        assert_eq!(error.to_string(), "Index not found: no segments file");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = TesseraError::from(io_error);

        match error {
            TesseraError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
        assert!(TesseraError::from(io::Error::new(io::ErrorKind::NotFound, "x")).is_not_found());
        assert!(TesseraError::file_not_found("a").is_not_found());
        assert!(!TesseraError::codec("a").is_not_found());
    }
}
