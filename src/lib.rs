//! # Tessera
//!
//! An embeddable, transactional document storage and index engine.
//!
//! ## Features
//!
//! - Concurrent document inserts, removals and replacements
//! - Two-phase commits with atomic generation switch
//! - Snapshot readers that never observe partial commits
//! - Background segment consolidation with pluggable policies
//! - Columnar stored values with lazily built lookup caches
//! - Pluggable storage backends

pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::error::{Result, TesseraError};
    pub use crate::index::codec::{Codec, DefaultCodec};
    pub use crate::index::document::{Document, Field, IndexFeatures};
    pub use crate::index::filter::{Filter, TermFilter};
    pub use crate::index::reader::DirectoryReader;
    pub use crate::index::writer::{DocumentsContext, IndexWriter, IndexWriterConfig, OpenMode};
    pub use crate::storage::Storage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
