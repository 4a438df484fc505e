//! The index engine: segments, the transactional writer, and snapshot readers.
//!
//! # Architecture
//!
//! - [`writer::IndexWriter`] buffers documents into leased segment writers,
//!   seals them into immutable segments and publishes generations through a
//!   two-phase `begin`/`commit`.
//! - [`flush_context`] holds the rotating generation buffers that let new
//!   writes continue while the previous generation is being committed.
//! - [`consolidation`] and [`policy`] merge small segments in the background;
//!   merged segments are spliced in at a later commit.
//! - [`reader::DirectoryReader`] is an immutable snapshot of one committed
//!   generation; [`segment::SegmentReader`] is its per-segment view.
//! - [`column`] is the per-segment stored-value store.
//!
//! Document ids are 1-based within a segment; see [`doc_limits`].

pub mod codec;
pub mod column;
pub mod consolidation;
pub mod document;
pub mod filter;
pub mod flush_context;
pub mod iterator;
pub mod mask;
pub mod merge;
pub mod meta;
pub mod policy;
pub mod postings;
pub mod reader;
pub mod segment;
pub mod segment_writer;
pub mod writer;

/// Segment-local document identifier.
pub type DocId = u32;

/// Boundaries of the [`DocId`] space.
pub mod doc_limits {
    use super::DocId;

    /// Not positioned on any document yet.
    pub const INVALID: DocId = 0;

    /// The first document of every segment.
    pub const MIN: DocId = 1;

    /// Past the last document.
    pub const EOF: DocId = DocId::MAX;

    pub fn valid(doc: DocId) -> bool {
        doc != INVALID
    }

    pub fn eof(doc: DocId) -> bool {
        doc == EOF
    }
}
