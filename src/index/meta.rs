//! Index and segment metadata.
//!
//! An [`IndexMeta`] is one generation of the index: an ordered list of
//! [`SegmentMeta`]s plus the counters needed to continue writing. Published
//! generations are never mutated; a commit always writes a new one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Name prefix of committed index-meta files.
pub const SEGMENTS_FILE_PREFIX: &str = "segments_";

/// Name prefix of prepared, not yet committed index-meta files.
pub const PENDING_SEGMENTS_FILE_PREFIX: &str = "pending_segments_";

/// Metadata of one immutable segment version.
///
/// A segment keeps its name for its whole life; `version` increases each time
/// a commit attaches a new document mask to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub name: String,
    pub version: u64,
    pub codec: String,
    pub docs_count: u64,
    pub live_docs_count: u64,
    /// Total size in bytes of the backing files.
    pub size: u64,
    pub files: BTreeSet<String>,
    /// Current document-mask file, if any document was removed.
    pub doc_mask: Option<String>,
    /// Column names in column-id order.
    pub columns: Vec<String>,
    pub fields: Vec<String>,
}

impl SegmentMeta {
    pub fn new(name: impl Into<String>, codec: impl Into<String>) -> Self {
        SegmentMeta {
            name: name.into(),
            version: 0,
            codec: codec.into(),
            docs_count: 0,
            live_docs_count: 0,
            size: 0,
            files: BTreeSet::new(),
            doc_mask: None,
            columns: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn has_removals(&self) -> bool {
        self.live_docs_count < self.docs_count
    }

    /// Same segment, same version.
    pub fn same_version(&self, other: &SegmentMeta) -> bool {
        self.name == other.name && self.version == other.version
    }
}

/// One generation of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Generation number; `0` for an index that was never committed.
    pub generation: u64,
    /// Highest segment number handed out so far.
    pub segments_counter: u64,
    pub segments: Vec<SegmentMeta>,
    /// Opaque user payload carried along with the generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl IndexMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments.
    pub fn size(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.docs_count).sum()
    }

    pub fn live_docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.live_docs_count).sum()
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentMeta> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Every file referenced by the segments of this generation.
    pub fn files(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .flat_map(|s| s.files.iter().cloned())
            .collect()
    }

    pub fn segments_file_name(&self) -> String {
        segments_file_name(self.generation)
    }

    pub fn pending_segments_file_name(&self) -> String {
        pending_segments_file_name(self.generation)
    }
}

pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_FILE_PREFIX}{generation}")
}

pub fn pending_segments_file_name(generation: u64) -> String {
    format!("{PENDING_SEGMENTS_FILE_PREFIX}{generation}")
}

/// Parse the generation out of a committed index-meta file name.
pub fn parse_generation(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENTS_FILE_PREFIX)
        .and_then(|generation| generation.parse().ok())
}

/// Name of segment number `counter`.
pub fn segment_name(counter: u64) -> String {
    format!("_{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str, docs: u64, live: u64) -> SegmentMeta {
        let mut meta = SegmentMeta::new(name, "1.0");
        meta.docs_count = docs;
        meta.live_docs_count = live;
        meta.files.insert(format!("{name}.cs"));
        meta
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segments_file_name(3), "segments_3");
        assert_eq!(pending_segments_file_name(3), "pending_segments_3");
        assert_eq!(parse_generation("segments_17"), Some(17));
        assert_eq!(parse_generation("pending_segments_17"), None);
        assert_eq!(parse_generation("segments_x"), None);
        assert_eq!(segment_name(5), "_5");
    }

    #[test]
    fn test_index_meta_counts() {
        let meta = IndexMeta {
            generation: 2,
            segments_counter: 2,
            segments: vec![segment("_1", 4, 3), segment("_2", 2, 2)],
            payload: None,
        };

        assert_eq!(meta.size(), 2);
        assert_eq!(meta.docs_count(), 6);
        assert_eq!(meta.live_docs_count(), 5);
        assert!(meta.segment("_1").unwrap().has_removals());
        assert!(!meta.segment("_2").unwrap().has_removals());
        assert_eq!(meta.files().len(), 2);
        assert_eq!(meta.segments_file_name(), "segments_2");
    }

    #[test]
    fn test_index_meta_json() {
        let mut meta = IndexMeta::new();
        meta.generation = 1;
        meta.segments.push(segment("_1", 1, 1));

        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("payload"));
        let decoded: IndexMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, meta);
    }
}
