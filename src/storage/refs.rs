//! Reference tracking for index files.
//!
//! Every file that belongs to a live generation, an open snapshot, or an
//! in-flight flush/merge is pinned by at least one [`FileRef`]. Handles are
//! cheap `Arc` clones; the tracker only keeps weak pointers, so a file becomes
//! unreferenced the moment its last handle is dropped. Physical deletion is
//! left to [`crate::storage::remove_unreferenced`].

use std::fmt;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;

/// A counted handle pinning one file name.
#[derive(Clone)]
pub struct FileRef(Arc<str>);

impl FileRef {
    /// The pinned file name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileRef({})", self.0)
    }
}

/// Registry of live [`FileRef`] handles for one storage instance.
#[derive(Default)]
pub struct FileRefs {
    refs: Mutex<AHashMap<String, Weak<str>>>,
}

impl FileRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `name`, sharing the existing handle if the file is already pinned.
    pub fn add(&self, name: &str) -> FileRef {
        let mut refs = self.refs.lock();

        if let Some(existing) = refs.get(name).and_then(Weak::upgrade) {
            return FileRef(existing);
        }

        let handle: Arc<str> = Arc::from(name);
        refs.insert(name.to_string(), Arc::downgrade(&handle));
        FileRef(handle)
    }

    /// Pin every name in `names`.
    pub fn add_all<'a, I>(&self, names: I) -> Vec<FileRef>
    where
        I: IntoIterator<Item = &'a String>,
    {
        names.into_iter().map(|name| self.add(name)).collect()
    }

    /// Whether any live handle pins `name`.
    pub fn is_referenced(&self, name: &str) -> bool {
        self.refs
            .lock()
            .get(name)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of distinct pinned files.
    pub fn len(&self) -> usize {
        self.refs
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop bookkeeping for files whose last handle is gone.
    pub fn purge(&self) {
        self.refs.lock().retain(|_, weak| weak.strong_count() > 0);
    }
}

impl fmt::Debug for FileRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRefs").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_share_one_entry() {
        let refs = FileRefs::new();

        let a = refs.add("segments_1");
        let b = refs.add("segments_1");
        assert_eq!(a.name(), "segments_1");
        assert_eq!(refs.len(), 1);

        drop(a);
        assert!(refs.is_referenced("segments_1"));

        drop(b);
        assert!(!refs.is_referenced("segments_1"));
        assert!(refs.is_empty());
    }

    #[test]
    fn test_readd_after_release() {
        let refs = FileRefs::new();

        drop(refs.add("_1.cs"));
        let again = refs.add("_1.cs");
        assert!(refs.is_referenced("_1.cs"));

        refs.purge();
        assert!(refs.is_referenced(again.name()));
    }
}
