//! Transactional index writer.
//!
//! Documents are written through short-lived [`DocumentsContext`] handles
//! into the active flush context. [`IndexWriter::begin`] prepares the next
//! generation: it rotates the flush contexts, seals every buffered segment,
//! applies queued removals to committed, pending and freshly flushed segments,
//! and writes a pending index-meta file. [`IndexWriter::commit`] publishes it.
//! Writes that arrive after `begin` land in the next generation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera::index::codec::DefaultCodec;
//! use tessera::index::document::Field;
//! use tessera::index::reader::DirectoryReader;
//! use tessera::index::writer::{IndexWriter, IndexWriterConfig, OpenMode};
//! use tessera::storage::memory::MemoryStorage;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = Arc::new(MemoryStorage::new_default());
//! let codec = Arc::new(DefaultCodec::new());
//! let writer = IndexWriter::open(
//!     storage.clone(),
//!     codec.clone(),
//!     OpenMode::Create,
//!     IndexWriterConfig::default(),
//! )?;
//!
//! {
//!     let mut docs = writer.documents();
//!     docs.insert(|doc| {
//!         doc.insert(&Field::indexed_stored("name", ["a"], "A"));
//!     })?;
//! }
//! writer.commit()?;
//!
//! let reader = DirectoryReader::open(storage, codec)?;
//! assert_eq!(reader.live_docs_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ahash::AHashMap;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::index::codec::{Codec, doc_mask_file_name};
use crate::index::consolidation::{ConsolidationTicket, Consolidations};
use crate::index::document::Document;
use crate::index::filter::Filter;
use crate::index::flush_context::{FlushBatch, FlushContext, PendingSegment};
use crate::index::mask::DocumentMask;
use crate::index::merge::MergeWriter;
use crate::index::meta::{IndexMeta, SegmentMeta};
use crate::index::policy::ConsolidationPolicy;
use crate::index::reader::DirectoryReader;
use crate::index::segment::SegmentReader;
use crate::index::segment_writer::{
    DocState, FlushedSegment, LeaseMark, Modification, SegmentContext, SegmentLimits, SegmentSink,
};
use crate::index::{DocId, doc_limits};
use crate::storage::{FileRef, Storage, StorageLock, remove_unreferenced};

/// Name of the repository lock held by a writer.
pub const WRITE_LOCK_NAME: &str = "write";

/// How [`IndexWriter::open`] treats an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start an empty index. Generations continue after any existing one,
    /// and the first commit is written even if nothing was added.
    Create,
    /// Continue an existing index; fails if there is none.
    Append,
    /// Append if an index exists, create otherwise.
    CreateOrAppend,
}

/// Configuration for [`IndexWriter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    /// Seal a segment once it buffers this many documents (0 = unlimited).
    pub segment_docs_max: usize,
    /// Seal a segment once its buffers use this many bytes (0 = unlimited).
    pub segment_memory_max: usize,
    /// Concurrent segment writers per generation (0 = unlimited).
    pub segment_count_max: usize,
    /// Hold the storage write lock for the writer's lifetime.
    pub lock_repository: bool,
    /// Number of rotating flush contexts; at least 2.
    pub flush_context_pool_size: usize,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            segment_docs_max: 0,
            segment_memory_max: 0,
            segment_count_max: 0,
            lock_repository: true,
            flush_context_pool_size: 2,
        }
    }
}

/// The published generation and the file handles keeping it alive.
#[derive(Debug)]
struct CommittedState {
    meta: IndexMeta,
    _refs: Vec<FileRef>,
}

/// A generation written as a pending file, awaiting [`IndexWriter::commit`].
#[derive(Debug)]
struct PendingState {
    meta: IndexMeta,
    /// Flush context the generation was drained from.
    ctx: usize,
    readers: Vec<SegmentReader>,
    refs: Vec<FileRef>,
    /// Claims of the consolidations spliced into this generation.
    tickets: Vec<ConsolidationTicket>,
}

/// State guarded by the commit lock.
#[derive(Debug)]
struct CommitState {
    pending: Option<PendingState>,
    /// Write the next generation even if nothing changed.
    force: bool,
    payload: Option<Vec<u8>>,
    payload_changed: bool,
}

/// Segment readers of the committed generation, keyed by segment name.
#[derive(Debug, Default)]
struct ReaderCache {
    readers: Mutex<AHashMap<String, SegmentReader>>,
}

impl ReaderCache {
    fn get(
        &self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        meta: &SegmentMeta,
    ) -> Result<SegmentReader> {
        let cached = self.readers.lock().get(&meta.name).cloned();

        let reader = match cached {
            Some(reader) if reader.meta().same_version(meta) => return Ok(reader),
            Some(reader) => reader.reopen(storage, codec, meta)?,
            None => SegmentReader::open(storage, codec, meta)?,
        };

        self.readers.lock().insert(meta.name.clone(), reader.clone());
        Ok(reader)
    }

    /// Replace the cache with the readers of a new generation.
    fn publish(&self, readers: Vec<SegmentReader>) {
        let mut cache = self.readers.lock();
        cache.clear();
        cache.extend(readers.into_iter().map(|r| (r.name().to_string(), r)));
    }

    fn clear(&self) {
        self.readers.lock().clear();
    }
}

/// Writes, removes and replaces documents and publishes generations.
///
/// All methods take `&self`; the writer is meant to be shared between
/// threads. Only one writer should be open on a storage at a time, which is
/// enforced by a storage lock unless `lock_repository` is disabled.
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    config: IndexWriterConfig,
    contexts: Vec<FlushContext>,
    active: AtomicUsize,
    commit: Mutex<CommitState>,
    committed: RwLock<Arc<CommittedState>>,
    readers: ReaderCache,
    consolidations: Arc<Consolidations>,
    segment_counter: AtomicU64,
    _lock: Option<Box<dyn StorageLock>>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("storage", &self.storage)
            .field("codec", &self.codec.name())
            .field("config", &self.config)
            .field("generation", &self.generation())
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer on `storage`.
    ///
    /// Fails with [`TesseraError::LockObtainFailed`] if another writer holds
    /// the storage lock, and with [`TesseraError::FileNotFound`] when
    /// appending to a storage without a committed generation.
    pub fn open(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        mode: OpenMode,
        config: IndexWriterConfig,
    ) -> Result<Self> {
        let lock = if config.lock_repository {
            match storage.try_lock(WRITE_LOCK_NAME)? {
                Some(lock) => Some(lock),
                None => {
                    return Err(TesseraError::lock_obtain_failed(format!(
                        "'{WRITE_LOCK_NAME}' lock is held by another writer"
                    )));
                }
            }
        } else {
            None
        };

        let last = codec.last_segments_file(&*storage)?;
        let existing = match &last {
            Some(file) => Some(codec.read_index_meta(&*storage, file)?),
            None => None,
        };

        // The last committed generation stays pinned until it is replaced.
        let mut refs = Vec::new();
        if let (Some(file), Some(meta)) = (&last, &existing) {
            refs = storage.file_refs().add_all(&meta.files());
            refs.push(storage.file_refs().add(file));
        }

        let (meta, force) = match (mode, existing) {
            (OpenMode::Append, None) => {
                return Err(TesseraError::file_not_found(
                    "no committed generation to append to",
                ));
            }
            (OpenMode::Append | OpenMode::CreateOrAppend, Some(meta)) => (meta, false),
            (OpenMode::Create | OpenMode::CreateOrAppend, None) => (IndexMeta::new(), true),
            (OpenMode::Create, Some(previous)) => {
                let meta = IndexMeta {
                    generation: previous.generation,
                    segments_counter: previous.segments_counter,
                    segments: Vec::new(),
                    payload: None,
                };
                (meta, true)
            }
        };

        if lock.is_some() {
            remove_unreferenced(&*storage)?;
        }

        let pool_size = config.flush_context_pool_size.max(2);
        let contexts = (0..pool_size).map(|_| FlushContext::new()).collect();

        info!(
            "opened writer in {mode:?} mode at generation {} with {} segment(s)",
            meta.generation,
            meta.segments.len()
        );

        Ok(IndexWriter {
            segment_counter: AtomicU64::new(meta.segments_counter),
            commit: Mutex::new(CommitState {
                pending: None,
                force,
                payload: meta.payload.clone(),
                payload_changed: false,
            }),
            committed: RwLock::new(Arc::new(CommittedState { meta, _refs: refs })),
            storage,
            codec,
            config,
            contexts,
            active: AtomicUsize::new(0),
            readers: ReaderCache::default(),
            consolidations: Consolidations::new(),
            _lock: lock,
        })
    }

    /// A transaction handle bound to the active generation on first use.
    pub fn documents(&self) -> DocumentsContext<'_> {
        DocumentsContext {
            writer: self,
            lease: None,
        }
    }

    /// Prepare the next generation without publishing it.
    ///
    /// Returns `false` if a generation is already prepared or there is
    /// nothing to commit.
    pub fn begin(&self) -> Result<bool> {
        let mut state = self.commit.lock();
        self.start(&mut state)
    }

    /// Publish the prepared generation, preparing one first if needed.
    ///
    /// Waits for consolidations that were running when it was called, so
    /// their results are part of this or an earlier generation. Returns
    /// `false` if there was nothing to commit.
    pub fn commit(&self) -> Result<bool> {
        let limit = self.consolidations.next_id();
        self.consolidations.wait_before(limit);

        let mut state = self.commit.lock();
        if state.pending.is_none() && !self.start(&mut state)? {
            return Ok(false);
        }
        self.finish(&mut state)
    }

    /// Discard the prepared generation and everything buffered for it.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.commit.lock();
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };

        self.contexts[pending.ctx].reset();
        self.codec.rollback_index_meta(&*self.storage, &pending.meta)?;
        debug!("rolled back generation {}", pending.meta.generation);
        Ok(())
    }

    /// Commit an empty generation.
    ///
    /// Drops the prepared generation, the buffered documents of the active
    /// one, and every in-flight consolidation. A no-op on an index that is
    /// already empty.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.commit.lock();
        let committed = self.committed.read().clone();

        if state.pending.is_none() && committed.meta.segments.is_empty() && !state.force {
            return Ok(());
        }

        if let Some(pending) = state.pending.take() {
            self.contexts[pending.ctx].reset();
            if let Err(e) = self.codec.rollback_index_meta(&*self.storage, &pending.meta) {
                warn!("failed to remove pending generation {}: {e}", pending.meta.generation);
            }
        }

        let index = self.rotate();
        self.contexts[index].discard();

        let meta = IndexMeta {
            generation: committed.meta.generation + 1,
            segments_counter: self.segment_counter.load(Ordering::SeqCst),
            segments: Vec::new(),
            payload: state.payload.clone(),
        };
        let refs = vec![
            self.storage.file_refs().add(&meta.pending_segments_file_name()),
            self.storage.file_refs().add(&meta.segments_file_name()),
        ];

        let pending_file = self.codec.write_index_meta(&*self.storage, &meta)?;
        let published = self
            .storage
            .sync(std::slice::from_ref(&pending_file))
            .and_then(|_| self.codec.commit_index_meta(&*self.storage, &meta));
        if let Err(e) = published {
            self.discard_meta_files(&meta);
            return Err(e);
        }

        info!("cleared index at generation {}", meta.generation);

        *self.committed.write() = Arc::new(CommittedState { meta, _refs: refs });
        self.readers.clear();
        self.consolidations.abort_all();
        state.force = false;
        state.payload_changed = false;

        Ok(())
    }

    /// Merge the segments chosen by `policy` into one.
    ///
    /// The merged segment replaces its candidates at the next commit.
    /// Returns `false` if the selection was empty or invalid, overlapped an
    /// in-flight consolidation, or went stale before it could be registered.
    pub fn consolidate(&self, policy: &dyn ConsolidationPolicy) -> Result<bool> {
        self.consolidate_with_progress(policy, None)
    }

    /// [`consolidate`](Self::consolidate) with a cancellation callback,
    /// polled while merging; returning `false` abandons the merge.
    pub fn consolidate_with_progress(
        &self,
        policy: &dyn ConsolidationPolicy,
        progress: Option<&dyn Fn() -> bool>,
    ) -> Result<bool> {
        let committed = self.committed.read().clone();

        let (candidates, ticket) = {
            let mut set = self.consolidations.lock();

            let mut candidates = Vec::new();
            policy.select(&mut candidates, &committed.meta, &set.segments());

            let mut seen = HashSet::new();
            candidates.retain(|c: &SegmentMeta| seen.insert(c.name.clone()));

            if candidates.is_empty() {
                trace!("consolidation policy selected nothing");
                return Ok(false);
            }
            if candidates.len() == 1 && !candidates[0].has_removals() {
                trace!("nothing to gain from consolidating {}", candidates[0].name);
                return Ok(false);
            }

            let unknown = candidates.iter().find(|candidate| {
                !committed
                    .meta
                    .segments
                    .iter()
                    .any(|segment| segment.same_version(candidate))
            });
            if let Some(unknown) = unknown {
                debug!(
                    "rejecting consolidation: {} v{} is not committed",
                    unknown.name, unknown.version
                );
                return Ok(false);
            }

            match self.consolidations.register(&mut set, &candidates) {
                Some(ticket) => (candidates, ticket),
                None => {
                    debug!("rejecting consolidation: a candidate is already being merged");
                    return Ok(false);
                }
            }
        };

        let readers = candidates
            .iter()
            .map(|meta| self.readers.get(&*self.storage, &*self.codec, meta))
            .collect::<Result<Vec<_>>>()?;

        let mut merge = MergeWriter::new(&*self.storage, &*self.codec);
        for reader in &readers {
            merge.add(reader.clone());
        }
        let Some(merged) = merge.merge(&self.segment_counter, progress)? else {
            debug!("consolidation #{} cancelled", ticket.id());
            return Ok(false);
        };

        let _state = self.commit.lock();
        if ticket.is_stale() {
            debug!("discarding consolidation #{}: index was cleared", ticket.id());
            return Ok(false);
        }

        let mut ticket = ticket;
        ticket.finish();

        let index = self.active.load(Ordering::SeqCst);
        let pending = PendingSegment::Consolidation {
            merged,
            candidates: readers,
            ticket,
        };
        // The commit lock keeps the active context from rotating.
        if self.contexts[index]
            .push_pending(pending, || self.active.load(Ordering::SeqCst) == index)
            .is_err()
        {
            warn!("active flush context rejected a consolidation");
            return Ok(false);
        }

        Ok(true)
    }

    /// Copy the live documents of `reader` into a new segment of the active
    /// generation. Returns `false` if there was nothing to import.
    pub fn import(&self, reader: &DirectoryReader) -> Result<bool> {
        if reader.live_docs_count() == 0 {
            return Ok(false);
        }

        let mut merge = MergeWriter::new(&*self.storage, &*self.codec);
        for segment in reader.iter().filter(|s| s.live_docs_count() > 0) {
            merge.add(segment.clone());
        }
        let Some(merged) = merge.merge(&self.segment_counter, None)? else {
            return Ok(false);
        };

        debug!(
            "imported {} document(s) as {}",
            merged.meta.docs_count, merged.meta.name
        );

        let mut pending = PendingSegment::Import {
            meta: merged.meta,
            reader: merged.reader,
            refs: merged.refs,
            generation: 0,
        };
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let ctx = &self.contexts[index];
            if let PendingSegment::Import { generation, .. } = &mut pending {
                *generation = ctx.tick();
            }
            match ctx.push_pending(pending, || self.active.load(Ordering::SeqCst) == index) {
                Ok(()) => return Ok(true),
                Err(rejected) => pending = rejected,
            }
        }
    }

    /// Documents buffered in the active generation.
    pub fn buffered_docs(&self) -> usize {
        self.contexts[self.active.load(Ordering::SeqCst)].buffered_docs()
    }

    /// Delete every file no committed generation, open reader, or in-flight
    /// operation refers to. Returns the number of files removed.
    pub fn cleanup(&self) -> Result<usize> {
        remove_unreferenced(&*self.storage)
    }

    /// Payload stored with the next committed generation.
    pub fn set_payload(&self, payload: Option<Vec<u8>>) {
        let mut state = self.commit.lock();
        state.payload = payload;
        state.payload_changed = true;
    }

    pub fn committed_meta(&self) -> IndexMeta {
        self.committed.read().meta.clone()
    }

    /// Last committed generation; `0` if none.
    pub fn generation(&self) -> u64 {
        self.committed.read().meta.generation
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn limits(&self) -> SegmentLimits {
        SegmentLimits {
            docs_max: self.config.segment_docs_max,
            memory_max: self.config.segment_memory_max,
        }
    }

    fn sink(&self) -> SegmentSink<'_> {
        SegmentSink {
            storage: &*self.storage,
            codec: &*self.codec,
            counter: &self.segment_counter,
        }
    }

    /// Make the next context active and return the previous one.
    fn rotate(&self) -> usize {
        let index = self.active.load(Ordering::SeqCst);
        self.active
            .store((index + 1) % self.contexts.len(), Ordering::SeqCst);
        index
    }

    /// Lease a segment context from the active flush context.
    fn bind(&self) -> Lease {
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let leased = self.contexts[index].lease(self.config.segment_count_max, || {
                self.active.load(Ordering::SeqCst) == index
            });
            if let Some(segment) = leased {
                let mark = segment.mark();
                return Lease {
                    ctx: index,
                    segment,
                    mark,
                };
            }
        }
    }

    fn start(&self, state: &mut CommitState) -> Result<bool> {
        if state.pending.is_some() {
            return Ok(false);
        }

        let index = self.rotate();
        let ctx = &self.contexts[index];
        let batch = ctx.drain();

        match self.flush(state, index, batch) {
            Ok(Some(pending)) => {
                debug!(
                    "prepared generation {} with {} segment(s)",
                    pending.meta.generation,
                    pending.meta.segments.len()
                );
                state.pending = Some(pending);
                Ok(true)
            }
            Ok(None) => {
                ctx.reset();
                Ok(false)
            }
            Err(e) => {
                warn!("failed to prepare generation: {e}");
                ctx.reset();
                Err(e)
            }
        }
    }

    fn finish(&self, state: &mut CommitState) -> Result<bool> {
        let Some(pending) = state.pending.take() else {
            return Ok(false);
        };

        self.contexts[pending.ctx].reset();

        if let Err(e) = self.codec.commit_index_meta(&*self.storage, &pending.meta) {
            warn!("failed to publish generation {}: {e}", pending.meta.generation);
            self.discard_meta_files(&pending.meta);
            return Err(e);
        }

        let PendingState {
            meta,
            readers,
            refs,
            tickets,
            ..
        } = pending;

        info!(
            "committed generation {} ({} segment(s), {} live document(s))",
            meta.generation,
            meta.segments.len(),
            meta.live_docs_count()
        );

        *self.committed.write() = Arc::new(CommittedState { meta, _refs: refs });
        self.readers.publish(readers);
        state.force = false;
        state.payload_changed = false;

        // Merged segments are now committed; release their claims.
        drop(tickets);

        Ok(true)
    }

    fn discard_meta_files(&self, meta: &IndexMeta) {
        for file in [meta.pending_segments_file_name(), meta.segments_file_name()] {
            if let Err(e) = self.storage.delete_file(&file) {
                warn!("failed to remove {file}: {e}");
            }
        }
    }

    /// Build and write the pending generation out of a drained context.
    ///
    /// Returns `None` if nothing changed and no commit is forced.
    fn flush(
        &self,
        state: &CommitState,
        index: usize,
        batch: FlushBatch,
    ) -> Result<Option<PendingState>> {
        let committed = self.committed.read().clone();
        let mut flush = Flush::new(self);

        // Seal every segment context and collect its modifications.
        let mut modifications: Vec<Modification> = Vec::new();
        let mut flushed: Vec<FlushedSegment> = Vec::new();
        for mut segment in batch.segments {
            segment.seal(self.sink())?;

            let base = modifications.len();
            for mut sealed in segment.flushed.drain(..) {
                for doc in &mut sealed.docs {
                    if let Some(update) = doc.update.as_mut() {
                        *update += base;
                    }
                }
                flushed.push(sealed);
            }
            modifications.append(&mut segment.modifications);
        }

        // Committed segments: every modification applies.
        for meta in &committed.meta.segments {
            let reader = self.readers.get(&*self.storage, &*self.codec, meta)?;
            let mut removed = DocumentMask::new();
            if apply_modifications(&reader, &mut removed, &mut modifications, |_| true)? > 0 {
                flush.modified = true;
            }
            flush.push(meta.clone(), reader, removed);
        }

        // Imports and consolidations registered into this generation.
        for pending in batch.pending {
            match pending {
                PendingSegment::Import {
                    meta,
                    reader,
                    refs,
                    generation,
                } => {
                    flush.modified = true;
                    flush.refs.extend(refs);
                    flush.files.extend(meta.files.iter().cloned());

                    let mut removed = DocumentMask::new();
                    apply_modifications(&reader, &mut removed, &mut modifications, |m| {
                        m.generation >= generation
                    })?;
                    flush.push(meta, reader, removed);
                }
                PendingSegment::Consolidation {
                    merged,
                    candidates,
                    ticket,
                } => {
                    if ticket.is_stale() {
                        continue;
                    }

                    let positions: Option<Vec<usize>> = candidates
                        .iter()
                        .map(|candidate| flush.position(candidate.name()))
                        .collect();
                    let Some(positions) = positions else {
                        debug!(
                            "discarding consolidation #{}: a candidate is gone",
                            ticket.id()
                        );
                        continue;
                    };

                    // Carry over removals that happened after merging started.
                    let mut removed = DocumentMask::new();
                    for ((candidate, &position), doc_map) in
                        candidates.iter().zip(&positions).zip(&merged.doc_maps)
                    {
                        let current = &flush.segments[position];
                        let docs = current
                            .reader
                            .docs_mask()
                            .difference(candidate.docs_mask())
                            .chain(current.removed.iter());
                        for doc in docs {
                            let mapped = doc_map.get(doc as usize).copied().unwrap_or(0);
                            if doc_limits::valid(mapped) {
                                removed.insert(mapped);
                            }
                        }
                    }

                    flush.remove_positions(positions);
                    flush.modified = true;
                    flush.refs.extend(merged.refs);
                    flush.files.extend(merged.meta.files.iter().cloned());
                    flush.push(merged.meta, merged.reader, removed);
                    flush.tickets.push(ticket);
                }
            }
        }

        // Freshly flushed segments: a modification only sees documents that
        // were inserted before it.
        let mut masks = Vec::with_capacity(flushed.len());
        for segment in &flushed {
            let mut mask = DocumentMask::new();
            for (doc, state) in docs_of(segment) {
                if state.rolled_back {
                    mask.insert(doc);
                }
            }
            for modification in modifications.iter_mut() {
                let Some(filter) = &modification.filter else {
                    continue;
                };
                for doc in filter.matches(&segment.reader)? {
                    let visible = segment
                        .docs
                        .get(doc.wrapping_sub(doc_limits::MIN) as usize)
                        .is_some_and(|state| state.generation <= modification.generation);
                    if visible && mask.insert(doc) {
                        modification.seen = true;
                    }
                }
            }
            masks.push(mask);
        }

        // A replacement only survives if its removal matched something.
        for (segment, mask) in flushed.iter().zip(masks.iter_mut()) {
            for (doc, state) in docs_of(segment) {
                let orphaned = state
                    .update
                    .is_some_and(|update| modifications.get(update).is_some_and(|m| !m.seen));
                if orphaned {
                    mask.insert(doc);
                }
            }
        }

        for (segment, mask) in flushed.into_iter().zip(masks) {
            flush.modified = true;
            flush.refs.extend(segment.refs);
            flush.files.extend(segment.meta.files.iter().cloned());
            flush.push(segment.meta, segment.reader, mask);
        }

        if !flush.modified && !state.force && !state.payload_changed {
            trace!("nothing to flush");
            return Ok(None);
        }

        flush.finish(committed.meta.generation + 1, state.payload.clone(), index)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if let Some(pending) = self.commit.get_mut().pending.take() {
            debug!("dropping prepared generation {}", pending.meta.generation);
            if let Err(e) = self.codec.rollback_index_meta(&*self.storage, &pending.meta) {
                warn!("failed to remove pending generation: {e}");
            }
        }
    }
}

fn docs_of(segment: &FlushedSegment) -> impl Iterator<Item = (DocId, &DocState)> {
    segment
        .docs
        .iter()
        .enumerate()
        .map(|(i, state)| (i as DocId + doc_limits::MIN, state))
}

/// Apply every eligible modification to `reader`, collecting documents that
/// were live until now in `removed`. Returns the number of such documents.
fn apply_modifications<F>(
    reader: &SegmentReader,
    removed: &mut DocumentMask,
    modifications: &mut [Modification],
    eligible: F,
) -> Result<usize>
where
    F: Fn(&Modification) -> bool,
{
    let mut count = 0;

    for modification in modifications.iter_mut() {
        if !eligible(modification) {
            continue;
        }
        let Some(filter) = &modification.filter else {
            continue;
        };

        for doc in filter.matches(reader)? {
            if reader.is_live(doc) && removed.insert(doc) {
                modification.seen = true;
                count += 1;
            }
        }
    }

    Ok(count)
}

/// A segment of the generation under construction.
struct FlushEntry {
    meta: SegmentMeta,
    reader: SegmentReader,
    /// Documents removed by this flush, on top of the reader's mask.
    removed: DocumentMask,
}

/// Segment list of a generation under construction.
///
/// Removals are collected in memory while the list is assembled and only
/// written out in [`finish`](Flush::finish), so a segment whose last live
/// document goes away can still be matched by a consolidation spliced in
/// later during the same flush.
struct Flush<'w> {
    writer: &'w IndexWriter,
    segments: Vec<FlushEntry>,
    refs: Vec<FileRef>,
    /// New files that must be durable before the generation is published.
    files: Vec<String>,
    tickets: Vec<ConsolidationTicket>,
    modified: bool,
}

impl<'w> Flush<'w> {
    fn new(writer: &'w IndexWriter) -> Self {
        Flush {
            writer,
            segments: Vec::new(),
            refs: Vec::new(),
            files: Vec::new(),
            tickets: Vec::new(),
            modified: false,
        }
    }

    fn push(&mut self, meta: SegmentMeta, reader: SegmentReader, removed: DocumentMask) {
        self.segments.push(FlushEntry {
            meta,
            reader,
            removed,
        });
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|entry| entry.meta.name == name)
    }

    fn remove_positions(&mut self, mut positions: Vec<usize>) {
        positions.sort_unstable_by(|a, b| b.cmp(a));
        for position in positions {
            self.segments.remove(position);
        }
    }

    /// Persist the removals of `entry` as a new segment version.
    ///
    /// Returns `None` for a segment without live documents.
    fn materialize(
        &mut self,
        entry: FlushEntry,
    ) -> Result<Option<(SegmentMeta, SegmentReader)>> {
        let FlushEntry {
            meta,
            reader,
            removed,
        } = entry;

        if removed.is_empty() {
            return Ok(Some((meta, reader)));
        }

        let mut mask = reader.docs_mask().clone();
        mask.extend(&removed);

        let live = meta.docs_count.saturating_sub(mask.len() as u64);
        if live == 0 {
            debug!("dropping segment {}: no live documents left", meta.name);
            return Ok(None);
        }

        let storage = &*self.writer.storage;
        let codec = &*self.writer.codec;

        let version = meta.version + 1;
        self.refs
            .push(storage.file_refs().add(&doc_mask_file_name(&meta.name, version)));
        let written = codec.write_doc_mask(storage, &meta.name, version, &mask)?;

        let mut updated = meta;
        if let Some(old) = updated.doc_mask.take() {
            let old_size = storage.file_size(&old).unwrap_or(0);
            updated.size = updated.size.saturating_sub(old_size);
            updated.files.remove(&old);
        }
        updated.version = version;
        updated.live_docs_count = live;
        updated.size += written.size;
        updated.files.insert(written.name.clone());
        updated.doc_mask = Some(written.name.clone());
        self.files.push(written.name);

        let reader = reader.reopen(storage, codec, &updated)?;
        Ok(Some((updated, reader)))
    }

    /// Write the pending index-meta file and make every new file durable.
    fn finish(
        mut self,
        generation: u64,
        payload: Option<Vec<u8>>,
        ctx: usize,
    ) -> Result<Option<PendingState>> {
        let writer = self.writer;
        let storage = &*writer.storage;

        let mut segments = Vec::with_capacity(self.segments.len());
        let mut readers = Vec::with_capacity(self.segments.len());
        for entry in std::mem::take(&mut self.segments) {
            if let Some((meta, reader)) = self.materialize(entry)? {
                segments.push(meta);
                readers.push(reader);
            }
        }

        let meta = IndexMeta {
            generation,
            segments_counter: writer.segment_counter.load(Ordering::SeqCst),
            segments,
            payload,
        };

        // Segments dropped during the flush take their files with them.
        let live = meta.files();
        let mut refs = self.refs;
        refs.retain(|r| live.contains(r.name()));
        refs.extend(storage.file_refs().add_all(&live));
        refs.push(storage.file_refs().add(&meta.pending_segments_file_name()));
        refs.push(storage.file_refs().add(&meta.segments_file_name()));

        let pending_file = writer.codec.write_index_meta(storage, &meta)?;

        let mut files = self.files;
        files.retain(|file| live.contains(file));
        files.push(pending_file);
        if let Err(e) = storage.sync(&files) {
            if let Err(rollback) = writer.codec.rollback_index_meta(storage, &meta) {
                warn!("failed to remove pending generation {generation}: {rollback}");
            }
            return Err(e);
        }

        Ok(Some(PendingState {
            meta,
            ctx,
            readers,
            refs,
            tickets: self.tickets,
        }))
    }
}

/// Segment context held by a [`DocumentsContext`].
#[derive(Debug)]
struct Lease {
    ctx: usize,
    segment: SegmentContext,
    mark: LeaseMark,
}

/// A transaction handle.
///
/// Binds to the active generation on its first operation and stays bound
/// until dropped; a commit of that generation waits for the handle to go
/// away. Do not hold a handle across a `commit` on the same thread.
pub struct DocumentsContext<'a> {
    writer: &'a IndexWriter,
    lease: Option<Lease>,
}

impl<'a> DocumentsContext<'a> {
    fn lease(&mut self) -> &mut Lease {
        let writer = self.writer;
        self.lease.get_or_insert_with(|| writer.bind())
    }

    /// Add one document filled in by `f`.
    ///
    /// Returns `false` if the document was invalid and was discarded.
    pub fn insert<F>(&mut self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Document<'_>),
    {
        let writer = self.writer;
        let lease = self.lease();
        let ctx = &writer.contexts[lease.ctx];

        let state = DocState::insert(ctx.tick());
        let inserted = lease
            .segment
            .insert(state, writer.limits(), writer.sink(), f)?;
        if inserted {
            ctx.add_buffered(1);
        }
        Ok(inserted)
    }

    /// Remove every document matching `filter` that was inserted before this
    /// call, in this or an earlier generation.
    pub fn remove<F>(&mut self, filter: F)
    where
        F: Filter + 'static,
    {
        let writer = self.writer;
        let lease = self.lease();
        let generation = writer.contexts[lease.ctx].next_tick();
        lease
            .segment
            .push_modification(Arc::new(filter), generation, false);
    }

    /// Replace the documents matching `filter` with one document.
    ///
    /// The new document is only kept if `filter` removes something; the
    /// removal applies either way. Returns `false` if the document was
    /// invalid.
    pub fn replace<Fl, F>(&mut self, filter: Fl, f: F) -> Result<bool>
    where
        Fl: Filter + 'static,
        F: FnOnce(&mut Document<'_>),
    {
        let writer = self.writer;
        let lease = self.lease();
        let ctx = &writer.contexts[lease.ctx];

        let generation = ctx.next_tick();
        let update = lease
            .segment
            .push_modification(Arc::new(filter), generation, true);
        let state = DocState {
            generation: generation + 1,
            update: Some(update),
            rolled_back: false,
        };

        let inserted = lease
            .segment
            .insert(state, writer.limits(), writer.sink(), f)?;
        if inserted {
            ctx.add_buffered(1);
        }
        Ok(inserted)
    }

    /// Replace the documents matching `filter` with any number of documents.
    ///
    /// `f` stages one document per call and returns `Ok(true)` to be called
    /// again; a call that adds no field stages nothing. An error discards
    /// only the document being staged; documents from earlier calls stay.
    /// The removal applies even if no document was added. Returns the number
    /// of documents added.
    pub fn replace_with<Fl, F>(&mut self, filter: Fl, mut f: F) -> Result<usize>
    where
        Fl: Filter + 'static,
        F: FnMut(&mut Document<'_>) -> Result<bool>,
    {
        let writer = self.writer;
        let lease = self.lease();
        let ctx = &writer.contexts[lease.ctx];

        let generation = ctx.next_tick();
        let update = lease
            .segment
            .push_modification(Arc::new(filter), generation, true);

        let mut added = 0;
        loop {
            let state = DocState {
                generation: generation + 1,
                update: Some(update),
                rolled_back: false,
            };
            let (inserted, more) =
                lease
                    .segment
                    .try_insert(state, writer.limits(), writer.sink(), &mut f)?;
            if inserted {
                ctx.add_buffered(1);
                added += 1;
            }
            if !more {
                return Ok(added);
            }
        }
    }

    /// Undo everything done through this handle since it was bound or last
    /// reset. Documents already sealed into segments are masked out.
    pub fn reset(&mut self) {
        let writer = self.writer;
        if let Some(lease) = self.lease.as_mut() {
            let rolled_back = lease.segment.rollback_since(lease.mark);
            writer.contexts[lease.ctx].sub_buffered(rolled_back);
            lease.mark = lease.segment.mark();
        }
    }

    /// Documents buffered through this handle's segment context.
    pub fn buffered_docs(&self) -> usize {
        self.lease
            .as_ref()
            .map_or(0, |lease| lease.segment.buffered_docs())
    }
}

impl Drop for DocumentsContext<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.writer.contexts[lease.ctx].release(lease.segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::DefaultCodec;
    use crate::index::document::Field;
    use crate::index::filter::TermFilter;
    use crate::index::policy::ConsolidateAll;
    use crate::storage::memory::MemoryStorage;

    fn writer(storage: &Arc<MemoryStorage>, mode: OpenMode) -> Result<IndexWriter> {
        IndexWriter::open(
            storage.clone(),
            Arc::new(DefaultCodec::new()),
            mode,
            IndexWriterConfig::default(),
        )
    }

    fn add(writer: &IndexWriter, value: &str) {
        let mut docs = writer.documents();
        assert!(docs
            .insert(|doc| {
                doc.insert(&Field::indexed_stored("name", [value], value.to_string()));
            })
            .unwrap());
    }

    #[test]
    fn test_first_create_commit_is_written() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = writer(&storage, OpenMode::Create).unwrap();

        assert!(writer.commit().unwrap());
        assert_eq!(writer.generation(), 1);
        assert!(storage.file_exists("segments_1"));

        assert!(!writer.commit().unwrap());
        assert_eq!(writer.generation(), 1);
    }

    #[test]
    fn test_append_requires_index() {
        let storage = Arc::new(MemoryStorage::new_default());
        let err = writer(&storage, OpenMode::Append).unwrap_err();
        assert!(matches!(err, TesseraError::FileNotFound(_)));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let storage = Arc::new(MemoryStorage::new_default());
        let _first = writer(&storage, OpenMode::Create).unwrap();
        let err = writer(&storage, OpenMode::CreateOrAppend).unwrap_err();
        assert!(matches!(err, TesseraError::LockObtainFailed(_)));
    }

    #[test]
    fn test_begin_twice_and_rollback() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = writer(&storage, OpenMode::Create).unwrap();
        add(&writer, "A");

        assert!(writer.begin().unwrap());
        assert!(!writer.begin().unwrap());
        assert!(storage.file_exists("pending_segments_1"));

        writer.rollback().unwrap();
        writer.rollback().unwrap();
        assert!(!storage.file_exists("pending_segments_1"));
        assert_eq!(writer.generation(), 0);
    }

    #[test]
    fn test_remove_sees_only_earlier_documents() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = writer(&storage, OpenMode::Create).unwrap();

        {
            let mut docs = writer.documents();
            docs.insert(|doc| {
                doc.insert(&Field::indexed("name", ["A"]));
            })
            .unwrap();
            docs.remove(TermFilter::new("name", "A"));
            docs.insert(|doc| {
                doc.insert(&Field::indexed("name", ["A"]));
            })
            .unwrap();
        }
        writer.commit().unwrap();

        let meta = writer.committed_meta();
        assert_eq!(meta.segments.len(), 1);
        assert_eq!(meta.docs_count(), 2);
        assert_eq!(meta.live_docs_count(), 1);
    }

    #[test]
    fn test_replace_without_match_drops_replacement() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = writer(&storage, OpenMode::Create).unwrap();

        {
            let mut docs = writer.documents();
            docs.replace(TermFilter::new("name", "missing"), |doc| {
                doc.insert(&Field::indexed("name", ["B"]));
            })
            .unwrap();
        }
        writer.commit().unwrap();

        assert_eq!(writer.committed_meta().live_docs_count(), 0);
    }

    #[test]
    fn test_consolidation_claims_until_commit() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = writer(&storage, OpenMode::Create).unwrap();
        add(&writer, "A");
        writer.commit().unwrap();
        add(&writer, "B");
        writer.commit().unwrap();

        assert!(writer.consolidate(&ConsolidateAll).unwrap());
        assert!(!writer.consolidate(&ConsolidateAll).unwrap());

        writer.commit().unwrap();
        let meta = writer.committed_meta();
        assert_eq!(meta.segments.len(), 1);
        assert_eq!(meta.live_docs_count(), 2);
        assert_eq!(writer.consolidations.claimed_len(), 0);
    }
}
