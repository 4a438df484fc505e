//! Rotating generation buffers.
//!
//! The writer owns a small ring of [`FlushContext`]s; exactly one is *active*
//! at a time. Transaction handles lease [`SegmentContext`]s from the active
//! context. To prepare a generation the writer rotates the ring and then
//! marks the previous context exclusive, which stops new leases into it and
//! waits only for handles still bound to it. Handles bound to the newly active
//! context never block that flush.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::index::consolidation::ConsolidationTicket;
use crate::index::merge::MergedSegment;
use crate::index::meta::SegmentMeta;
use crate::index::segment::SegmentReader;
use crate::index::segment_writer::SegmentContext;
use crate::storage::FileRef;

/// A segment produced outside the document path, awaiting the next flush.
#[derive(Debug)]
pub(crate) enum PendingSegment {
    /// A copy of an external reader's live documents.
    Import {
        meta: SegmentMeta,
        reader: SegmentReader,
        refs: Vec<FileRef>,
        generation: u64,
    },
    /// A finished merge of committed segments.
    Consolidation {
        merged: MergedSegment,
        /// Candidate versions as they were when merging started.
        candidates: Vec<SegmentReader>,
        ticket: ConsolidationTicket,
    },
}

#[derive(Debug, Default)]
struct FlushState {
    /// Leases currently held against this context.
    bound: usize,
    exclusive: bool,
    idle: Vec<SegmentContext>,
    pending: Vec<PendingSegment>,
}

/// Everything drained out of a context for flushing.
#[derive(Debug, Default)]
pub(crate) struct FlushBatch {
    pub segments: Vec<SegmentContext>,
    pub pending: Vec<PendingSegment>,
}

/// One generation buffer.
#[derive(Debug, Default)]
pub(crate) struct FlushContext {
    state: Mutex<FlushState>,
    released: Condvar,
    /// Orders inserts against removals within the generation.
    tick: AtomicU64,
    buffered: AtomicUsize,
}

impl FlushContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a segment context.
    ///
    /// `still_active` is evaluated under the context lock; `None` means the
    /// context was rotated out and the caller must retry on the new active
    /// one. Blocks while `count_max` segment contexts are already leased.
    pub fn lease<F>(&self, count_max: usize, still_active: F) -> Option<SegmentContext>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if state.exclusive || !still_active() {
                return None;
            }

            if let Some(segment) = state.idle.pop() {
                state.bound += 1;
                return Some(segment);
            }

            if count_max == 0 || state.bound < count_max {
                state.bound += 1;
                return Some(SegmentContext::new());
            }

            self.released.wait(&mut state);
        }
    }

    /// Register a pending segment while holding no lease.
    ///
    /// Returns the segment back if the context was rotated out.
    pub fn push_pending<F>(
        &self,
        pending: PendingSegment,
        still_active: F,
    ) -> std::result::Result<(), PendingSegment>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        if state.exclusive || !still_active() {
            return Err(pending);
        }
        state.pending.push(pending);
        Ok(())
    }

    /// Return a leased segment context.
    pub fn release(&self, segment: SegmentContext) {
        let mut state = self.state.lock();
        state.idle.push(segment);
        state.bound = state.bound.saturating_sub(1);
        self.released.notify_all();
    }

    /// Stop new leases and wait until every held lease was released, then
    /// take the buffered content. The context stays exclusive until
    /// [`reset`](Self::reset).
    pub fn drain(&self) -> FlushBatch {
        let mut state = self.state.lock();
        state.exclusive = true;
        self.released.notify_all();

        while state.bound > 0 {
            trace!("flush waiting for {} bound transaction(s)", state.bound);
            self.released.wait(&mut state);
        }

        FlushBatch {
            segments: std::mem::take(&mut state.idle),
            pending: std::mem::take(&mut state.pending),
        }
    }

    /// Make the context reusable for a later generation.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.exclusive = false;
        state.idle.clear();
        state.pending.clear();
        self.tick.store(0, Ordering::SeqCst);
        self.buffered.store(0, Ordering::SeqCst);
        self.released.notify_all();
    }

    /// Discard everything buffered without flushing, waiting for bound leases.
    pub fn discard(&self) {
        drop(self.drain());
        self.reset();
    }

    /// Current tick; documents inserted now carry it.
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Reserve a removal tick: documents inserted before it have a tick
    /// `<=` the returned value, documents inserted after have a larger one.
    pub fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst)
    }

    pub fn buffered_docs(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn add_buffered(&self, docs: usize) {
        self.buffered.fetch_add(docs, Ordering::SeqCst);
    }

    pub fn sub_buffered(&self, docs: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(docs))
            });
    }
}
