//! Registry of in-flight consolidations.
//!
//! Every consolidation claims its candidate segments here before merging.
//! A claim lasts until the merged segment is committed or the merge is
//! abandoned, so a segment takes part in at most one consolidation at a time.
//! Claims are held by a [`ConsolidationTicket`] and released when it drops.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::index::meta::SegmentMeta;
use crate::index::policy::ConsolidatingSegments;

#[derive(Debug, Default)]
pub(crate) struct ConsolidatingSet {
    claimed: HashSet<String>,
    /// Bumped by `clear()`; tickets of an older epoch are stale.
    epoch: u64,
    /// Merges that have not yet reached a terminal state.
    in_flight: BTreeSet<u64>,
    next_id: u64,
}

impl ConsolidatingSet {
    pub fn segments(&self) -> ConsolidatingSegments<'_> {
        ConsolidatingSegments::new(&self.claimed)
    }

    pub fn is_claimed(&self, segment: &SegmentMeta) -> bool {
        self.claimed.contains(&segment.name)
    }
}

/// Shared registry of claimed segments and running merges.
#[derive(Debug, Default)]
pub(crate) struct Consolidations {
    state: Mutex<ConsolidatingSet>,
    finished: Condvar,
}

impl Consolidations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock(&self) -> MutexGuard<'_, ConsolidatingSet> {
        self.state.lock()
    }

    /// Claim `candidates` under an already held lock.
    ///
    /// Returns `None` without side effects if any candidate is already claimed.
    pub fn register(
        self: &Arc<Self>,
        state: &mut ConsolidatingSet,
        candidates: &[SegmentMeta],
    ) -> Option<ConsolidationTicket> {
        if candidates.iter().any(|s| state.is_claimed(s)) {
            return None;
        }

        let names: Vec<String> = candidates.iter().map(|s| s.name.clone()).collect();
        state.claimed.extend(names.iter().cloned());

        let id = state.next_id;
        state.next_id += 1;
        state.in_flight.insert(id);

        debug!("registered consolidation #{id} of {names:?}");

        Some(ConsolidationTicket {
            registry: Arc::clone(self),
            id,
            names,
            epoch: state.epoch,
            finished: false,
        })
    }

    /// Identifier the next registered merge will get.
    pub fn next_id(&self) -> u64 {
        self.state.lock().next_id
    }

    /// Block until every merge registered before `id` reached a terminal state.
    pub fn wait_before(&self, id: u64) {
        let mut state = self.state.lock();
        while state.in_flight.first().is_some_and(|&first| first < id) {
            self.finished.wait(&mut state);
        }
    }

    /// Drop every claim and invalidate outstanding tickets.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        if !state.claimed.is_empty() {
            debug!("aborting {} claimed segment(s)", state.claimed.len());
        }
        state.claimed.clear();
        state.epoch += 1;
    }

    #[cfg(test)]
    pub fn claimed_len(&self) -> usize {
        self.state.lock().claimed.len()
    }
}

/// Claim on a set of candidate segments.
#[derive(Debug)]
pub(crate) struct ConsolidationTicket {
    registry: Arc<Consolidations>,
    id: u64,
    names: Vec<String>,
    epoch: u64,
    finished: bool,
}

impl ConsolidationTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the index was cleared since the claim was made.
    pub fn is_stale(&self) -> bool {
        self.registry.lock().epoch != self.epoch
    }

    /// The merge reached a terminal state; the claim itself stays until drop.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut state = self.registry.lock();
        state.in_flight.remove(&self.id);
        self.registry.finished.notify_all();
    }
}

impl Drop for ConsolidationTicket {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        state.in_flight.remove(&self.id);
        if state.epoch == self.epoch {
            for name in &self.names {
                state.claimed.remove(name);
            }
        }
        self.registry.finished.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn segments(names: &[&str]) -> Vec<SegmentMeta> {
        names.iter().map(|n| SegmentMeta::new(*n, "1.0")).collect()
    }

    #[test]
    fn test_claims_are_exclusive() {
        let registry = Consolidations::new();

        let ticket = {
            let mut state = registry.lock();
            registry.register(&mut state, &segments(&["_1", "_2"])).unwrap()
        };
        {
            let mut state = registry.lock();
            assert!(registry.register(&mut state, &segments(&["_2", "_3"])).is_none());
            assert!(state.segments().contains(&SegmentMeta::new("_1", "1.0")));
        }
        assert_eq!(registry.claimed_len(), 2);

        drop(ticket);
        assert_eq!(registry.claimed_len(), 0);
    }

    #[test]
    fn test_abort_all_invalidates_tickets() {
        let registry = Consolidations::new();
        let ticket = {
            let mut state = registry.lock();
            registry.register(&mut state, &segments(&["_1"])).unwrap()
        };

        registry.abort_all();
        assert!(ticket.is_stale());
        assert_eq!(registry.claimed_len(), 0);

        let fresh = {
            let mut state = registry.lock();
            registry.register(&mut state, &segments(&["_1"])).unwrap()
        };
        drop(ticket);
        assert_eq!(registry.claimed_len(), 1);
        drop(fresh);
    }

    #[test]
    fn test_wait_before_returns_once_finished() {
        let registry = Consolidations::new();
        let mut ticket = {
            let mut state = registry.lock();
            registry.register(&mut state, &segments(&["_1"])).unwrap()
        };
        let limit = registry.next_id();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.wait_before(limit))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        ticket.finish();
        waiter.join().unwrap();
        assert_eq!(registry.claimed_len(), 1);
    }
}
