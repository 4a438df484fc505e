//! Consolidation policies.
//!
//! A policy looks at the committed [`IndexMeta`] and appends the segments it
//! wants merged to the candidate list. Segments already claimed by another
//! in-flight consolidation are reported through [`ConsolidatingSegments`] and
//! must not be selected; the writer rejects a selection containing one.

use std::collections::{BTreeMap, HashSet};

use crate::index::meta::{IndexMeta, SegmentMeta};

/// Segments currently claimed by in-flight consolidations.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidatingSegments<'a> {
    names: &'a HashSet<String>,
}

impl<'a> ConsolidatingSegments<'a> {
    pub(crate) fn new(names: &'a HashSet<String>) -> Self {
        ConsolidatingSegments { names }
    }

    pub fn contains(&self, segment: &SegmentMeta) -> bool {
        self.names.contains(&segment.name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.names.iter().map(String::as_str)
    }
}

/// Selects segments to merge.
pub trait ConsolidationPolicy: Send + Sync {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    );
}

impl<F> ConsolidationPolicy for F
where
    F: Fn(&mut Vec<SegmentMeta>, &IndexMeta, &ConsolidatingSegments<'_>) + Send + Sync,
{
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        self(candidates, meta, consolidating)
    }
}

fn eligible<'m>(
    meta: &'m IndexMeta,
    consolidating: &ConsolidatingSegments<'_>,
) -> impl Iterator<Item = &'m SegmentMeta> {
    meta.segments.iter().filter(|s| !consolidating.contains(s))
}

/// Every unclaimed segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidateAll;

impl ConsolidationPolicy for ConsolidateAll {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        candidates.extend(eligible(meta, consolidating).cloned());
    }
}

/// Up to `max` unclaimed segments, in index order.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidateCount {
    pub max: usize,
}

impl ConsolidationPolicy for ConsolidateCount {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        candidates.extend(eligible(meta, consolidating).take(self.max).cloned());
    }
}

/// Segments whose live-document ratio is at or below `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidateDocsLive {
    pub threshold: f64,
}

impl ConsolidationPolicy for ConsolidateDocsLive {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        candidates.extend(
            eligible(meta, consolidating)
                .filter(|s| s.docs_count > 0)
                .filter(|s| (s.live_docs_count as f64 / s.docs_count as f64) <= self.threshold)
                .cloned(),
        );
    }
}

/// Segments no larger than `threshold` times the average segment size.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidateBytes {
    pub threshold: f64,
}

impl ConsolidationPolicy for ConsolidateBytes {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        if meta.segments.is_empty() {
            return;
        }

        let total: u64 = meta.segments.iter().map(|s| s.size).sum();
        let limit = total as f64 / meta.segments.len() as f64 * self.threshold;

        candidates.extend(
            eligible(meta, consolidating)
                .filter(|s| s.size as f64 <= limit)
                .cloned(),
        );
    }
}

/// Size-tiered merging.
///
/// Segments are grouped into tiers by `size_ratio` steps above `floor_bytes`.
/// Segments whose removed-document ratio exceeds `deletion_threshold` are
/// merged first; otherwise the most crowded tier with at least
/// `min_segments` segments is merged, smallest first, within
/// `segments_per_merge` and `max_merged_bytes`.
#[derive(Debug, Clone)]
pub struct TieredPolicy {
    pub segments_per_merge: usize,
    pub max_merged_bytes: u64,
    pub min_segments: usize,
    pub size_ratio: f64,
    pub floor_bytes: u64,
    pub deletion_threshold: f64,
}

impl Default for TieredPolicy {
    fn default() -> Self {
        TieredPolicy {
            segments_per_merge: 10,
            max_merged_bytes: 5 * 1024 * 1024 * 1024,
            min_segments: 2,
            size_ratio: 4.0,
            floor_bytes: 2 * 1024 * 1024,
            deletion_threshold: 0.3,
        }
    }
}

impl TieredPolicy {
    fn tier(&self, size: u64) -> u32 {
        if size <= self.floor_bytes || self.size_ratio <= 1.0 {
            return 0;
        }
        let steps = (size as f64 / self.floor_bytes.max(1) as f64).ln() / self.size_ratio.ln();
        steps.floor() as u32 + 1
    }

    /// Take segments smallest first while they fit the merge limits.
    fn take_fitting<'m>(
        &self,
        segments: impl Iterator<Item = &'m SegmentMeta>,
    ) -> Vec<SegmentMeta> {
        let mut selected = Vec::new();
        let mut bytes = 0u64;

        for segment in segments {
            if selected.len() >= self.segments_per_merge {
                break;
            }
            let live_bytes = live_size(segment);
            if !selected.is_empty() && bytes + live_bytes > self.max_merged_bytes {
                break;
            }
            bytes += live_bytes;
            selected.push(segment.clone());
        }

        selected
    }
}

fn live_size(segment: &SegmentMeta) -> u64 {
    if segment.docs_count == 0 {
        return 0;
    }
    (segment.size as f64 * segment.live_docs_count as f64 / segment.docs_count as f64) as u64
}

fn removed_ratio(segment: &SegmentMeta) -> f64 {
    if segment.docs_count == 0 {
        return 0.0;
    }
    1.0 - segment.live_docs_count as f64 / segment.docs_count as f64
}

impl ConsolidationPolicy for TieredPolicy {
    fn select(
        &self,
        candidates: &mut Vec<SegmentMeta>,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments<'_>,
    ) {
        let mut segments: Vec<&SegmentMeta> = eligible(meta, consolidating).collect();
        segments.sort_by_key(|s| live_size(s));

        let mut heavy: Vec<&SegmentMeta> = segments
            .iter()
            .copied()
            .filter(|s| removed_ratio(s) > self.deletion_threshold)
            .collect();
        if !heavy.is_empty() {
            heavy.sort_by(|a, b| removed_ratio(b).total_cmp(&removed_ratio(a)));
            candidates.extend(self.take_fitting(heavy.into_iter()));
            return;
        }

        let mut tiers: BTreeMap<u32, Vec<&SegmentMeta>> = BTreeMap::new();
        for segment in segments {
            tiers.entry(self.tier(live_size(segment))).or_default().push(segment);
        }

        let crowded = tiers
            .into_values()
            .filter(|tier| tier.len() >= self.min_segments.max(2))
            .max_by_key(Vec::len);

        if let Some(tier) = crowded {
            let selected = self.take_fitting(tier.into_iter());
            if selected.len() >= self.min_segments.max(2) {
                candidates.extend(selected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str, docs: u64, live: u64, size: u64) -> SegmentMeta {
        let mut meta = SegmentMeta::new(name, "1.0");
        meta.docs_count = docs;
        meta.live_docs_count = live;
        meta.size = size;
        meta
    }

    fn index(segments: Vec<SegmentMeta>) -> IndexMeta {
        IndexMeta {
            generation: 1,
            segments_counter: segments.len() as u64,
            segments,
            payload: None,
        }
    }

    fn names(candidates: &[SegmentMeta]) -> Vec<&str> {
        candidates.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_builtin_policies_skip_claimed() {
        let meta = index(vec![
            segment("_1", 10, 10, 100),
            segment("_2", 10, 2, 100),
            segment("_3", 10, 10, 1000),
        ]);
        let claimed: HashSet<String> = ["_1".to_string()].into_iter().collect();
        let consolidating = ConsolidatingSegments::new(&claimed);

        let mut out = Vec::new();
        ConsolidateAll.select(&mut out, &meta, &consolidating);
        assert_eq!(names(&out), vec!["_2", "_3"]);

        let mut out = Vec::new();
        ConsolidateCount { max: 1 }.select(&mut out, &meta, &consolidating);
        assert_eq!(names(&out), vec!["_2"]);

        let mut out = Vec::new();
        ConsolidateDocsLive { threshold: 0.5 }.select(&mut out, &meta, &consolidating);
        assert_eq!(names(&out), vec!["_2"]);

        let mut out = Vec::new();
        ConsolidateBytes { threshold: 1.0 }.select(&mut out, &meta, &consolidating);
        assert_eq!(names(&out), vec!["_2"]);
    }

    #[test]
    fn test_closure_policy() {
        let meta = index(vec![segment("_1", 1, 1, 1), segment("_2", 1, 1, 1)]);
        let claimed = HashSet::new();
        let policy =
            |out: &mut Vec<SegmentMeta>, meta: &IndexMeta, _: &ConsolidatingSegments<'_>| {
                out.push(meta.segments[1].clone());
            };

        let mut out = Vec::new();
        policy.select(&mut out, &meta, &ConsolidatingSegments::new(&claimed));
        assert_eq!(names(&out), vec!["_2"]);
    }

    #[test]
    fn test_tiered_policy_merges_crowded_tier() {
        let policy = TieredPolicy {
            segments_per_merge: 3,
            floor_bytes: 1000,
            ..Default::default()
        };
        let meta = index(vec![
            segment("_1", 10, 10, 500),
            segment("_2", 10, 10, 100),
            segment("_3", 10, 10, 300),
            segment("_4", 10, 10, 200),
            segment("_5", 10, 10, 1_000_000),
        ]);
        let claimed = HashSet::new();

        let mut out = Vec::new();
        policy.select(&mut out, &meta, &ConsolidatingSegments::new(&claimed));
        assert_eq!(names(&out), vec!["_2", "_4", "_3"]);
    }

    #[test]
    fn test_tiered_policy_prefers_removals() {
        let policy = TieredPolicy::default();
        let meta = index(vec![
            segment("_1", 10, 10, 100),
            segment("_2", 10, 1, 100),
            segment("_3", 10, 10, 100),
        ]);
        let claimed = HashSet::new();

        let mut out = Vec::new();
        policy.select(&mut out, &meta, &ConsolidatingSegments::new(&claimed));
        assert_eq!(names(&out), vec!["_2"]);
    }
}
