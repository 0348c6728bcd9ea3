// Eviction policies ("partitions") over the set of resident pages.
//
// A partition is a pure consumer of `PageStateView` — it never owns the
// page-state array itself, only a reference into the cache that created it.
// This keeps the cache -> partition edge a plain borrow instead of a cycle:
// the cache hands the partition a view of itself, the partition hands back
// eviction candidates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::page::{self, PageId, PageState, STATE_EVICTED, STATE_MARKED, STATE_UNLOCKED};

/// Eviction batches never exceed 64 candidates so that the per-candidate
/// dirty mask returned alongside them fits in a `u64` (spec.md §4.1).
pub const MAX_EVICTION_BATCH: usize = 64;

/// The read-only surface of the cache that a partition needs to pick
/// victims: raw access to page state, nothing else.
pub trait PageStateView: Send + Sync {
    fn page_state(&self, pid: PageId) -> &PageState;
    fn resident_pages(&self) -> Vec<PageId>;
}

/// A victim batch: candidate page ids plus a bitmask of which of them were
/// dirty (and therefore already flushed by the time the policy returns).
pub struct EvictionBatch {
    pub candidates: Vec<PageId>,
    pub dirty_mask: u64,
}

/// Pluggable victim-selection strategy. `VMCache` drives the CAS-to-`Locked`,
/// `madvise`, and resident-set bookkeeping common to every policy; the
/// partition only decides *which* pages to offer up.
pub trait EvictionPolicy: Send + Sync {
    /// Propose up to `batch_size` (capped at `MAX_EVICTION_BATCH`) resident
    /// pages as eviction candidates.
    fn get_eviction_candidates(&self, view: &dyn PageStateView, batch_size: usize) -> EvictionBatch;

    /// Called when a page transitions out of `Marked`/`Unlocked` into a
    /// shared or exclusive latch, so scan-aware policies can track it.
    fn on_ref(&self, _pid: PageId, _scan: bool) {}

    fn name(&self) -> &'static str;
}

fn resident_snapshot(view: &dyn PageStateView) -> Vec<PageId> {
    view.resident_pages()
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Second-chance sweep: `Unlocked` pages are softly `Marked` on a first
/// pass; `Marked` or `Faulted` pages become candidates on the next sweep
/// that reaches them.
pub struct ClockPolicy {
    cursor: AtomicUsize,
}

impl ClockPolicy {
    pub fn new() -> Self {
        Self { cursor: AtomicUsize::new(0) }
    }
}

impl Default for ClockPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for ClockPolicy {
    fn get_eviction_candidates(&self, view: &dyn PageStateView, batch_size: usize) -> EvictionBatch {
        let resident = resident_snapshot(view);
        let batch_size = batch_size.min(MAX_EVICTION_BATCH);
        let mut candidates = Vec::with_capacity(batch_size);
        let mut dirty_mask = 0u64;
        if resident.is_empty() {
            return EvictionBatch { candidates, dirty_mask };
        }

        // Each worker claims a non-overlapping sub-range of the sweep via a
        // fetch_add on the shared cursor, so concurrent sweeps don't repeat
        // work (spec.md §5 "Eviction clock cursor").
        let start = self.cursor.fetch_add(resident.len(), Ordering::Relaxed);
        for i in 0..resident.len() {
            if candidates.len() >= batch_size {
                break;
            }
            let pid = resident[(start + i) % resident.len()];
            let ps = view.page_state(pid);
            let s = ps.load(std::sync::atomic::Ordering::Acquire);
            match page::mode(s) {
                STATE_UNLOCKED => {
                    let marked = (s & !0xffu64) | STATE_MARKED;
                    let _ = ps.compare_exchange(s, marked, std::sync::atomic::Ordering::AcqRel, std::sync::atomic::Ordering::Relaxed);
                }
                STATE_MARKED => {
                    candidates.push(pid);
                    if page::is_dirty(s) {
                        dirty_mask |= 1 << (candidates.len() - 1);
                    }
                }
                _ => {}
            }
        }
        EvictionBatch { candidates, dirty_mask }
    }

    fn name(&self) -> &'static str {
        "clock"
    }
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Uniform sampling over the resident set. Simpler than clock, no shared
/// cursor state, adequate when access patterns defeat recency-based
/// heuristics anyway.
pub struct RandomPolicy {
    seed: AtomicUsize,
}

impl RandomPolicy {
    pub fn new() -> Self {
        Self { seed: AtomicUsize::new(0x2545F4914F6CDD1D) }
    }

    fn next(&self) -> usize {
        // xorshift, good enough for victim sampling.
        let mut x = self.seed.load(Ordering::Relaxed) as u64;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed.store(x as usize, Ordering::Relaxed);
        x as usize
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for RandomPolicy {
    fn get_eviction_candidates(&self, view: &dyn PageStateView, batch_size: usize) -> EvictionBatch {
        let resident = resident_snapshot(view);
        let batch_size = batch_size.min(MAX_EVICTION_BATCH);
        let mut candidates = Vec::with_capacity(batch_size);
        let mut dirty_mask = 0u64;
        if resident.is_empty() {
            return EvictionBatch { candidates, dirty_mask };
        }
        for _ in 0..batch_size.saturating_mul(4) {
            if candidates.len() >= batch_size {
                break;
            }
            let pid = resident[self.next() % resident.len()];
            let ps = view.page_state(pid);
            let s = ps.load(std::sync::atomic::Ordering::Acquire);
            if matches!(page::mode(s), STATE_UNLOCKED | STATE_MARKED) && !candidates.contains(&pid) {
                candidates.push(pid);
                if page::is_dirty(s) {
                    dirty_mask |= 1 << (candidates.len() - 1);
                }
            }
        }
        EvictionBatch { candidates, dirty_mask }
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// MRU
// ---------------------------------------------------------------------------

/// Evicts the most-recently-scanned page first. Intended for sequential
/// scans that would otherwise thrash an LRU/clock cache with pages that are
/// never revisited; falls back to clock behavior when the ring is empty
/// (e.g. nothing has been scanned yet).
pub struct MruPolicy {
    ring: RwLock<Vec<PageId>>,
    ring_capacity: usize,
    fallback: ClockPolicy,
}

impl MruPolicy {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Vec::with_capacity(ring_capacity)),
            ring_capacity,
            fallback: ClockPolicy::new(),
        }
    }
}

impl EvictionPolicy for MruPolicy {
    fn get_eviction_candidates(&self, view: &dyn PageStateView, batch_size: usize) -> EvictionBatch {
        let batch_size = batch_size.min(MAX_EVICTION_BATCH);
        let mut candidates = Vec::with_capacity(batch_size);
        let mut dirty_mask = 0u64;
        {
            let ring = self.ring.read().unwrap();
            for &pid in ring.iter().rev() {
                if candidates.len() >= batch_size {
                    break;
                }
                let ps = view.page_state(pid);
                let s = ps.load(std::sync::atomic::Ordering::Acquire);
                if matches!(page::mode(s), STATE_UNLOCKED | STATE_MARKED) {
                    candidates.push(pid);
                    if page::is_dirty(s) {
                        dirty_mask |= 1 << (candidates.len() - 1);
                    }
                }
            }
        }
        if candidates.is_empty() {
            return self.fallback.get_eviction_candidates(view, batch_size);
        }
        EvictionBatch { candidates, dirty_mask }
    }

    fn on_ref(&self, pid: PageId, scan: bool) {
        if !scan {
            return;
        }
        let mut ring = self.ring.write().unwrap();
        if ring.len() >= self.ring_capacity {
            ring.remove(0);
        }
        ring.push(pid);
    }

    fn name(&self) -> &'static str {
        "mru"
    }
}

/// Tracks the resident set as a plain concurrent hash set; every
/// `EvictionPolicy` above is handed a `PageStateView` that is backed by one
/// of these, kept by `VMCache`.
pub struct ResidentSet {
    inner: RwLock<HashSet<PageId>>,
}

impl ResidentSet {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashSet::new()) }
    }

    pub fn insert(&self, pid: PageId) {
        self.inner.write().unwrap().insert(pid);
    }

    pub fn remove(&self, pid: PageId) {
        self.inner.write().unwrap().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PageId> {
        self.inner.read().unwrap().iter().copied().collect()
    }
}

impl Default for ResidentSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EvictionPolicyKind {
    Clock,
    Random,
    Mru,
}

pub fn create_policy(kind: EvictionPolicyKind, mru_ring_capacity: usize) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Clock => Box::new(ClockPolicy::new()),
        EvictionPolicyKind::Random => Box::new(RandomPolicy::new()),
        EvictionPolicyKind::Mru => Box::new(MruPolicy::new(mru_ring_capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering as StdOrdering;

    struct FakeView {
        states: Vec<PageState>,
        resident: Vec<PageId>,
    }

    impl PageStateView for FakeView {
        fn page_state(&self, pid: PageId) -> &PageState {
            &self.states[pid as usize]
        }
        fn resident_pages(&self) -> Vec<PageId> {
            self.resident.clone()
        }
    }

    #[test]
    fn clock_marks_then_evicts() {
        let states: Vec<PageState> = (0..4).map(|_| PageState::new(STATE_UNLOCKED)).collect();
        let view = FakeView { states, resident: vec![0, 1, 2, 3] };
        let policy = ClockPolicy::new();
        let first = policy.get_eviction_candidates(&view, 4);
        assert!(first.candidates.is_empty(), "first sweep only marks");
        for pid in 0..4u64 {
            assert_eq!(page::mode(view.page_state(pid).load(StdOrdering::Acquire)), STATE_MARKED);
        }
        let second = policy.get_eviction_candidates(&view, 4);
        assert_eq!(second.candidates.len(), 4);
    }

    #[test]
    fn eviction_batch_never_exceeds_64() {
        let states: Vec<PageState> = (0..200).map(|_| PageState::new(STATE_MARKED)).collect();
        let resident: Vec<PageId> = (0..200).collect();
        let view = FakeView { states, resident };
        let policy = ClockPolicy::new();
        let batch = policy.get_eviction_candidates(&view, 200);
        assert!(batch.candidates.len() <= MAX_EVICTION_BATCH);
    }
}
