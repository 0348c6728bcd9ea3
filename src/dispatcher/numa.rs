//! NUMA-partitioned row ranges: `input_size` split evenly across nodes at
//! submission time, each node holding its own `(next_row, last_row)` atomic
//! pair. A worker claims from its own node first, then steals from others
//! in round-robin order, stopping at the first node that still has rows
//! left (spec.md §4.7 "stolen socket bitmask": simplified here to a
//! round-robin scan starting at the caller's own node rather than a literal
//! bitmask, since this port has no real NUMA topology to bias the order
//! against — see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};

struct Range {
    next: AtomicU64,
    last: AtomicU64,
}

pub struct MorselRanges {
    ranges: Vec<Range>,
}

impl MorselRanges {
    pub fn new(total: u64, node_count: usize) -> Self {
        let node_count = node_count.max(1);
        let per_node = total.div_ceil(node_count as u64);
        let ranges = (0..node_count)
            .map(|i| {
                let start = (i as u64 * per_node).min(total);
                let end = ((i as u64 + 1) * per_node).min(total);
                Range { next: AtomicU64::new(start), last: AtomicU64::new(end) }
            })
            .collect();
        Self { ranges }
    }

    /// Claims up to `size` rows, preferring `preferred_node`. Returns the
    /// claimed `[from, to)` or `None` if every node's range is exhausted.
    pub fn claim(&self, preferred_node: usize, size: u64) -> Option<(u64, u64)> {
        let n = self.ranges.len();
        let size = size.max(1);
        for offset in 0..n {
            let idx = (preferred_node + offset) % n;
            let range = &self.ranges[idx];
            loop {
                let cur = range.next.load(Ordering::Acquire);
                let last = range.last.load(Ordering::Acquire);
                if cur >= last {
                    break;
                }
                let take = (last - cur).min(size);
                let new_next = cur + take;
                if range
                    .next
                    .compare_exchange_weak(cur, new_next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some((cur, new_next));
                }
            }
        }
        None
    }
}
