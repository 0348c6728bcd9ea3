//! Hash join (spec.md §4.6, §9): build side materializes into a breaker,
//! `JoinBuild` inserts every row into a shared open-addressing-free chained
//! hash table, `JoinProbe` walks it per probe row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::batch::{Batch, BatchDescription, Value};
use crate::error::Result;
use crate::pipeline::{Breaker, PipelineStarter, Sink};

/// 64-bit bucket-head word: top 4 bits are an OR-accumulated tag over every
/// key hashed into the chain (quick reject before walking it), low 60 bits
/// are `row_index + 1` (0 means empty). Confirmed against spec.md §9's
/// literal "pointer and a 4-bit tag at the top", no reserved middle region.
const TAG_SHIFT: u32 = 60;
const PTR_MASK: u64 = (1u64 << TAG_SHIFT) - 1;

/// The 4-bit value contributed to a bucket's OR-accumulated tag field.
fn tag4(hash: u64) -> u64 {
    hash & 0xf
}

/// Buffers every build-side row pushed to it: one column per build column,
/// plus the matching row's validity. Sorting/compacting the build side is
/// unnecessary since `JoinBuild` addresses rows by their buffered index
/// directly (simplification vs. a lock-free append list: the build phase's
/// batch-append is not the hot CAS path, unlike hash-table insertion).
pub struct JoinBreaker {
    description: Arc<BatchDescription>,
    rows: parking_lot::Mutex<Vec<Vec<Value>>>,
}

impl JoinBreaker {
    pub fn new(description: Arc<BatchDescription>) -> Arc<Self> {
        Arc::new(Self { description, rows: parking_lot::Mutex::new(Vec::new()) })
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn row(&self, idx: usize) -> Vec<Value> {
        self.rows.lock()[idx].clone()
    }
}

impl Sink for JoinBreaker {
    fn push(&self, batch: Batch, _worker_id: usize) -> Result<()> {
        let mut rows = self.rows.lock();
        for r in 0..batch.current_size() {
            if batch.is_row_valid(r) {
                rows.push(batch.get_row(r));
            }
        }
        Ok(())
    }
}

impl Breaker for JoinBreaker {
    fn description(&self) -> Arc<BatchDescription> {
        self.description.clone()
    }

    fn consume_batches(&self, _target: &mut Vec<Batch>) {
        // The build side is consumed by index through `row`/`row_count`,
        // not replayed as batches.
    }

    fn finalize_all(&self) {}
}

/// Chained hash table over build-side row indices. `chain_next[i]` stores
/// `next_row_index + 1` for build row `i` (0 = end of chain).
pub struct JoinHashTable {
    buckets: Vec<AtomicU64>,
    chain_next: Vec<AtomicU64>,
    mask: u64,
}

impl JoinHashTable {
    /// Sizes the table to the next power of two at least double the
    /// expected row count, the way the teacher's other hash structures keep
    /// load factor below 0.5. `Vec<AtomicU64>` is already zeroed on
    /// allocation, so there is no separate "zero the table in parallel"
    /// step to perform here.
    pub fn new(expected_rows: usize) -> Self {
        let mut capacity = 16usize;
        while capacity < expected_rows.saturating_mul(2).max(1) {
            capacity *= 2;
        }
        Self {
            buckets: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            chain_next: (0..expected_rows).map(|_| AtomicU64::new(0)).collect(),
            mask: (capacity - 1) as u64,
        }
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Inserts `row_index` into the chain for `hash`, OR-merging its tag bit
    /// into the bucket head with a CAS retry loop.
    pub fn insert(&self, hash: u64, row_index: usize) {
        let bucket = &self.buckets[self.bucket_index(hash)];
        let tag = tag4(hash) << TAG_SHIFT;
        loop {
            let head = bucket.load(Ordering::Acquire);
            let head_ptr = head & PTR_MASK;
            self.chain_next[row_index].store(head_ptr, Ordering::Relaxed);
            let new_head = (head & !PTR_MASK) | tag | ((row_index as u64 + 1) & PTR_MASK);
            if bucket.compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return;
            }
        }
    }

    /// Returns an iterator over every build row chained into `hash`'s
    /// bucket, short-circuiting to empty if the bucket's OR-accumulated tag
    /// proves no member could match (quick reject, spec.md §9): a probe key
    /// can only be present if every one of its tag bits is set in the
    /// bucket's accumulated tag.
    pub fn probe_chain(&self, hash: u64) -> JoinChainIter<'_> {
        let head = self.buckets[self.bucket_index(hash)].load(Ordering::Acquire);
        let wanted_tag = tag4(hash) << TAG_SHIFT;
        let acc_tag = head & !PTR_MASK;
        let quick_reject = acc_tag & wanted_tag != wanted_tag;
        let next = if quick_reject { 0 } else { head & PTR_MASK };
        JoinChainIter { table: self, next }
    }
}

pub struct JoinChainIter<'a> {
    table: &'a JoinHashTable,
    next: u64,
}

impl Iterator for JoinChainIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == 0 {
            return None;
        }
        let row_index = (self.next - 1) as usize;
        self.next = self.table.chain_next[row_index].load(Ordering::Acquire);
        Some(row_index)
    }
}

/// Small non-cryptographic key hash (FNV-1a) over a tuple of join-key
/// `Value`s, used uniformly by both `JoinBuild` and `JoinProbe`.
pub fn hash_key(values: &[Value]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for v in values {
        let bytes: [u8; 8] = match v {
            Value::I64(x) => x.to_le_bytes(),
            Value::U64(x) => x.to_le_bytes(),
            Value::F64(x) => x.to_bits().to_le_bytes(),
            Value::Bool(x) => (*x as u64).to_le_bytes(),
        };
        for b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    h
}

/// Drives the build phase: one morsel per build row, inserting its key hash
/// into the shared `JoinHashTable`. Runs after the build-side pipeline has
/// fully populated `breaker` (a `QepBuilder` dependency edge enforces that).
pub struct JoinBuild {
    pub breaker: Arc<JoinBreaker>,
    pub key_columns: Vec<usize>,
    pub table: Arc<JoinHashTable>,
}

impl PipelineStarter for JoinBuild {
    fn input_size(&self) -> u64 {
        self.breaker.row_count() as u64
    }

    fn execute_range(&self, from: u64, to: u64, _worker_id: usize) -> Result<()> {
        for row_index in from..to {
            let row = self.breaker.row(row_index as usize);
            let key: Vec<Value> = self.key_columns.iter().map(|&c| row[c]).collect();
            self.table.insert(hash_key(&key), row_index as usize);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub enum Side {
    Build,
    Probe,
}

#[derive(Clone, Copy)]
pub struct OutputColumnInfo {
    pub side: Side,
    pub index: usize,
}

/// Probe-side sink: for every pushed row, hashes its join key, walks the
/// matching chain verifying exact key equality (the tag only rules matches
/// out, never in), and emits one output row per match.
pub struct JoinProbe {
    pub breaker: Arc<JoinBreaker>,
    pub table: Arc<JoinHashTable>,
    pub probe_key_columns: Vec<usize>,
    pub build_key_columns: Vec<usize>,
    pub output_columns: Vec<OutputColumnInfo>,
    pub output_description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
}

impl Sink for JoinProbe {
    fn push(&self, batch: Batch, worker_id: usize) -> Result<()> {
        let max_size = batch.max_size().max(1);
        let mut out = Batch::new(self.output_description.clone(), max_size);
        for r in 0..batch.current_size() {
            if !batch.is_row_valid(r) {
                continue;
            }
            let probe_row = batch.get_row(r);
            let probe_key: Vec<Value> = self.probe_key_columns.iter().map(|&c| probe_row[c]).collect();
            let hash = hash_key(&probe_key);
            for build_idx in self.table.probe_chain(hash) {
                let build_row = self.breaker.row(build_idx);
                let build_key: Vec<Value> = self.build_key_columns.iter().map(|&c| build_row[c]).collect();
                if build_key != probe_key {
                    continue;
                }
                let out_row: Vec<Value> = self
                    .output_columns
                    .iter()
                    .map(|info| match info.side {
                        Side::Build => build_row[info.index],
                        Side::Probe => probe_row[info.index],
                    })
                    .collect();
                if !out.add_row_if_possible(&out_row) {
                    let full = std::mem::replace(&mut out, Batch::new(self.output_description.clone(), max_size));
                    self.next.push(full, worker_id)?;
                    out.add_row_if_possible(&out_row);
                }
            }
        }
        if out.current_size() > 0 {
            self.next.push(out, worker_id)?;
        }
        Ok(())
    }
}
