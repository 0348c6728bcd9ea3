//! Sort (spec.md §4.6, §9): each worker sorts its own batches into runs as
//! they arrive (`SortBreaker`), then a single-morsel `SortOperator` merges
//! every run via a k-way heap merge.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::batch::{compare_values, Batch, BatchDescription, Value};
use crate::error::Result;
use crate::pipeline::{Breaker, PipelineStarter, Sink};

/// Accumulates pushed batches per worker, sorting each one immediately on
/// arrival (an introsort over row indices, via `Batch::sort_by_column`) and
/// packing any partial (non-full) batch so a worker's run stays as few
/// batches as possible.
pub struct SortBreaker {
    description: Arc<BatchDescription>,
    sort_column: usize,
    runs: parking_lot::Mutex<HashMap<usize, Vec<Batch>>>,
}

impl SortBreaker {
    pub fn new(description: Arc<BatchDescription>, sort_column: usize) -> Arc<Self> {
        Arc::new(Self { description, sort_column, runs: parking_lot::Mutex::new(HashMap::new()) })
    }

    /// Takes ownership of every worker's sorted runs, for the merge stage.
    pub fn take_runs(&self) -> Vec<Vec<Batch>> {
        self.runs.lock().drain().map(|(_, v)| v).collect()
    }
}

impl Sink for SortBreaker {
    fn push(&self, mut batch: Batch, worker_id: usize) -> Result<()> {
        batch.sort_by_column(self.sort_column);
        let mut runs = self.runs.lock();
        let worker_runs = runs.entry(worker_id).or_default();

        if let Some(last) = worker_runs.last_mut() {
            if !last.is_full() && last.current_size() + batch.current_size() <= last.max_size() {
                for r in 0..batch.current_size() {
                    last.add_row_if_possible(&batch.get_row(r));
                }
                last.sort_by_column(self.sort_column);
                return Ok(());
            }
        }
        worker_runs.push(batch);
        Ok(())
    }
}

impl Breaker for SortBreaker {
    fn description(&self) -> Arc<BatchDescription> {
        self.description.clone()
    }

    fn consume_batches(&self, target: &mut Vec<Batch>) {
        let mut runs = self.runs.lock();
        for (_, mut v) in runs.drain() {
            target.append(&mut v);
        }
    }

    fn finalize_all(&self) {
        // Every pushed batch is already sorted on arrival; nothing left to
        // flush at pipeline completion.
    }
}

#[derive(PartialEq)]
struct ValueKey(Value);

impl Eq for ValueKey {}
impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        compare_values(&self.0, &other.0)
    }
}

struct RunCursor {
    batches: Vec<Batch>,
    batch_idx: usize,
    row_idx: usize,
}

impl RunCursor {
    fn current(&self, sort_column: usize) -> Option<Value> {
        let batch = self.batches.get(self.batch_idx)?;
        if self.row_idx >= batch.current_size() {
            return None;
        }
        Some(batch.get(self.row_idx, sort_column))
    }

    fn current_row(&self) -> Vec<Value> {
        self.batches[self.batch_idx].get_row(self.row_idx)
    }

    fn advance(&mut self) {
        self.row_idx += 1;
        while self.batch_idx < self.batches.len() && self.row_idx >= self.batches[self.batch_idx].current_size() {
            self.batch_idx += 1;
            self.row_idx = 0;
        }
    }
}

/// Auto-flushing output wrapper: accumulates rows into one batch at a time,
/// pushing downstream whenever it fills (spec.md "IntermediateHelper").
pub struct IntermediateHelper {
    description: Arc<BatchDescription>,
    next: Arc<dyn Sink>,
    worker_id: usize,
    current: Batch,
}

impl IntermediateHelper {
    pub fn new(description: Arc<BatchDescription>, max_size: usize, next: Arc<dyn Sink>, worker_id: usize) -> Self {
        let current = Batch::new(description.clone(), max_size);
        Self { description, next, worker_id, current }
    }

    pub fn emit(&mut self, row: &[Value]) -> Result<()> {
        if !self.current.add_row_if_possible(row) {
            let max_size = self.current.max_size();
            let full = std::mem::replace(&mut self.current, Batch::new(self.description.clone(), max_size));
            self.next.push(full, self.worker_id)?;
            self.current.add_row_if_possible(row);
        }
        Ok(())
    }

    pub fn flush(mut self) -> Result<()> {
        if self.current.current_size() > 0 {
            self.next.push(self.current, self.worker_id)?;
        }
        Ok(())
    }
}

/// Merges every worker's sorted runs via a k-way heap merge. Single-morsel:
/// the merge itself has no useful row-range axis to NUMA-partition over, so
/// it always runs in immediate mode (spec.md "single-morsel/immediate-mode"
/// for intermediate-result operators).
pub struct SortOperator {
    pub breaker: Arc<SortBreaker>,
    pub sort_column: usize,
    pub description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
    pub output_batch_size: usize,
}

impl PipelineStarter for SortOperator {
    fn input_size(&self) -> u64 {
        1
    }

    fn min_morsel_size(&self) -> u64 {
        1
    }

    fn execute_range(&self, _from: u64, _to: u64, worker_id: usize) -> Result<()> {
        let runs = self.breaker.take_runs();
        let mut cursors: Vec<RunCursor> =
            runs.into_iter().map(|batches| RunCursor { batches, batch_idx: 0, row_idx: 0 }).collect();

        let mut heap: BinaryHeap<Reverse<(ValueKey, usize)>> = BinaryHeap::new();
        for (i, c) in cursors.iter().enumerate() {
            if let Some(v) = c.current(self.sort_column) {
                heap.push(Reverse((ValueKey(v), i)));
            }
        }

        let mut out = IntermediateHelper::new(self.description.clone(), self.output_batch_size, self.next.clone(), worker_id);
        while let Some(Reverse((_, i))) = heap.pop() {
            let row = cursors[i].current_row();
            out.emit(&row)?;
            cursors[i].advance();
            if let Some(v) = cursors[i].current(self.sort_column) {
                heap.push(Reverse((ValueKey(v), i)));
            }
        }
        out.flush()
    }
}
