//! Scan-family operators and the generic aggregation contract (spec.md
//! §4.6).

use std::sync::Arc;

use crate::batch::{Batch, BatchDescription, Value};
use crate::btree::CompositeKey;
use crate::catalog::{TableHandle, PK_WIDTH};
use crate::column::ColumnHelper;
use crate::error::Result;
use crate::pipeline::{PipelineStarter, Sink};

const MORSEL_BATCH_ROWS: usize = 1024;

/// One typed column accessor, so operators can hold a homogeneous
/// projection list over a table's heterogeneously-typed columns.
pub enum TypedColumn {
    I64(ColumnHelper<i64>),
    U64(ColumnHelper<u64>),
    F64(ColumnHelper<f64>),
    Bool(ColumnHelper<bool>),
}

impl TypedColumn {
    pub fn value(&self, row: u64) -> Result<Value> {
        Ok(match self {
            TypedColumn::I64(c) => Value::I64(c.value(row)?),
            TypedColumn::U64(c) => Value::U64(c.value(row)?),
            TypedColumn::F64(c) => Value::F64(c.value(row)?),
            TypedColumn::Bool(c) => Value::Bool(c.value(row)?),
        })
    }

    pub fn set_value(&self, row: u64, value: Value) -> Result<()> {
        match (self, value) {
            (TypedColumn::I64(c), Value::I64(v)) => c.set_value(row, v),
            (TypedColumn::U64(c), Value::U64(v)) => c.set_value(row, v),
            (TypedColumn::F64(c), Value::F64(v)) => c.set_value(row, v),
            (TypedColumn::Bool(c), Value::Bool(v)) => c.set_value(row, v),
            _ => Err(crate::error::DbError::Execution("column/value type mismatch in update".into())),
        }
    }

    pub fn open(table: &TableHandle, name: &str) -> Result<Self> {
        let ty = table
            .columns()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.ty)
            .ok_or_else(|| crate::error::DbError::Storage(format!("no column {name}")))?;
        Ok(match ty {
            crate::catalog::ColumnType::I64 => TypedColumn::I64(table.column_i64(name)?),
            crate::catalog::ColumnType::U64 => TypedColumn::U64(table.column_u64(name)?),
            crate::catalog::ColumnType::F64 => TypedColumn::F64(table.column_f64(name)?),
            crate::catalog::ColumnType::Bool => TypedColumn::Bool(table.column_bool(name)?),
        })
    }
}

fn flush_if_full(
    batch: &mut Batch,
    values: &[Value],
    description: &Arc<BatchDescription>,
    next: &Arc<dyn Sink>,
    worker_id: usize,
) -> Result<()> {
    if !batch.add_row_if_possible(values) {
        let max_size = batch.max_size();
        let full = std::mem::replace(batch, Batch::new(description.clone(), max_size));
        next.push(full, worker_id)?;
        batch.add_row_if_possible(values);
    }
    Ok(())
}

/// Iterates N output columns with N value lookups per row, filling a batch
/// row by row; flushes on fill and at the end of the morsel. Only visible
/// rows (per the table's visibility tree) are emitted.
pub struct Scan {
    pub table: Arc<TableHandle>,
    pub projection: Vec<TypedColumn>,
    pub description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
}

impl PipelineStarter for Scan {
    fn input_size(&self) -> u64 {
        self.table.cardinality()
    }

    fn execute_range(&self, from: u64, to: u64, worker_id: usize) -> Result<()> {
        let mut batch = Batch::new(self.description.clone(), MORSEL_BATCH_ROWS);
        for row in from..to {
            if !self.table.is_visible(row)? {
                continue;
            }
            let values: Vec<Value> = self.projection.iter().map(|c| c.value(row)).collect::<Result<_>>()?;
            flush_if_full(&mut batch, &values, &self.description, &self.next, worker_id)?;
        }
        if batch.current_size() > 0 {
            self.next.push(batch, worker_id)?;
        }
        Ok(())
    }
}

/// Same as `Scan`, plus a predicate evaluated per row over a separate set of
/// filter columns (spec.md: "output columns are separately iterated and
/// advanced only when emitting").
pub struct FilteringScan {
    pub table: Arc<TableHandle>,
    pub projection: Vec<TypedColumn>,
    pub filter_columns: Vec<TypedColumn>,
    pub predicate: Box<dyn Fn(&[Value]) -> bool + Send + Sync>,
    pub description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
}

impl PipelineStarter for FilteringScan {
    fn input_size(&self) -> u64 {
        self.table.cardinality()
    }

    fn execute_range(&self, from: u64, to: u64, worker_id: usize) -> Result<()> {
        let mut batch = Batch::new(self.description.clone(), MORSEL_BATCH_ROWS);
        for row in from..to {
            if !self.table.is_visible(row)? {
                continue;
            }
            let filter_values: Vec<Value> =
                self.filter_columns.iter().map(|c| c.value(row)).collect::<Result<_>>()?;
            if !(self.predicate)(&filter_values) {
                continue;
            }
            let values: Vec<Value> = self.projection.iter().map(|c| c.value(row)).collect::<Result<_>>()?;
            flush_if_full(&mut batch, &values, &self.description, &self.next, worker_id)?;
        }
        if batch.current_size() > 0 {
            self.next.push(batch, worker_id)?;
        }
        Ok(())
    }
}

/// Equality/range scan over the table's primary-key B+-tree. Its natural
/// axis of parallelism is the key range, not a row-id range, so it always
/// runs as a single immediate-mode morsel rather than being NUMA-partitioned
/// (documented simplification; see DESIGN.md).
pub struct IndexScan {
    pub table: Arc<TableHandle>,
    pub projection: Vec<TypedColumn>,
    pub description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
    pub from: CompositeKey<PK_WIDTH>,
    pub to: CompositeKey<PK_WIDTH>,
}

impl PipelineStarter for IndexScan {
    fn input_size(&self) -> u64 {
        1
    }

    fn min_morsel_size(&self) -> u64 {
        1
    }

    fn execute_range(&self, _from: u64, _to: u64, worker_id: usize) -> Result<()> {
        let mut batch = Batch::new(self.description.clone(), MORSEL_BATCH_ROWS);
        for (key, row_id) in self.table.primary_key_index().iter_from(self.from)? {
            if key > self.to {
                break;
            }
            // Known hazard (spec.md §9): the visibility check below takes a
            // shared latch on the visibility tree while still holding the
            // primary-key iterator's leaf latch.
            if !self.table.is_visible(row_id)? {
                continue;
            }
            let values: Vec<Value> = self.projection.iter().map(|c| c.value(row_id)).collect::<Result<_>>()?;
            flush_if_full(&mut batch, &values, &self.description, &self.next, worker_id)?;
        }
        if batch.current_size() > 0 {
            self.next.push(batch, worker_id)?;
        }
        Ok(())
    }
}

/// Locates matching keys in the primary-key B+-tree, takes an `UpdateGuard`
/// on the visibility tree per row, rewrites one designated column under the
/// column's own exclusive latch, and emits the updated row downstream.
///
/// The workaround for the visibility-vs-primary-key deadlock hazard
/// (spec.md §9) is to let the primary-key iterator's leaf latch drop (it is
/// a `SharedGuard` released at the end of each `next()` call) before ever
/// touching the visibility tree, rather than holding both at once.
pub struct IndexUpdate {
    pub table: Arc<TableHandle>,
    pub projection: Vec<TypedColumn>,
    pub description: Arc<BatchDescription>,
    pub next: Arc<dyn Sink>,
    pub from: CompositeKey<PK_WIDTH>,
    pub to: CompositeKey<PK_WIDTH>,
    pub target_column: usize,
    pub update: Box<dyn Fn(Value) -> Value + Send + Sync>,
}

impl PipelineStarter for IndexUpdate {
    fn input_size(&self) -> u64 {
        1
    }

    fn min_morsel_size(&self) -> u64 {
        1
    }

    fn execute_range(&self, _from: u64, _to: u64, worker_id: usize) -> Result<()> {
        let matches: Vec<u64> = self
            .table
            .primary_key_index()
            .iter_from(self.from)?
            .take_while(|(key, _)| *key <= self.to)
            .map(|(_, row_id)| row_id)
            .collect();

        let mut batch = Batch::new(self.description.clone(), MORSEL_BATCH_ROWS);
        for row_id in matches {
            let Some(mut vis) = self.table.visibility_tree().latch_for_update(row_id)? else { continue };
            if !vis.get() {
                continue;
            }
            let mut values = Vec::with_capacity(self.projection.len());
            for (i, col) in self.projection.iter().enumerate() {
                let mut v = col.value(row_id)?;
                if i == self.target_column {
                    v = (self.update)(v);
                    col.set_value(row_id, v)?;
                }
                values.push(v);
            }
            drop(vis);
            flush_if_full(&mut batch, &values, &self.description, &self.next, worker_id)?;
        }
        if batch.current_size() > 0 {
            self.next.push(batch, worker_id)?;
        }
        Ok(())
    }
}

/// Group-by-key over a configurable payload, specified at interface level
/// only (spec.md: "Aggregation (generic contract)"). Input is a stream of
/// batches with a fixed-width key prefix; output is one row per distinct
/// key via `finalize`.
pub trait Aggregation: Sink {
    fn key_width(&self) -> usize;
    fn finalize(&self, next: &dyn Sink, worker_id: usize) -> Result<()>;
}
