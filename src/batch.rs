//! Morsel batches: the unit of work passed between pipeline operators. A
//! batch owns a fixed-capacity validity bitmap alongside whatever column
//! buffers the operator chain has materialized for it (spec.md §6).

use std::sync::Arc;

use crate::error::{DbError, Result};

/// A scalar value a batch column may hold. Kept small and `Copy`; variable-
/// width data (strings) is out of scope (spec.md Non-goals).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::I64(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::U64(v) => Some(*v as i64),
            _ => None,
        }
    }
}

/// Orders two values of the same variant; mismatched variants compare equal
/// (callers only ever compare within one homogeneously-typed column).
pub fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::I64(x), Value::I64(y)) => x.cmp(y),
        (Value::U64(x), Value::U64(y)) => x.cmp(y),
        (Value::F64(x), Value::F64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    I64,
    U64,
    F64,
    Bool,
}

/// Named, typed column layout shared by every batch flowing through one
/// pipeline stage.
#[derive(Clone, Debug)]
pub struct BatchDescription {
    pub columns: Vec<(String, ColumnType)>,
}

impl BatchDescription {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _)| n == name)
    }

    pub fn row_size(&self) -> usize {
        self.columns
            .iter()
            .map(|(_, t)| match t {
                ColumnType::I64 | ColumnType::U64 | ColumnType::F64 => 8,
                ColumnType::Bool => 1,
            })
            .sum()
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }
}

/// A column-major batch of up to `max_size` rows, with per-row validity so
/// a filtering operator can mark rows dead in place instead of compacting.
pub struct Batch {
    pub description: Arc<BatchDescription>,
    columns: Vec<Vec<Value>>,
    valid: Vec<bool>,
    max_size: usize,
    current_size: usize,
}

impl Batch {
    pub fn new(description: Arc<BatchDescription>, max_size: usize) -> Self {
        let arity = description.arity();
        Self {
            description,
            columns: vec![Vec::with_capacity(max_size); arity],
            valid: Vec::with_capacity(max_size),
            max_size,
            current_size: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn is_full(&self) -> bool {
        self.current_size >= self.max_size
    }

    pub fn live_row_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Appends one row if there's room; `false` means the caller should
    /// start a fresh batch and retry there (spec.md "morsel boundary").
    pub fn add_row_if_possible(&mut self, row: &[Value]) -> bool {
        if self.is_full() {
            return false;
        }
        debug_assert_eq!(row.len(), self.description.arity());
        for (col, value) in self.columns.iter_mut().zip(row.iter()) {
            col.push(*value);
        }
        self.valid.push(true);
        self.current_size += 1;
        true
    }

    pub fn is_row_valid(&self, row: usize) -> bool {
        self.valid[row]
    }

    pub fn mark_invalid(&mut self, row: usize) {
        self.valid[row] = false;
    }

    pub fn get_row(&self, row: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[row]).collect()
    }

    pub fn get(&self, row: usize, col: usize) -> Value {
        self.columns[col][row]
    }

    pub fn column(&self, idx: usize) -> &[Value] {
        &self.columns[idx]
    }

    pub fn column_named(&self, name: &str) -> Result<&[Value]> {
        let idx = self
            .description
            .find(name)
            .ok_or_else(|| DbError::Execution(format!("no such column: {name}")))?;
        Ok(self.column(idx))
    }

    /// Permutes every column (and the validity mask) in place so rows come
    /// out non-decreasing on `col` (`SortBreaker`'s in-place introsort).
    pub fn sort_by_column(&mut self, col: usize) {
        let n = self.current_size;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_unstable_by(|&a, &b| compare_values(&self.columns[col][a], &self.columns[col][b]));
        for c in self.columns.iter_mut() {
            *c = order.iter().map(|&i| c[i]).collect();
        }
        self.valid = order.iter().map(|&i| self.valid[i]).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> Arc<BatchDescription> {
        Arc::new(BatchDescription::new(vec![
            ("a".into(), ColumnType::U64),
            ("b".into(), ColumnType::Bool),
        ]))
    }

    #[test]
    fn add_row_if_possible_respects_capacity() {
        let mut b = Batch::new(desc(), 2);
        assert!(b.add_row_if_possible(&[Value::U64(1), Value::Bool(true)]));
        assert!(b.add_row_if_possible(&[Value::U64(2), Value::Bool(false)]));
        assert!(!b.add_row_if_possible(&[Value::U64(3), Value::Bool(true)]));
        assert_eq!(b.current_size(), 2);
    }

    #[test]
    fn mark_invalid_excludes_row_from_live_count() {
        let mut b = Batch::new(desc(), 4);
        for i in 0..4 {
            b.add_row_if_possible(&[Value::U64(i), Value::Bool(true)]);
        }
        b.mark_invalid(1);
        assert_eq!(b.live_row_count(), 3);
        assert!(!b.is_row_valid(1));
    }

    #[test]
    fn sort_by_column_reorders_all_columns_together() {
        let mut b = Batch::new(desc(), 4);
        b.add_row_if_possible(&[Value::U64(3), Value::Bool(true)]);
        b.add_row_if_possible(&[Value::U64(1), Value::Bool(false)]);
        b.add_row_if_possible(&[Value::U64(2), Value::Bool(true)]);
        b.sort_by_column(0);
        assert_eq!(b.column(0), &[Value::U64(1), Value::U64(2), Value::U64(3)]);
        assert_eq!(b.column(1), &[Value::Bool(false), Value::Bool(true), Value::Bool(true)]);
    }

    #[test]
    fn find_resolves_named_columns() {
        let d = desc();
        assert_eq!(d.find("a"), Some(0));
        assert_eq!(d.find("b"), Some(1));
        assert_eq!(d.find("c"), None);
    }
}
