//! Columnar storage: one basepage per column, chained to data pages as the
//! column grows. `PagedColumnIterator` walks the chain cooperating with the
//! shared-latch protocol so a scan never holds more than one page latched
//! at a time.

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use crate::cache::vmcache::VMCache;
use crate::cache::{ExclusiveGuard, SharedGuard};
use crate::error::{DbError, Result};
use crate::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

type RawPage = [u8; PAGE_SIZE];

const BASEPAGE_HEADER: usize = 24; // first_data_page, last_data_page, row_count (u64 each)

/// A data page holds a `next` pointer and a flat run of fixed-size values.
const DATA_HEADER: usize = 8; // next: PageId

/// Resolves row indices to physical pages for one fixed-width column and
/// appends new values, allocating data pages as needed.
pub struct ColumnHelper<T> {
    cache: Arc<VMCache>,
    base_pid: PageId,
    rows_per_page: usize,
    _marker: PhantomData<T>,
}

struct Basepage {
    first: PageId,
    last: PageId,
    row_count: u64,
}

fn read_basepage(data: &RawPage) -> Basepage {
    let first = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let last = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let row_count = u64::from_le_bytes(data[16..24].try_into().unwrap());
    Basepage { first, last, row_count }
}

fn write_basepage(data: &mut RawPage, bp: &Basepage) {
    data[0..8].copy_from_slice(&bp.first.to_le_bytes());
    data[8..16].copy_from_slice(&bp.last.to_le_bytes());
    data[16..24].copy_from_slice(&bp.row_count.to_le_bytes());
}

fn data_next(data: &RawPage) -> PageId {
    u64::from_le_bytes(data[0..8].try_into().unwrap())
}

fn set_data_next(data: &mut RawPage, next: PageId) {
    data[0..8].copy_from_slice(&next.to_le_bytes());
}

impl<T: Copy + Send + Sync + 'static> ColumnHelper<T> {
    const VALUE_SIZE: usize = size_of::<T>();

    fn rows_per_page() -> usize {
        (PAGE_SIZE - DATA_HEADER) / Self::VALUE_SIZE
    }

    /// Allocates a fresh, empty basepage (spec.md "set_page allocating new
    /// basepages").
    pub fn create(cache: Arc<VMCache>) -> Result<Self> {
        let base_pid = cache.allocate_page()?;
        {
            let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(cache.clone(), base_pid);
            write_basepage(g.data_mut(), &Basepage { first: INVALID_PAGE_ID, last: INVALID_PAGE_ID, row_count: 0 });
        }
        Ok(Self { cache, base_pid, rows_per_page: Self::rows_per_page(), _marker: PhantomData })
    }

    pub fn open(cache: Arc<VMCache>, base_pid: PageId) -> Self {
        Self { cache, base_pid, rows_per_page: Self::rows_per_page(), _marker: PhantomData }
    }

    pub fn base_pid(&self) -> PageId {
        self.base_pid
    }

    pub fn row_count(&self) -> Result<u64> {
        let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), self.base_pid);
        Ok(read_basepage(g.data()).row_count)
    }

    fn data_page_pid_for(&self, row: u64) -> Result<(PageId, usize)> {
        let target_page_index = row / self.rows_per_page as u64;
        let within = (row % self.rows_per_page as u64) as usize;
        let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), self.base_pid);
        let mut pid = read_basepage(g.data()).first;
        drop(g);
        for _ in 0..target_page_index {
            if pid == INVALID_PAGE_ID {
                return Err(DbError::Storage("row index beyond column extent".into()));
            }
            let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), pid);
            pid = data_next(g.data());
        }
        if pid == INVALID_PAGE_ID {
            return Err(DbError::Storage("row index beyond column extent".into()));
        }
        Ok((pid, within))
    }

    pub fn value(&self, row: u64) -> Result<T> {
        let (pid, within) = self.data_page_pid_for(row)?;
        let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), pid);
        let offset = DATA_HEADER + within * Self::VALUE_SIZE;
        let ptr = unsafe { g.data().as_ptr().add(offset) as *const T };
        Ok(unsafe { *ptr })
    }

    /// Overwrites a single value in place under the data page's own
    /// exclusive latch (`IndexUpdate`'s per-column rewrite).
    pub fn set_value(&self, row: u64, value: T) -> Result<()> {
        let (pid, within) = self.data_page_pid_for(row)?;
        let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), pid);
        let offset = DATA_HEADER + within * Self::VALUE_SIZE;
        let ptr = unsafe { g.data_mut().as_mut_ptr().add(offset) as *mut T };
        unsafe { *ptr = value };
        Ok(())
    }

    /// Appends `values` to the end of the column, allocating new data pages
    /// as the current last page fills up.
    pub fn append_values(&self, values: &[T]) -> Result<()> {
        let mut base_g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), self.base_pid);
        let mut bp = read_basepage(base_g.data());

        let mut remaining = values;
        while !remaining.is_empty() {
            if bp.last == INVALID_PAGE_ID {
                let new_pid = self.cache.allocate_page()?;
                let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), new_pid);
                set_data_next(g.data_mut(), INVALID_PAGE_ID);
                bp.first = new_pid;
                bp.last = new_pid;
            }
            let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), bp.last);
            let used_rows = (bp.row_count as usize) % self.rows_per_page;
            let free_rows = self.rows_per_page - used_rows;
            let take = free_rows.min(remaining.len());
            let offset = DATA_HEADER + used_rows * Self::VALUE_SIZE;
            unsafe {
                let dst = g.data_mut().as_mut_ptr().add(offset) as *mut T;
                std::ptr::copy_nonoverlapping(remaining.as_ptr(), dst, take);
            }
            bp.row_count += take as u64;
            remaining = &remaining[take..];
            if !remaining.is_empty() {
                let new_pid = self.cache.allocate_page()?;
                {
                    let mut ng: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), new_pid);
                    set_data_next(ng.data_mut(), INVALID_PAGE_ID);
                }
                set_data_next(g.data_mut(), new_pid);
                bp.last = new_pid;
            }
        }
        write_basepage(base_g.data_mut(), &bp);
        Ok(())
    }
}

/// Sequential, single-page-latched iterator over one column's values,
/// cooperating with the shared-latch protocol: at most one data page is
/// latched at any instant.
pub struct PagedColumnIterator<T> {
    cache: Arc<VMCache>,
    rows_per_page: usize,
    current_pid: PageId,
    current_guard: Option<SharedGuard<RawPage>>,
    within_page: usize,
    row: u64,
    total_rows: u64,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + Sync + 'static> PagedColumnIterator<T> {
    pub fn new(column: &ColumnHelper<T>) -> Result<Self> {
        let g: SharedGuard<RawPage> = SharedGuard::fix(column.cache.clone(), column.base_pid);
        let bp = read_basepage(g.data());
        drop(g);
        let current_guard = if bp.first != INVALID_PAGE_ID {
            Some(SharedGuard::fix_scan(column.cache.clone(), bp.first))
        } else {
            None
        };
        Ok(Self {
            cache: column.cache.clone(),
            rows_per_page: column.rows_per_page,
            current_pid: bp.first,
            current_guard,
            within_page: 0,
            row: 0,
            total_rows: bp.row_count,
            _marker: PhantomData,
        })
    }

    /// Repositions the iterator to `row` without re-scanning from the start
    /// (used by index scans that jump directly to a RowId).
    pub fn reposition(&mut self, column: &ColumnHelper<T>, row: u64) -> Result<()> {
        let (pid, within) = column.data_page_pid_for(row)?;
        self.unload();
        self.current_pid = pid;
        self.current_guard = Some(SharedGuard::fix(self.cache.clone(), pid));
        self.within_page = within;
        self.row = row;
        Ok(())
    }

    pub fn unload(&mut self) {
        self.current_guard = None;
    }

    pub fn has_next(&self) -> bool {
        self.row < self.total_rows
    }

    /// Reads the current value; does not advance.
    pub fn value(&self) -> Option<T> {
        let g = self.current_guard.as_ref()?;
        let offset = DATA_HEADER + self.within_page * std::mem::size_of::<T>();
        let ptr = unsafe { g.data().as_ptr().add(offset) as *const T };
        Some(unsafe { *ptr })
    }

    /// Advances to the next row, crossing a page boundary if needed.
    pub fn advance(&mut self) {
        self.row += 1;
        self.within_page += 1;
        if self.within_page >= self.rows_per_page {
            let next = self.current_guard.as_ref().map(|g| data_next(g.data())).unwrap_or(INVALID_PAGE_ID);
            self.current_pid = next;
            self.within_page = 0;
            self.current_guard =
                if next != INVALID_PAGE_ID { Some(SharedGuard::fix_scan(self.cache.clone(), next)) } else { None };
        }
    }
}

impl<T: Copy + Send + Sync + 'static> Iterator for PagedColumnIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if !self.has_next() {
            return None;
        }
        let v = self.value();
        self.advance();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::EvictionPolicyKind;
    use crate::cache::vmcache::VMCacheConfig;

    fn cache() -> Arc<VMCache> {
        Arc::new(
            VMCache::open(VMCacheConfig {
                virtual_pages: 1 << 14,
                max_physical_pages: 64,
                eviction_policy: EvictionPolicyKind::Clock,
                mru_ring_capacity: 16,
                backing_file: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn append_and_iterate_spans_multiple_pages() {
        let col: ColumnHelper<u64> = ColumnHelper::create(cache()).unwrap();
        let values: Vec<u64> = (0..5000).collect();
        col.append_values(&values).unwrap();
        assert_eq!(col.row_count().unwrap(), 5000);

        let iter = PagedColumnIterator::new(&col).unwrap();
        let collected: Vec<u64> = iter.collect();
        assert_eq!(collected, values);
    }

    #[test]
    fn random_access_value_matches_append_order() {
        let col: ColumnHelper<u32> = ColumnHelper::create(cache()).unwrap();
        let values: Vec<u32> = (0..3000).map(|i| i * 3).collect();
        col.append_values(&values).unwrap();
        assert_eq!(col.value(0).unwrap(), 0);
        assert_eq!(col.value(1500).unwrap(), 1500 * 3);
        assert_eq!(col.value(2999).unwrap(), 2999 * 3);
    }

    #[test]
    fn set_value_overwrites_in_place() {
        let col: ColumnHelper<u64> = ColumnHelper::create(cache()).unwrap();
        col.append_values(&(0..10u64).collect::<Vec<_>>()).unwrap();
        col.set_value(4, 999).unwrap();
        assert_eq!(col.value(4).unwrap(), 999);
        assert_eq!(col.value(3).unwrap(), 3);
    }

    #[test]
    fn reposition_jumps_directly_to_row() {
        let col: ColumnHelper<u64> = ColumnHelper::create(cache()).unwrap();
        let values: Vec<u64> = (0..4000).collect();
        col.append_values(&values).unwrap();
        let mut iter = PagedColumnIterator::new(&col).unwrap();
        iter.reposition(&col, 3500).unwrap();
        assert_eq!(iter.value(), Some(3500));
    }
}
