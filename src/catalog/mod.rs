//! Catalog: root page layout and per-table metadata. Tables, like
//! everything else in this store, live entirely inside `VMCache` pages —
//! the catalog is just the first few pages with a hand-rolled layout
//! instead of a B+-tree, since its shape rarely changes and never needs
//! latch-coupled traversal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::btree::{BTree, CompositeKey};
use crate::cache::vmcache::VMCache;
use crate::cache::ExclusiveGuard;
use crate::column::ColumnHelper;
use crate::error::{DbError, Result};
use crate::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE, ROOT_PAGE_ID};

type RawPage = [u8; PAGE_SIZE];

const MAGIC: u64 = 0x4352_4154_4530_3031; // arbitrary format marker
const PERSISTENCE_VERSION: u64 = 1;
const MAX_TABLES: usize = 128;
const MAX_COLUMNS: usize = 32;
const NAME_WIDTH: usize = 32;
/// Width of the composite primary-key index shared by every table; keys
/// narrower than this are zero-padded. Fixed so the catalog can hold one
/// concrete index type instead of being generic over N (see DESIGN.md).
pub const PK_WIDTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    I64,
    U64,
    F64,
    Bool,
}

impl ColumnType {
    fn to_tag(self) -> u32 {
        match self {
            ColumnType::I64 => 0,
            ColumnType::U64 => 1,
            ColumnType::F64 => 2,
            ColumnType::Bool => 3,
        }
    }

    fn from_tag(tag: u32) -> Self {
        match tag {
            0 => ColumnType::I64,
            1 => ColumnType::U64,
            2 => ColumnType::F64,
            _ => ColumnType::Bool,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

// -- tiny byte-cursor helpers, mirroring the manual layout style used for
// B+-tree nodes and column pages (no serde on page bytes: these structs are
// read and written directly by offset, not deserialized).

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn fixed_str(&mut self, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        self.buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        for b in &mut self.buf[self.pos + n..self.pos + width] {
            *b = 0;
        }
        self.pos += width;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn fixed_str(&mut self, width: usize) -> String {
        let raw = &self.buf[self.pos..self.pos + width];
        self.pos += width;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

// -- on-page table metadata ---------------------------------------------

struct TableMeta {
    name: String,
    columns: Vec<ColumnDef>,
    column_basepages: Vec<PageId>,
    cardinality: u64,
    visibility_basepage: PageId,
    primary_key_basepage: PageId,
}

fn write_table_meta(data: &mut RawPage, meta: &TableMeta) {
    let mut w = Writer::new(data.as_mut_slice());
    w.fixed_str(&meta.name, NAME_WIDTH);
    w.u32(meta.columns.len() as u32);
    for i in 0..MAX_COLUMNS {
        if let Some(c) = meta.columns.get(i) {
            w.fixed_str(&c.name, NAME_WIDTH);
            w.u32(c.ty.to_tag());
        } else {
            w.fixed_str("", NAME_WIDTH);
            w.u32(0);
        }
    }
    for i in 0..MAX_COLUMNS {
        w.u64(*meta.column_basepages.get(i).unwrap_or(&INVALID_PAGE_ID));
    }
    w.u64(meta.cardinality);
    w.u64(meta.visibility_basepage);
    w.u64(meta.primary_key_basepage);
}

fn read_table_meta(data: &RawPage) -> TableMeta {
    let mut r = Reader::new(data.as_slice());
    let name = r.fixed_str(NAME_WIDTH);
    let num_columns = r.u32() as usize;
    let mut columns = Vec::with_capacity(num_columns);
    for i in 0..MAX_COLUMNS {
        let cname = r.fixed_str(NAME_WIDTH);
        let tag = r.u32();
        if i < num_columns {
            columns.push(ColumnDef { name: cname, ty: ColumnType::from_tag(tag) });
        }
    }
    let mut column_basepages = Vec::with_capacity(num_columns);
    for i in 0..MAX_COLUMNS {
        let pid = r.u64();
        if i < num_columns {
            column_basepages.push(pid);
        }
    }
    let cardinality = r.u64();
    let visibility_basepage = r.u64();
    let primary_key_basepage = r.u64();
    TableMeta { name, columns, column_basepages, cardinality, visibility_basepage, primary_key_basepage }
}

/// Open handle onto one table's storage: typed column accessors, the
/// RowId visibility tree, and the primary-key index.
pub struct TableHandle {
    cache: Arc<VMCache>,
    basepage_pid: PageId,
    name: String,
    columns: Vec<ColumnDef>,
    column_basepages: Vec<PageId>,
    cardinality: AtomicU64,
    visibility: BTree<u64, bool>,
    primary_key: BTree<CompositeKey<PK_WIDTH>, u64>,
}

impl TableHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn cardinality(&self) -> u64 {
        self.cardinality.load(Ordering::Acquire)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_u64(&self, name: &str) -> Result<ColumnHelper<u64>> {
        let idx = self.column_index(name).ok_or_else(|| DbError::Storage(format!("no column {name}")))?;
        Ok(ColumnHelper::open(self.cache.clone(), self.column_basepages[idx]))
    }

    pub fn column_i64(&self, name: &str) -> Result<ColumnHelper<i64>> {
        let idx = self.column_index(name).ok_or_else(|| DbError::Storage(format!("no column {name}")))?;
        Ok(ColumnHelper::open(self.cache.clone(), self.column_basepages[idx]))
    }

    pub fn column_bool(&self, name: &str) -> Result<ColumnHelper<bool>> {
        let idx = self.column_index(name).ok_or_else(|| DbError::Storage(format!("no column {name}")))?;
        Ok(ColumnHelper::open(self.cache.clone(), self.column_basepages[idx]))
    }

    pub fn column_f64(&self, name: &str) -> Result<ColumnHelper<f64>> {
        let idx = self.column_index(name).ok_or_else(|| DbError::Storage(format!("no column {name}")))?;
        Ok(ColumnHelper::open(self.cache.clone(), self.column_basepages[idx]))
    }

    /// Appends one new row: a value per column (in declared order), plus
    /// the primary-key tuple (padded/truncated to `PK_WIDTH`) if the table
    /// has one. Returns the assigned RowId.
    pub fn insert_row_u64(&self, values: &[u64], pk: Option<[u32; PK_WIDTH]>) -> Result<u64> {
        debug_assert_eq!(values.len(), self.columns.len());
        let row_id = self.visibility.insert_next(true)?;
        for (col_def, &v) in self.columns.iter().zip(values.iter()) {
            let idx = self.column_index(&col_def.name).unwrap();
            let helper: ColumnHelper<u64> = ColumnHelper::open(self.cache.clone(), self.column_basepages[idx]);
            helper.append_values(&[v])?;
        }
        if let Some(pk) = pk {
            self.primary_key.insert(CompositeKey::new(pk), row_id)?;
        }
        self.cardinality.fetch_add(1, Ordering::AcqRel);
        Ok(row_id)
    }

    /// Marks `row_id` deleted. Visibility is append-only/update-only: no
    /// physical row is ever removed (spec.md "deleted-row scan returns
    /// empty" relies on this flag, not on compaction).
    pub fn delete_row(&self, row_id: u64) -> Result<()> {
        if let Some(mut g) = self.visibility.latch_for_update(row_id)? {
            g.set(false);
        }
        Ok(())
    }

    pub fn is_visible(&self, row_id: u64) -> Result<bool> {
        Ok(self.visibility.lookup(row_id)?.unwrap_or(false))
    }

    pub fn visibility_tree(&self) -> &BTree<u64, bool> {
        &self.visibility
    }

    pub fn primary_key_index(&self) -> &BTree<CompositeKey<PK_WIDTH>, u64> {
        &self.primary_key
    }

    fn flush(&self) -> Result<()> {
        let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), self.basepage_pid);
        let meta = TableMeta {
            name: self.name.clone(),
            columns: self.columns.clone(),
            column_basepages: self.column_basepages.clone(),
            cardinality: self.cardinality.load(Ordering::Acquire),
            visibility_basepage: self.visibility.root_pid(),
            primary_key_basepage: self.primary_key.root_pid(),
        };
        write_table_meta(g.data_mut(), &meta);
        Ok(())
    }
}

fn read_root(data: &RawPage) -> (u64, u64, u64, Vec<PageId>) {
    let mut r = Reader::new(data.as_slice());
    let magic = r.u64();
    let version = r.u64();
    let num_tables = r.u64();
    let mut basepages = Vec::with_capacity(MAX_TABLES);
    for _ in 0..MAX_TABLES {
        basepages.push(r.u64());
    }
    (magic, version, num_tables, basepages)
}

fn write_root(data: &mut RawPage, num_tables: u64, basepages: &[PageId]) {
    let mut w = Writer::new(data.as_mut_slice());
    w.u64(MAGIC);
    w.u64(PERSISTENCE_VERSION);
    w.u64(num_tables);
    for i in 0..MAX_TABLES {
        w.u64(*basepages.get(i).unwrap_or(&INVALID_PAGE_ID));
    }
}

/// Owns the root page and the set of open tables. `open` either reads an
/// existing root page (magic matches) or formats a fresh one.
pub struct Catalog {
    cache: Arc<VMCache>,
    tables: RwLock<HashMap<String, Arc<TableHandle>>>,
}

impl Catalog {
    pub fn open(cache: Arc<VMCache>) -> Result<Self> {
        if cache.allocated_count() == 0 {
            let pid = cache.allocate_page()?;
            debug_assert_eq!(pid, ROOT_PAGE_ID);
            let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(cache.clone(), pid);
            write_root(g.data_mut(), 0, &[]);
            info!("formatted fresh root page");
            return Ok(Self { cache, tables: RwLock::new(HashMap::new()) });
        }

        let g: crate::cache::SharedGuard<RawPage> = crate::cache::SharedGuard::fix(cache.clone(), ROOT_PAGE_ID);
        let (magic, _version, num_tables, basepages) = read_root(g.data());
        drop(g);
        if magic != MAGIC {
            return Err(DbError::Storage("root page magic mismatch".into()));
        }

        let mut tables = HashMap::new();
        for &basepage_pid in basepages.iter().take(num_tables as usize) {
            if basepage_pid == INVALID_PAGE_ID {
                continue;
            }
            let g: crate::cache::SharedGuard<RawPage> = crate::cache::SharedGuard::fix(cache.clone(), basepage_pid);
            let meta = read_table_meta(g.data());
            drop(g);
            let visibility = BTree::open(cache.clone(), meta.visibility_basepage);
            visibility.recompute_next_key()?;
            let primary_key = BTree::open(cache.clone(), meta.primary_key_basepage);
            let handle = Arc::new(TableHandle {
                cache: cache.clone(),
                basepage_pid,
                name: meta.name.clone(),
                columns: meta.columns,
                column_basepages: meta.column_basepages,
                cardinality: AtomicU64::new(meta.cardinality),
                visibility,
                primary_key,
            });
            tables.insert(meta.name, handle);
        }
        Ok(Self { cache, tables: RwLock::new(tables) })
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableHandle>> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Creates a new table with an empty visibility tree and primary-key
    /// index, one column basepage per declared column.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<Arc<TableHandle>> {
        if columns.len() > MAX_COLUMNS {
            return Err(DbError::InvalidInput(format!("at most {MAX_COLUMNS} columns per table")));
        }
        let mut tables = self.tables.write();
        if tables.len() >= MAX_TABLES {
            return Err(DbError::ResourceExhausted("catalog table limit reached".into()));
        }
        if tables.contains_key(name) {
            return Err(DbError::InvalidInput(format!("table {name} already exists")));
        }

        let mut column_basepages = Vec::with_capacity(columns.len());
        for col in &columns {
            let pid = match col.ty {
                ColumnType::I64 => ColumnHelper::<i64>::create(self.cache.clone())?.base_pid(),
                ColumnType::U64 => ColumnHelper::<u64>::create(self.cache.clone())?.base_pid(),
                ColumnType::F64 => ColumnHelper::<f64>::create(self.cache.clone())?.base_pid(),
                ColumnType::Bool => ColumnHelper::<bool>::create(self.cache.clone())?.base_pid(),
            };
            column_basepages.push(pid);
        }

        let visibility: BTree<u64, bool> = BTree::create(self.cache.clone())?;
        let primary_key: BTree<CompositeKey<PK_WIDTH>, u64> = BTree::create(self.cache.clone())?;
        let basepage_pid = self.cache.allocate_page()?;

        let handle = Arc::new(TableHandle {
            cache: self.cache.clone(),
            basepage_pid,
            name: name.to_string(),
            columns,
            column_basepages,
            cardinality: AtomicU64::new(0),
            visibility,
            primary_key,
        });
        handle.flush()?;
        tables.insert(name.to_string(), handle.clone());
        self.flush_root_locked(&tables)?;
        Ok(handle)
    }

    fn flush_root_locked(&self, tables: &HashMap<String, Arc<TableHandle>>) -> Result<()> {
        let basepages: Vec<PageId> = tables.values().map(|t| t.basepage_pid).collect();
        let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), ROOT_PAGE_ID);
        write_root(g.data_mut(), basepages.len() as u64, &basepages);
        Ok(())
    }

    /// Flushes every open table's metadata page (row counts, B+-tree
    /// roots). Called on clean shutdown before `VMCache::shutdown`.
    pub fn close(&self) -> Result<()> {
        let tables = self.tables.read();
        for t in tables.values() {
            t.flush()?;
        }
        self.flush_root_locked(&tables)?;
        Ok(())
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
                virtual_pages: 1 << 16,
                max_physical_pages: 256,
                eviction_policy: EvictionPolicyKind::Clock,
                mru_ring_capacity: 32,
                backing_file: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn create_table_then_insert_and_scan() {
        let cache = cache();
        let cat = Catalog::open(cache.clone()).unwrap();
        let cols = vec![
            ColumnDef { name: "a".into(), ty: ColumnType::U64 },
            ColumnDef { name: "b".into(), ty: ColumnType::U64 },
        ];
        let table = cat.create_table("t", cols).unwrap();
        for i in 0..10u64 {
            table.insert_row_u64(&[i, i * 2], Some([i as u32, 0, 0, 0])).unwrap();
        }
        assert_eq!(table.cardinality(), 10);
        let col_a = table.column_u64("a").unwrap();
        assert_eq!(col_a.value(5).unwrap(), 5);
    }

    #[test]
    fn delete_marks_row_invisible() {
        let cache = cache();
        let cat = Catalog::open(cache.clone()).unwrap();
        let cols = vec![ColumnDef { name: "a".into(), ty: ColumnType::U64 }];
        let table = cat.create_table("t", cols).unwrap();
        let row_id = table.insert_row_u64(&[42], None).unwrap();
        assert!(table.is_visible(row_id).unwrap());
        table.delete_row(row_id).unwrap();
        assert!(!table.is_visible(row_id).unwrap());
    }

    #[test]
    fn primary_key_lookup_resolves_row_id() {
        let cache = cache();
        let cat = Catalog::open(cache.clone()).unwrap();
        let cols = vec![ColumnDef { name: "a".into(), ty: ColumnType::U64 }];
        let table = cat.create_table("t", cols).unwrap();
        let row_id = table.insert_row_u64(&[7], Some([3, 9, 0, 0])).unwrap();
        let found = table.primary_key_index().lookup(CompositeKey::new([3, 9, 0, 0])).unwrap();
        assert_eq!(found, Some(row_id));
    }
}
