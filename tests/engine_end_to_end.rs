//! End-to-end coverage across the catalog, dispatcher, and pipeline layers
//! together, as opposed to the in-module unit tests that exercise each layer
//! in isolation.

use std::sync::Arc;

use rusty_db_core::batch::{BatchDescription, ColumnType as BatchColumnType, Value};
use rusty_db_core::btree::CompositeKey;
use rusty_db_core::catalog::{ColumnDef, ColumnType, PK_WIDTH};
use rusty_db_core::cache::eviction::EvictionPolicyKind;
use rusty_db_core::cache::vmcache::{VMCache, VMCacheConfig};
use rusty_db_core::pipeline::join::{JoinBreaker, JoinBuild, JoinHashTable, JoinProbe, OutputColumnInfo, Side};
use rusty_db_core::pipeline::operators::{IndexScan, Scan, TypedColumn};
use rusty_db_core::pipeline::sort::{SortBreaker, SortOperator};
use rusty_db_core::pipeline::{Breaker, CollectBreaker, Pipeline, PipelineStarter};
use rusty_db_core::qep::PipelineNode;
use rusty_db_core::{Config, Database};

fn pk(c1: u32) -> CompositeKey<PK_WIDTH> {
    CompositeKey::new([c1, 0, 0, 0])
}

fn open_db() -> Database {
    Database::open(Config {
        virtual_pages: 1 << 16,
        max_physical_pages: 512,
        dispatcher_workers: 4,
        ..Config::default()
    })
    .unwrap()
}

fn scan_table(db: &Database, table_name: &str, columns: &[&str]) -> Vec<Vec<Value>> {
    let table = db.catalog().table(table_name).unwrap();
    let description = Arc::new(BatchDescription::new(
        columns.iter().map(|c| (c.to_string(), BatchColumnType::U64)).collect(),
    ));
    let breaker = CollectBreaker::new(description.clone());
    let scan = Arc::new(Scan {
        table: table.clone(),
        projection: columns.iter().map(|c| TypedColumn::open(&table, c).unwrap()).collect(),
        description,
        next: breaker.clone(),
    });
    let pipeline: Arc<dyn PipelineNode> =
        Arc::new(Pipeline { id: 0, dependencies: Vec::new(), starter: scan, breaker: breaker.clone() });
    db.run(vec![pipeline]).unwrap();
    let mut batches = Vec::new();
    breaker.consume_batches(&mut batches);
    batches.iter().flat_map(|b| (0..b.current_size()).map(|r| b.get_row(r))).collect()
}

#[test]
fn index_scan_exact_match_ignores_unrelated_tombstones() {
    let db = open_db();
    let table = db
        .catalog()
        .create_table(
            "t",
            vec![
                ColumnDef { name: "c1".into(), ty: ColumnType::U64 },
                ColumnDef { name: "c2".into(), ty: ColumnType::U64 },
                ColumnDef { name: "c3".into(), ty: ColumnType::U64 },
            ],
        )
        .unwrap();
    let row0 = table.insert_row_u64(&[51, 11, 11], Some([51, 0, 0, 0])).unwrap();
    let row1 = table.insert_row_u64(&[2, 22, 15], Some([2, 0, 0, 0])).unwrap();
    let row2 = table.insert_row_u64(&[3, 44, 11], Some([3, 0, 0, 0])).unwrap();
    let _row3 = table.insert_row_u64(&[41, 55, 6], Some([41, 0, 0, 0])).unwrap();
    assert_eq!((row0, row1, row2), (0, 1, 2));
    table.delete_row(row2).unwrap(); // tombstones (3, 44, 11), unrelated to the key=2 lookup below

    let description = Arc::new(BatchDescription::new(vec![
        ("c1".into(), BatchColumnType::U64),
        ("c2".into(), BatchColumnType::U64),
        ("c3".into(), BatchColumnType::U64),
    ]));
    let breaker = CollectBreaker::new(description.clone());
    let scan = Arc::new(IndexScan {
        table: table.clone(),
        projection: vec!["c1", "c2", "c3"].into_iter().map(|c| TypedColumn::open(&table, c).unwrap()).collect(),
        description,
        next: breaker.clone(),
        from: pk(2),
        to: pk(2),
    });
    let pipeline: Arc<dyn PipelineNode> =
        Arc::new(Pipeline { id: 0, dependencies: Vec::new(), starter: scan, breaker: breaker.clone() });
    db.run(vec![pipeline]).unwrap();

    let mut batches = Vec::new();
    breaker.consume_batches(&mut batches);
    let rows: Vec<Vec<Value>> = batches.iter().flat_map(|b| (0..b.current_size()).map(|r| b.get_row(r))).collect();
    assert_eq!(rows, vec![vec![Value::U64(2), Value::U64(22), Value::U64(15)]]);
    db.close().unwrap();
}

#[test]
fn index_scan_of_deleted_row_returns_no_rows() {
    let db = open_db();
    let table = db
        .catalog()
        .create_table(
            "deleted_t",
            vec![ColumnDef { name: "c1".into(), ty: ColumnType::U64 }, ColumnDef { name: "c2".into(), ty: ColumnType::U64 }],
        )
        .unwrap();
    let row_id = table.insert_row_u64(&[56, 33], Some([56, 33, 0, 0])).unwrap();
    table.delete_row(row_id).unwrap();

    let description = Arc::new(BatchDescription::new(vec![("c1".into(), BatchColumnType::U64), ("c2".into(), BatchColumnType::U64)]));
    let breaker = CollectBreaker::new(description.clone());
    let scan = Arc::new(IndexScan {
        table: table.clone(),
        projection: vec!["c1", "c2"].into_iter().map(|c| TypedColumn::open(&table, c).unwrap()).collect(),
        description,
        next: breaker.clone(),
        from: CompositeKey::new([56, 33, 0, 0]),
        to: CompositeKey::new([56, 33, 0, 0]),
    });
    let pipeline: Arc<dyn PipelineNode> =
        Arc::new(Pipeline { id: 0, dependencies: Vec::new(), starter: scan, breaker: breaker.clone() });
    db.run(vec![pipeline]).unwrap();

    let mut batches = Vec::new();
    breaker.consume_batches(&mut batches);
    let row_count: usize = batches.iter().map(|b| b.current_size()).sum();
    assert_eq!(row_count, 0);
    db.close().unwrap();
}

#[test]
fn full_table_scan_returns_visible_rows_in_row_id_order() {
    let db = open_db();
    let _ = db
        .catalog()
        .create_table(
            "full_scan_t",
            vec![
                ColumnDef { name: "c1".into(), ty: ColumnType::U64 },
                ColumnDef { name: "c2".into(), ty: ColumnType::U64 },
                ColumnDef { name: "c3".into(), ty: ColumnType::U64 },
            ],
        )
        .unwrap();
    let table = db.catalog().table("full_scan_t").unwrap();
    for (c1, c2, c3) in [(51u64, 11u64, 11u64), (2, 22, 15), (3, 44, 11), (41, 55, 6)] {
        table.insert_row_u64(&[c1, c2, c3], Some([c1 as u32, 0, 0, 0])).unwrap();
    }

    let rows = scan_table(&db, "full_scan_t", &["c1", "c2", "c3"]);
    assert_eq!(
        rows,
        vec![
            vec![Value::U64(51), Value::U64(11), Value::U64(11)],
            vec![Value::U64(2), Value::U64(22), Value::U64(15)],
            vec![Value::U64(3), Value::U64(44), Value::U64(11)],
            vec![Value::U64(41), Value::U64(55), Value::U64(6)],
        ]
    );
    db.close().unwrap();
}

#[test]
fn composite_key_join_emits_every_matching_pair() {
    let desc = Arc::new(BatchDescription::new(vec![
        ("k1".into(), BatchColumnType::U64),
        ("k2".into(), BatchColumnType::U64),
        ("payload".into(), BatchColumnType::U64),
    ]));

    let build_breaker = JoinBreaker::new(desc.clone());
    let build_rows = [(1u64, 2u64, 100u64), (1, 2, 101), (3, 4, 200)];
    let mut b = rusty_db_core::batch::Batch::new(desc.clone(), 16);
    for &(k1, k2, payload) in &build_rows {
        b.add_row_if_possible(&[Value::U64(k1), Value::U64(k2), Value::U64(payload)]);
    }
    build_breaker.push(b, 0).unwrap();

    let table = Arc::new(JoinHashTable::new(build_breaker.row_count()));
    let builder = JoinBuild { breaker: build_breaker.clone(), key_columns: vec![0, 1], table: table.clone() };
    builder.execute_range(0, build_breaker.row_count() as u64, 0).unwrap();

    let out_desc = Arc::new(BatchDescription::new(vec![
        ("build_payload".into(), BatchColumnType::U64),
        ("probe_payload".into(), BatchColumnType::U64),
    ]));
    let sink = CollectBreaker::new(out_desc.clone());
    let probe = JoinProbe {
        breaker: build_breaker,
        table,
        probe_key_columns: vec![0, 1],
        build_key_columns: vec![0, 1],
        output_columns: vec![
            OutputColumnInfo { side: Side::Build, index: 2 },
            OutputColumnInfo { side: Side::Probe, index: 2 },
        ],
        output_description: out_desc,
        next: sink.clone(),
    };

    let probe_rows = [(1u64, 2u64, 900u64), (1, 2, 901), (1, 2, 902), (3, 4, 903), (9, 9, 904)];
    let mut pb = rusty_db_core::batch::Batch::new(desc.clone(), 16);
    for &(k1, k2, payload) in &probe_rows {
        pb.add_row_if_possible(&[Value::U64(k1), Value::U64(k2), Value::U64(payload)]);
    }
    probe.push(pb, 0).unwrap();

    let mut batches = Vec::new();
    sink.consume_batches(&mut batches);
    let rows: Vec<Vec<Value>> = batches.iter().flat_map(|b| (0..b.current_size()).map(|r| b.get_row(r))).collect();
    // (1,2) has 2 build rows x 3 probes = 6 matches, (3,4) has 1x1 = 1 match, (9,9) matches nothing.
    assert_eq!(rows.len(), 7);
    for row in &rows {
        let probe_payload = row[1].as_u64().unwrap();
        assert!(probe_payload != 904, "row with no build-side match should not appear");
    }
}

#[test]
fn sort_operator_orders_rows_dispatched_across_workers() {
    let db = open_db();
    let description = Arc::new(BatchDescription::new(vec![("v".into(), BatchColumnType::U64)]));
    let table = db
        .catalog()
        .create_table("sort_t", vec![ColumnDef { name: "v".into(), ty: ColumnType::U64 }])
        .unwrap();
    for i in (0..2048u64).rev() {
        table.insert_row_u64(&[i], None).unwrap();
    }

    let sort_breaker = SortBreaker::new(description.clone(), 0);
    let scan = Arc::new(Scan {
        table: table.clone(),
        projection: vec![TypedColumn::open(&table, "v").unwrap()],
        description: description.clone(),
        next: sort_breaker.clone(),
    });
    let scan_pipeline: Arc<dyn PipelineNode> =
        Arc::new(Pipeline { id: 0, dependencies: Vec::new(), starter: scan, breaker: sort_breaker.clone() });

    let final_sink = CollectBreaker::new(description.clone());
    let merge = Arc::new(SortOperator {
        breaker: sort_breaker,
        sort_column: 0,
        description: description.clone(),
        next: final_sink.clone(),
        output_batch_size: 256,
    });
    let merge_pipeline: Arc<dyn PipelineNode> =
        Arc::new(Pipeline { id: 1, dependencies: vec![0], starter: merge, breaker: final_sink.clone() });

    db.run(vec![scan_pipeline, merge_pipeline]).unwrap();

    let mut batches = Vec::new();
    final_sink.consume_batches(&mut batches);
    let values: Vec<u64> =
        batches.iter().flat_map(|b| (0..b.current_size()).map(|r| b.get(r, 0).as_u64().unwrap())).collect();
    assert_eq!(values.len(), 2048);
    for w in values.windows(2) {
        assert!(w[0] < w[1]);
    }
    db.close().unwrap();
}

#[test]
fn persistence_round_trip_survives_forced_eviction_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rusty-db.pages");
    const MAGIC: u64 = 0xDEAD_BEEF_DEAD_BEEF;

    let target_pid = {
        let cache = VMCache::open(VMCacheConfig {
            virtual_pages: 1 << 16,
            max_physical_pages: 4,
            eviction_policy: EvictionPolicyKind::Clock,
            mru_ring_capacity: 8,
            backing_file: Some(path.clone()),
        })
        .unwrap();
        let pid = cache.allocate_page().unwrap();
        let ptr = cache.fix_exclusive(pid);
        unsafe { std::ptr::write_unaligned(ptr as *mut u64, MAGIC) };
        cache.unfix_exclusive(pid);

        // Force eviction pressure well past max_physical_pages so the page
        // written above gets written back and faulted back out at least once.
        for _ in 0..256 {
            let q = cache.allocate_page().unwrap();
            cache.fix_shared(q, false);
            cache.unfix_shared(q);
        }

        let rptr = cache.fix_shared(pid, false);
        let observed = unsafe { std::ptr::read_unaligned(rptr as *const u64) };
        cache.unfix_shared(pid);
        assert_eq!(observed, MAGIC, "page survives in-process eviction");

        cache.shutdown().unwrap();
        pid
    };

    // Reopen against the same backing file in a fresh process-equivalent
    // VMCache instance; the page should fault back in with the same bytes.
    let cache2 = VMCache::open(VMCacheConfig {
        virtual_pages: 1 << 16,
        max_physical_pages: 4,
        eviction_policy: EvictionPolicyKind::Clock,
        mru_ring_capacity: 8,
        backing_file: Some(path),
    })
    .unwrap();
    let rptr = cache2.fix_shared(target_pid, false);
    let observed = unsafe { std::ptr::read_unaligned(rptr as *const u64) };
    cache2.unfix_shared(target_pid);
    assert_eq!(observed, MAGIC, "page survives a full close/reopen round trip");
}
