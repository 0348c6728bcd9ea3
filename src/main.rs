// Minimal CLI entry point: opens a database, creates a scratch table, runs a
// full-table scan through the dispatcher, and reports row counts. There is
// no network surface or SQL parser (spec.md Non-goals) — this binary exists
// to exercise the engine end to end from a shell.

use std::sync::Arc;

use rusty_db_core::catalog::{ColumnDef, ColumnType};
use rusty_db_core::pipeline::operators::{Scan, TypedColumn};
use rusty_db_core::pipeline::{CollectBreaker, Pipeline};
use rusty_db_core::qep::PipelineNode;
use rusty_db_core::{Config, Database, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let db = Database::open(Config::default())?;
    let table = db
        .catalog()
        .create_table("scratch", vec![ColumnDef { name: "value".into(), ty: ColumnType::U64 }])?;
    for i in 0..1000u64 {
        table.insert_row_u64(&[i], None)?;
    }

    let description = Arc::new(rusty_db_core::batch::BatchDescription::new(vec![(
        "value".into(),
        rusty_db_core::batch::ColumnType::U64,
    )]));
    let breaker = CollectBreaker::new(description.clone());
    let scan = Arc::new(Scan {
        table: table.clone(),
        projection: vec![TypedColumn::open(&table, "value")?],
        description,
        next: breaker.clone(),
    });
    let pipeline: Arc<dyn PipelineNode> = Arc::new(Pipeline { id: 0, dependencies: Vec::new(), starter: scan, breaker });

    db.run(vec![pipeline])?;
    tracing::info!(rows = table.cardinality(), "scan complete");
    db.close()?;
    Ok(())
}
