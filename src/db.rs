//! Top-level database handle: wires the page cache, catalog, and dispatcher
//! together and owns the open/close lifecycle (spec.md §4.1, §4.7, §4.8).

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::eviction::EvictionPolicyKind;
use crate::cache::vmcache::{VMCache, VMCacheConfig};
use crate::catalog::Catalog;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::qep::{PipelineNode, Qep};

/// Programmatic configuration for one `Database::open` call. No file-based
/// config format is required by the spec (no SQL surface, no network
/// surface); `serde` derives are kept for callers that want to load this
/// from JSON, mirroring the teacher's `BufferPoolConfig` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing file for the page cache; `None` runs fully in memory.
    pub data_file: Option<PathBuf>,
    pub virtual_pages: usize,
    pub max_physical_pages: usize,
    pub eviction_policy: EvictionPolicyKind,
    pub mru_ring_capacity: usize,
    pub dispatcher_workers: usize,
    pub dispatcher_numa_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: None,
            virtual_pages: 1 << 20,
            max_physical_pages: 1 << 14,
            eviction_policy: EvictionPolicyKind::Clock,
            mru_ring_capacity: 64,
            dispatcher_workers: num_cpus::get().max(1),
            dispatcher_numa_nodes: 1,
        }
    }
}

/// Owns every long-lived subsystem: page cache, catalog, dispatcher. Opening
/// twice against the same backing file from two processes is undefined —
/// single-process use only (spec.md Non-goals: no distributed coordination).
pub struct Database {
    cache: Arc<VMCache>,
    catalog: Catalog,
    dispatcher: Arc<Dispatcher>,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        let cache = Arc::new(VMCache::open(VMCacheConfig {
            virtual_pages: config.virtual_pages,
            max_physical_pages: config.max_physical_pages,
            eviction_policy: config.eviction_policy,
            mru_ring_capacity: config.mru_ring_capacity,
            backing_file: config.data_file,
        })?);
        let catalog = Catalog::open(cache.clone())?;
        let dispatcher = Dispatcher::new(config.dispatcher_workers, config.dispatcher_numa_nodes);
        info!(workers = config.dispatcher_workers, nodes = config.dispatcher_numa_nodes, "database opened");
        Ok(Self { cache, catalog, dispatcher })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<VMCache> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs one query execution plan to completion: starts every
    /// dependency-free pipeline and blocks until the whole DAG finishes.
    pub fn run(&self, pipelines: Vec<Arc<dyn PipelineNode>>) -> Result<()> {
        let qep = Qep::new(pipelines, self.dispatcher.clone());
        qep.begin()?;
        qep.wait_for_execution();
        Ok(())
    }

    /// Flushes catalog metadata and shuts the dispatcher and page cache down
    /// cleanly. Not called automatically on drop: spec.md's failure model
    /// treats a missed close as a recoverable, logged condition rather than
    /// something to paper over with a `Drop` impl.
    pub fn close(self) -> Result<()> {
        self.catalog.close()?;
        self.dispatcher.shutdown();
        self.cache.shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType};

    #[test]
    fn open_create_table_insert_and_close_round_trips() {
        let db = Database::open(Config {
            virtual_pages: 1 << 14,
            max_physical_pages: 256,
            dispatcher_workers: 2,
            ..Config::default()
        })
        .unwrap();
        let table = db
            .catalog()
            .create_table("t", vec![ColumnDef { name: "a".into(), ty: ColumnType::U64 }])
            .unwrap();
        table.insert_row_u64(&[7], Some([0, 0, 0, 0])).unwrap();
        assert_eq!(table.cardinality(), 1);
        db.close().unwrap();
    }
}
