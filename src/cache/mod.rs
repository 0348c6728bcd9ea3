//! The page cache (VMCache): virtual-memory-assisted page table, fault/evict,
//! and the three latch modes everything above it is built on.

pub mod eviction;
pub mod guard;
pub mod vmcache;

pub use eviction::{EvictionPolicy, EvictionPolicyKind, PageStateView};
pub use guard::{ExclusiveGuard, OptResult, OptimisticGuard, Restart, SharedGuard};
pub use vmcache::{VMCache, VMCacheConfig};
