// VMCache: the page cache / buffer manager core.
//
// Maps page ids onto a reserved block of memory, faults pages in from the
// backing file on first access, and exposes the three latch modes
// (`fix_shared`, `fix_exclusive`, `OptimisticGuard`) as the only way any
// other subsystem touches page memory.
//
// The real system backs this with `mmap`'d virtual address space so the OS
// demand-pages physical memory lazily; this port eagerly allocates the
// `virtual_pages * PAGE_SIZE` block instead (a `Vec<UnsafeCell<Page>>`) and
// relies on the eviction loop — not OS reclamation — to bound resident
// pages. Tracked as an open decision in DESIGN.md; it does not change any
// observable latch or eviction behavior the tests in spec.md §8 depend on.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::cache::eviction::{
    create_policy, EvictionPolicy, EvictionPolicyKind, PageStateView, ResidentSet,
};
use crate::error::{DbError, Result};
use crate::page::{
    self, PageId, PageState, DIRTY_BIT, INVALID_PAGE_ID, MODIFIED_BIT, PAGE_SIZE, STATE_EVICTED,
    STATE_LOCKED, STATE_MARKED, STATE_SHARED_MIN, STATE_UNLOCKED, VERSION_STEP,
};

#[repr(C, align(4096))]
pub struct Page(pub UnsafeCell<[u8; PAGE_SIZE]>);

// SAFETY: access is synchronized through the latch protocol in `PageState`;
// every read/write of a page's bytes is gated by a shared/exclusive/
// optimistic latch acquired first.
unsafe impl Sync for Page {}

impl Page {
    fn zeroed() -> Self {
        Page(UnsafeCell::new([0u8; PAGE_SIZE]))
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.0.get() as *const u8
    }

    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

#[derive(Debug, Clone)]
pub struct VMCacheConfig {
    pub virtual_pages: usize,
    pub max_physical_pages: usize,
    pub eviction_policy: EvictionPolicyKind,
    pub mru_ring_capacity: usize,
    pub backing_file: Option<PathBuf>,
}

impl Default for VMCacheConfig {
    fn default() -> Self {
        Self {
            virtual_pages: 1 << 20,
            max_physical_pages: 1024,
            eviction_policy: EvictionPolicyKind::Clock,
            mru_ring_capacity: 64,
            backing_file: None,
        }
    }
}

pub struct VMCache {
    memory: Vec<Page>,
    page_states: Vec<PageState>,
    resident: ResidentSet,
    temp_pages: RwLock<std::collections::HashSet<PageId>>,
    num_allocated: AtomicU64,
    num_resident_physical: AtomicI64,
    max_physical_pages: usize,
    file: Option<RwLock<File>>,
    policy: Box<dyn EvictionPolicy>,
}

impl VMCache {
    pub fn open(config: VMCacheConfig) -> Result<Self> {
        let mut memory = Vec::with_capacity(config.virtual_pages);
        let mut page_states = Vec::with_capacity(config.virtual_pages);
        for _ in 0..config.virtual_pages {
            memory.push(Page::zeroed());
            page_states.push(PageState::new(STATE_EVICTED));
        }
        let file = match config.backing_file {
            Some(path) => Some(RwLock::new(
                OpenOptions::new().read(true).write(true).create(true).open(path)?,
            )),
            None => None,
        };
        Ok(Self {
            memory,
            page_states,
            resident: ResidentSet::new(),
            temp_pages: RwLock::new(std::collections::HashSet::new()),
            num_allocated: AtomicU64::new(0),
            num_resident_physical: AtomicI64::new(0),
            max_physical_pages: config.max_physical_pages,
            file,
            policy: create_policy(config.eviction_policy, config.mru_ring_capacity),
        })
    }

    pub fn max_physical_pages(&self) -> usize {
        self.max_physical_pages
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// `allocate_page`: appends a new page id. Ids are never reused, even
    /// after the page is later freed (B+-tree leaf removal currently leaks,
    /// see spec.md §3 "Lifecycles").
    pub fn allocate_page(&self) -> Result<PageId> {
        let pid = self.num_allocated.fetch_add(1, Ordering::Relaxed);
        if pid as usize >= self.memory.len() {
            return Err(DbError::ResourceExhausted(format!(
                "page allocation beyond virtual page cap ({})",
                self.memory.len()
            )));
        }
        // A freshly allocated page starts Unlocked (not Evicted): it has no
        // on-disk backing yet, so the first fix must not trigger a fault.
        self.page_states[pid as usize].store(STATE_UNLOCKED, Ordering::Release);
        self.resident.insert(pid);
        self.num_resident_physical.fetch_add(1, Ordering::Relaxed);
        self.ensure_capacity();
        Ok(pid)
    }

    pub fn allocated_count(&self) -> u64 {
        self.num_allocated.load(Ordering::Relaxed)
    }

    fn ensure_capacity(&self) {
        let mut guard_rounds = 0;
        while self.num_resident_physical.load(Ordering::Relaxed) as usize > self.max_physical_pages
        {
            if !self.run_eviction_round() {
                guard_rounds += 1;
                if guard_rounds > 1000 {
                    warn!("eviction unable to make progress; everything appears pinned");
                    break;
                }
            }
        }
    }

    fn run_eviction_round(&self) -> bool {
        let batch = self.policy.get_eviction_candidates(self, 64);
        let mut evicted_any = false;
        for (i, &pid) in batch.candidates.iter().enumerate() {
            let is_temp = self.temp_pages.read().unwrap().contains(&pid);
            let was_dirty = batch.dirty_mask & (1 << i) != 0;
            if was_dirty && !is_temp {
                if self.file.is_none() {
                    // No backing store to persist to: evicting now would
                    // silently destroy the only copy of this page's data.
                    // Leave it resident until it's flushed some other way
                    // (shutdown) rather than violate P-Persist.
                    continue;
                }
                if let Err(e) = self.flush_page_locked(pid) {
                    warn!(page = pid, error = %e, "write-back failed during eviction, skipping this page (known limitation)");
                    continue;
                }
            }
            let s = self.page_states[pid as usize].load(Ordering::Acquire);
            let new_s = ((s & !page::STATE_MASK) + VERSION_STEP) | STATE_LOCKED;
            if self.page_states[pid as usize]
                .compare_exchange(s, new_s, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // simulated madvise(DONTNEED): zero the page and publish Evicted.
                unsafe { std::ptr::write_bytes(self.memory[pid as usize].as_mut_ptr(), 0, PAGE_SIZE) };
                let evicted_s = (new_s & !page::STATE_MASK) | STATE_EVICTED;
                self.page_states[pid as usize].store(evicted_s, Ordering::Release);
                self.resident.remove(pid);
                self.temp_pages.write().unwrap().remove(&pid);
                self.num_resident_physical.fetch_sub(1, Ordering::Relaxed);
                evicted_any = true;
                debug!(page = pid, "evicted");
            }
        }
        evicted_any
    }

    fn flush_page_locked(&self, pid: PageId) -> Result<()> {
        let Some(file) = &self.file else { return Ok(()) };
        let mut f = file.write().unwrap();
        let offset = pid * PAGE_SIZE as u64;
        let bytes = unsafe { std::slice::from_raw_parts(self.memory[pid as usize].as_ptr(), PAGE_SIZE) };
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(bytes)?;
        Ok(())
    }

    fn fault_locked(&self, pid: PageId) {
        let Some(file) = &self.file else { return };
        let mut f = file.write().unwrap();
        let offset = pid * PAGE_SIZE as u64;
        // A short read (or EOF) on an id beyond the historical file size is
        // a fresh allocation, not an error (spec.md §4.1 "Failure model").
        if f.seek(SeekFrom::Start(offset)).is_err() {
            return;
        }
        let mut buf = [0u8; PAGE_SIZE];
        match f.read(&mut buf) {
            Ok(_) => unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), self.memory[pid as usize].as_mut_ptr(), PAGE_SIZE) },
            Err(e) => warn!(page = pid, error = %e, "fault read failed (known limitation, not fatal)"),
        }
    }

    // -- fix/unfix ------------------------------------------------------

    pub fn fix_exclusive(&self, pid: PageId) -> *mut u8 {
        assert_ne!(pid, INVALID_PAGE_ID);
        let ps = &self.page_states[pid as usize];
        let mut s = ps.load(Ordering::Acquire);
        loop {
            let m = page::mode(s);
            let new_s = (s & !page::STATE_MASK) | STATE_LOCKED;
            if m == STATE_EVICTED {
                match ps.compare_exchange_weak(s, new_s, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        self.fault_locked(pid);
                        self.resident.insert(pid);
                        self.num_resident_physical.fetch_add(1, Ordering::Relaxed);
                        self.ensure_capacity();
                        return self.memory[pid as usize].as_mut_ptr();
                    }
                    Err(cur) => s = cur,
                }
            } else if m == STATE_MARKED || m == STATE_UNLOCKED {
                match ps.compare_exchange_weak(s, new_s, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return self.memory[pid as usize].as_mut_ptr(),
                    Err(cur) => s = cur,
                }
            } else {
                s = ps.load(Ordering::Acquire);
            }
        }
    }

    pub fn unfix_exclusive(&self, pid: PageId) {
        let ps = &self.page_states[pid as usize];
        let s = ps.load(Ordering::Acquire);
        let new_s = ((s & !page::STATE_MASK) + VERSION_STEP) | STATE_UNLOCKED | DIRTY_BIT | MODIFIED_BIT;
        ps.store(new_s, Ordering::Release);
    }

    pub fn fix_shared(&self, pid: PageId, scan: bool) -> *const u8 {
        assert_ne!(pid, INVALID_PAGE_ID);
        let ps = &self.page_states[pid as usize];
        let mut s = ps.load(Ordering::Acquire);
        loop {
            let m = page::mode(s);
            if m == STATE_EVICTED {
                let locked = (s & !page::STATE_MASK) | STATE_LOCKED;
                match ps.compare_exchange_weak(s, locked, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        self.fault_locked(pid);
                        self.resident.insert(pid);
                        self.num_resident_physical.fetch_add(1, Ordering::Relaxed);
                        ps.store((locked & !page::STATE_MASK) | STATE_SHARED_MIN, Ordering::Release);
                        self.policy.on_ref(pid, scan);
                        self.ensure_capacity();
                        return self.memory[pid as usize].as_ptr();
                    }
                    Err(cur) => s = cur,
                }
            } else if m == STATE_MARKED || m == STATE_UNLOCKED {
                let new_s = (s & !page::STATE_MASK) | STATE_SHARED_MIN;
                match ps.compare_exchange_weak(s, new_s, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        if m == STATE_MARKED {
                            self.policy.on_ref(pid, scan);
                        }
                        return self.memory[pid as usize].as_ptr();
                    }
                    Err(cur) => s = cur,
                }
            } else if page::is_shared(m) && m < page::STATE_SHARED_MAX {
                let new_s = (s & !page::STATE_MASK) | (m + 1);
                match ps.compare_exchange_weak(s, new_s, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return self.memory[pid as usize].as_ptr(),
                    Err(cur) => s = cur,
                }
            } else {
                s = ps.load(Ordering::Acquire);
            }
        }
    }

    pub fn unfix_shared(&self, pid: PageId) {
        let ps = &self.page_states[pid as usize];
        let mut s = ps.load(Ordering::Acquire);
        loop {
            debug_assert!(page::is_shared(page::mode(s)));
            match ps.compare_exchange_weak(s, s - 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(cur) => s = cur,
            }
        }
    }

    /// Optimistic capture: `Unlocked`/`Marked`/any shared count is fine to
    /// read without a latch; `Locked` (write in progress) spins briefly.
    /// `Marked` is softly cleared back to `Unlocked` as a hint to the clock
    /// sweep. Returns the captured state word (mode + dirty/modified +
    /// version) used later for validation.
    pub fn optimistic_capture(&self, pid: PageId) -> u64 {
        let ps = &self.page_states[pid as usize];
        loop {
            let s = ps.load(Ordering::Acquire);
            match page::mode(s) {
                STATE_MARKED => {
                    let new_s = (s & !page::STATE_MASK) | STATE_UNLOCKED;
                    if ps.compare_exchange_weak(s, new_s, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                        return new_s;
                    }
                }
                STATE_LOCKED => std::hint::spin_loop(),
                STATE_EVICTED => {
                    let locked = (s & !page::STATE_MASK) | STATE_LOCKED;
                    if ps.compare_exchange_weak(s, locked, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                        self.fault_locked(pid);
                        self.resident.insert(pid);
                        self.num_resident_physical.fetch_add(1, Ordering::Relaxed);
                        let unlocked = (locked & !page::STATE_MASK) | STATE_UNLOCKED;
                        ps.store(unlocked, Ordering::Release);
                    }
                }
                _ => return s,
            }
        }
    }

    /// `true` iff nothing has exclusively latched (and thus bumped the
    /// version of) the page since `captured` was taken; concurrent shared
    /// latches are ignored (spec.md P-OptimisticNoFalseAlarm).
    pub fn optimistic_validate(&self, pid: PageId, captured: u64) -> bool {
        let s = self.page_states[pid as usize].load(Ordering::Acquire);
        page::version(s) == page::version(captured)
    }

    pub fn page_ptr(&self, pid: PageId) -> *const u8 {
        self.memory[pid as usize].as_ptr()
    }

    pub fn page_mut_ptr(&self, pid: PageId) -> *mut u8 {
        self.memory[pid as usize].as_mut_ptr()
    }

    // -- temporary pages --------------------------------------------------

    /// Anonymous memory for batches/hash tables: charged against the same
    /// physical budget, tracked by the eviction policy, never written to
    /// the backing file.
    pub fn alloc_temp(&self, num_pages: usize) -> Result<PageId> {
        let first = self.num_allocated.fetch_add(num_pages as u64, Ordering::Relaxed);
        if (first as usize + num_pages) > self.memory.len() {
            return Err(DbError::ResourceExhausted("temp page allocation beyond virtual page cap".into()));
        }
        let mut temp = self.temp_pages.write().unwrap();
        for i in 0..num_pages as u64 {
            let pid = first + i;
            self.page_states[pid as usize].store(STATE_UNLOCKED, Ordering::Release);
            self.resident.insert(pid);
            temp.insert(pid);
        }
        drop(temp);
        self.num_resident_physical.fetch_add(num_pages as i64, Ordering::Relaxed);
        self.ensure_capacity();
        Ok(first)
    }

    pub fn drop_temp(&self, pid: PageId, num_pages: usize) {
        let mut temp = self.temp_pages.write().unwrap();
        for i in 0..num_pages as u64 {
            let p = pid + i;
            temp.remove(&p);
            self.resident.remove(p);
            self.page_states[p as usize].store(STATE_EVICTED, Ordering::Release);
        }
        drop(temp);
        self.num_resident_physical.fetch_sub(num_pages as i64, Ordering::Relaxed);
    }

    /// Flushes every still-resident dirty, non-temporary page. A page found
    /// latched at shutdown is a warning (possible leak), not a panic
    /// (spec.md §4.1 "Failure model").
    pub fn shutdown(&self) -> Result<()> {
        let resident = self.resident.snapshot();
        let temp = self.temp_pages.read().unwrap();
        for pid in resident {
            if temp.contains(&pid) {
                continue;
            }
            let s = self.page_states[pid as usize].load(Ordering::Acquire);
            if page::mode(s) != STATE_UNLOCKED && page::mode(s) != STATE_MARKED {
                warn!(page = pid, "page still latched at shutdown (possible leak)");
            }
            if page::is_dirty(s) {
                if let Err(e) = self.flush_page_locked(pid) {
                    warn!(page = pid, error = %e, "shutdown flush failed (known limitation)");
                }
            }
        }
        Ok(())
    }
}

impl PageStateView for VMCache {
    fn page_state(&self, pid: PageId) -> &PageState {
        &self.page_states[pid as usize]
    }

    fn resident_pages(&self) -> Vec<PageId> {
        self.resident.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_physical: usize) -> VMCache {
        VMCache::open(VMCacheConfig {
            virtual_pages: 4096,
            max_physical_pages: max_physical,
            eviction_policy: EvictionPolicyKind::Clock,
            mru_ring_capacity: 16,
            backing_file: None,
        })
        .unwrap()
    }

    #[test]
    fn p_persist_survives_eviction_pressure() {
        let cache = small_cache(8);
        let p = cache.allocate_page().unwrap();
        let ptr = cache.fix_exclusive(p);
        unsafe { std::ptr::write_bytes(ptr, 0xAB, PAGE_SIZE) };
        cache.unfix_exclusive(p);

        for _ in 0..64 {
            let q = cache.allocate_page().unwrap();
            let qptr = cache.fix_shared(q, false);
            let _ = qptr;
            cache.unfix_shared(q);
        }

        let rptr = cache.fix_shared(p, false);
        let bytes = unsafe { std::slice::from_raw_parts(rptr, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
        cache.unfix_shared(p);
    }

    #[test]
    fn p_capacity_never_exceeds_max_physical() {
        let cache = small_cache(4);
        for _ in 0..100 {
            let p = cache.allocate_page().unwrap();
            cache.fix_shared(p, false);
            cache.unfix_shared(p);
            assert!(cache.resident_count() <= cache.max_physical_pages());
        }
    }

    #[test]
    fn optimistic_no_false_alarm_under_shared_only() {
        let cache = small_cache(16);
        let p = cache.allocate_page().unwrap();
        let v = cache.optimistic_capture(p);
        cache.fix_shared(p, false);
        cache.unfix_shared(p);
        assert!(cache.optimistic_validate(p, v));
    }

    #[test]
    fn optimistic_detects_exclusive_write() {
        let cache = small_cache(16);
        let p = cache.allocate_page().unwrap();
        let v = cache.optimistic_capture(p);
        cache.fix_exclusive(p);
        cache.unfix_exclusive(p);
        assert!(!cache.optimistic_validate(p, v));
    }
}
