use std::ptr::addr_of_mut;

use log::{debug, info};
use parking_lot::Mutex;

use crate::page::{PageRef, MAX_CHUNK};
use crate::pmem::{persist, sfence};
use crate::wal::AddressSlot;
use crate::{StoreError, WorkerId, MAX_WORKERS, PAGE_MASK, PAGE_SIZE};

const ALLOCATOR_MAGIC: u64 = 0xabcd_dcba_abcd_dcba;

/// Pages pulled from the global heap or free list per refill.
const BATCH_PAGES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Ok,
    Corrupted,
    NoAllocator,
}

/// Smallest PM area an allocator can sensibly manage: its header plus
/// room for a couple of refill batches.
pub const fn allocator_min_size() -> usize {
    std::mem::size_of::<AllocatorHeader>() + 2 * BATCH_PAGES * PAGE_SIZE
}

/*
 * The header lives in the first pages of the allocator's PM area. All
 * page links are absolute addresses (the PM mapping is pinned), 0 means
 * none. Per-worker slots make the fast path free of cross-worker
 * coordination; only global free-list and bump-cursor pulls take the
 * process-wide lock.
 */
#[repr(C)]
struct AllocatorHeader {
    magic: u64,
    total_size: u64,
    /// reusable pages returned by whole-page reclamation
    freelist: u64,
    /// first heap page
    base: u64,
    /// bump cursor over never-used pages
    cursor: u64,
    /// heap end, exclusive
    end: u64,
    free_lists: [u64; MAX_WORKERS],
    /// parking slot for de-registration; merged back on re-registration
    pending: [u64; MAX_WORKERS],
    /// page currently serving a worker's allocations
    busy: [u64; MAX_WORKERS],
    /// free-in-flight intent slot
    to_be_freed: [u64; MAX_WORKERS],
    in_use: [u8; MAX_WORKERS],
}

/// Crash-consistent page allocator over one PM area.
///
/// Every state transition writes its intent slot before mutating shared
/// state and clears it after the mutation persists, which is what lets
/// `recover` converge in a single sweep of idempotent passes.
pub struct Allocator {
    header: *mut AllocatorHeader,
    global: Mutex<()>,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

macro_rules! persist_field {
    ($hdr:expr, $($field:tt)+) => {{
        let slot = addr_of_mut!((*$hdr).$($field)+);
        persist(slot as *const u8, 8);
    }};
}

impl Allocator {
    /// Attach to an allocator area without validating or initializing it.
    ///
    /// # Safety
    ///
    /// `base` must point at `size` bytes of mapped PM, 8-byte aligned,
    /// reserved for this allocator alone.
    pub unsafe fn attach(base: *mut u8, size: usize) -> Self {
        debug_assert!(size >= allocator_min_size());
        Self {
            header: base as *mut AllocatorHeader,
            global: Mutex::new(()),
        }
    }

    /// Format a fresh allocator over the area.
    ///
    /// # Safety
    ///
    /// As `attach`; existing contents are discarded.
    pub unsafe fn format(base: *mut u8, size: usize) -> Self {
        let allocator = Self::attach(base, size);
        let h = allocator.header;

        let heap_base =
            (base as u64 + std::mem::size_of::<AllocatorHeader>() as u64 + PAGE_SIZE as u64 - 1)
                & PAGE_MASK;
        let end = (base as u64 + size as u64) & PAGE_MASK;

        (*h).total_size = size as u64;
        (*h).freelist = 0;
        (*h).base = heap_base;
        (*h).cursor = heap_base;
        (*h).end = end;
        for i in 0..MAX_WORKERS {
            (*h).free_lists[i] = 0;
            (*h).pending[i] = 0;
            (*h).busy[i] = 0;
            (*h).to_be_freed[i] = 0;
            (*h).in_use[i] = 0;
        }
        persist(h as *const u8, std::mem::size_of::<AllocatorHeader>());
        sfence();
        (*h).magic = ALLOCATOR_MAGIC;
        persist_field!(h, magic);

        info!(
            "formatted allocator: {} heap pages",
            (end - heap_base) / PAGE_SIZE as u64
        );
        allocator
    }

    /// Scan the header and make the persistent state self-consistent.
    ///
    /// Five idempotent passes, in order: finish interrupted
    /// de-registrations, re-advance the bump cursor past in-flight
    /// batches, finish interrupted free-list pops, de-registrations
    /// again, then drain the free-in-flight slots. Running it twice
    /// yields the same state as running it once.
    pub fn recover(&self) -> RecoveryStatus {
        let h = self.header;
        unsafe {
            if (*h).magic != ALLOCATOR_MAGIC {
                return RecoveryStatus::NoAllocator;
            }
            if (*h).cursor < (*h).base || (*h).cursor > (*h).end || (*h).base >= (*h).end {
                return RecoveryStatus::Corrupted;
            }

            self.recover_pending_list();
            self.recover_global_heap();
            self.recover_free_lists();
            self.recover_pending_list();
            self.recover_to_be_freed();

            for i in 0..MAX_WORKERS {
                (*h).in_use[i] = 0;
            }
            persist(addr_of_mut!((*h).in_use) as *const u8, MAX_WORKERS);
        }
        debug!("allocator recovered");
        RecoveryStatus::Ok
    }

    unsafe fn recover_pending_list(&self) {
        let h = self.header;
        for i in 0..MAX_WORKERS {
            if (*h).pending[i] != 0 && (*h).pending[i] == (*h).busy[i] {
                let busy = PageRef::from_base((*h).busy[i]);
                busy.set_next((*h).free_lists[i]);
                sfence();
                (*h).free_lists[i] = busy.addr();
                persist_field!(h, free_lists[i]);
                sfence();
                (*h).busy[i] = 0;
                persist_field!(h, busy[i]);
                (*h).pending[i] = 0;
                persist_field!(h, pending[i]);
            }
        }
    }

    unsafe fn recover_global_heap(&self) {
        let h = self.header;
        for i in 0..MAX_WORKERS {
            if (*h).free_lists[i] != 0 && (*h).free_lists[i] == (*h).cursor {
                (*h).cursor += (BATCH_PAGES * PAGE_SIZE) as u64;
                persist_field!(h, cursor);
            }
        }
    }

    unsafe fn recover_free_lists(&self) {
        let h = self.header;
        for i in 0..MAX_WORKERS {
            if (*h).busy[i] != 0 && (*h).busy[i] == (*h).free_lists[i] {
                let busy = PageRef::from_base((*h).busy[i]);
                (*h).free_lists[i] = busy.next();
                persist_field!(h, free_lists[i]);
                busy.set_next(0);
            }
        }
    }

    unsafe fn recover_to_be_freed(&self) {
        let h = self.header;
        for i in 0..MAX_WORKERS {
            let parked = (*h).to_be_freed[i];
            if parked != 0 {
                let page = PageRef::from_base(parked);
                if page.next() != 0 {
                    // free lists may have changed during recovery
                    page.set_next((*h).free_lists[i]);
                    sfence();
                    (*h).free_lists[i] = parked;
                    persist_field!(h, free_lists[i]);
                }
                (*h).to_be_freed[i] = 0;
                persist_field!(h, to_be_freed[i]);
            }
        }
    }

    /// Claim a worker slot. Any page parked by a previous occupant is
    /// merged back into the slot's free list.
    pub fn register_worker(&self) -> Result<WorkerId, StoreError> {
        let _g = self.global.lock();
        let h = self.header;
        unsafe {
            for i in 0..MAX_WORKERS {
                if (*h).in_use[i] == 0 {
                    (*h).in_use[i] = 1;
                    persist_field!(h, in_use[i]);
                    if (*h).pending[i] != 0 {
                        let parked = PageRef::from_base((*h).pending[i]);
                        parked.set_next((*h).free_lists[i]);
                        sfence();
                        (*h).free_lists[i] = parked.addr();
                        persist_field!(h, free_lists[i]);
                        sfence();
                        (*h).pending[i] = 0;
                        persist_field!(h, pending[i]);
                    }
                    return Ok(i);
                }
            }
        }
        Err(StoreError::NoSlot)
    }

    /// Park the worker's busy page and release the slot.
    pub fn unregister_worker(&self, worker: WorkerId) {
        if worker >= MAX_WORKERS {
            return;
        }
        let h = self.header;
        unsafe {
            (*h).pending[worker] = (*h).busy[worker];
            persist_field!(h, pending[worker]);
            sfence();
            (*h).busy[worker] = 0;
            persist_field!(h, busy[worker]);
            sfence();
            (*h).in_use[worker] = 0;
            persist_field!(h, in_use[worker]);
        }
    }

    /// Carve a chunk of at least `size` bytes out of the worker's busy
    /// page, pulling fresh pages as needed. The chunk address lands in
    /// `out` (a WAL entry's address word) before the allocation becomes
    /// durable; on exhaustion `out` is left null and `NoMemory` returned.
    pub fn allocate(
        &self,
        worker: WorkerId,
        size: usize,
        out: &AddressSlot,
    ) -> Result<(), StoreError> {
        if size > MAX_CHUNK {
            return Err(StoreError::ChunkTooLarge(size));
        }
        let h = self.header;
        unsafe {
            loop {
                let busy = (*h).busy[worker];
                if busy != 0 && PageRef::from_base(busy).allocate(size, out.raw()) {
                    return Ok(());
                }

                if (*h).free_lists[worker] == 0 {
                    self.refill(worker)?;
                }

                // pop the free-list head into the busy slot; a crash
                // between the stores is healed by recover_free_lists
                let head = (*h).free_lists[worker];
                (*h).busy[worker] = head;
                persist_field!(h, busy[worker]);
                sfence();
                let page = PageRef::from_base(head);
                (*h).free_lists[worker] = page.next();
                persist_field!(h, free_lists[worker]);
                sfence();
                page.set_next(0);
                sfence();
            }
        }
    }

    unsafe fn refill(&self, worker: WorkerId) -> Result<(), StoreError> {
        let _g = self.global.lock();
        let h = self.header;

        if (*h).freelist != 0 {
            // cut a batch off the global free list first, then hand it to
            // the worker; a crash in between only leaks the batch
            let begin = (*h).freelist;
            let mut end = PageRef::from_base(begin);
            for _ in 1..BATCH_PAGES {
                if end.next() == 0 {
                    break;
                }
                end = PageRef::from_base(end.next());
            }
            (*h).freelist = end.next();
            persist_field!(h, freelist);
            end.set_next(0);
            sfence();
            (*h).free_lists[worker] = begin;
            persist_field!(h, free_lists[worker]);
            return Ok(());
        }

        // from the global heap: format a fresh batch, publish it as the
        // worker's free list, then advance the cursor. recover_global_heap
        // re-advances the cursor if the crash hit between the two stores.
        let cursor = (*h).cursor;
        if cursor + (BATCH_PAGES * PAGE_SIZE) as u64 > (*h).end {
            return Err(StoreError::NoMemory);
        }
        for i in 0..BATCH_PAGES {
            let addr = cursor + (i * PAGE_SIZE) as u64;
            let next = if i + 1 < BATCH_PAGES {
                addr + PAGE_SIZE as u64
            } else {
                0
            };
            PageRef::format(addr, next);
        }
        sfence();
        (*h).free_lists[worker] = cursor;
        persist_field!(h, free_lists[worker]);
        sfence();
        (*h).cursor = cursor + (BATCH_PAGES * PAGE_SIZE) as u64;
        persist_field!(h, cursor);
        Ok(())
    }

    /// Return a chunk. Empty pages are linked onto the worker's free
    /// list. Pointers this allocator never served are ignored.
    pub fn free(&self, worker: WorkerId, ptr: u64) {
        let h = self.header;
        unsafe {
            if ptr < (*h).base || ptr >= (*h).end {
                return;
            }
            let page = PageRef::of_chunk(ptr);

            (*h).to_be_freed[worker] = page.addr();
            persist_field!(h, to_be_freed[worker]);
            sfence();

            if page.free(ptr) == Some(0) && (*h).busy[worker] != page.addr() {
                page.reset_cursors();
                page.set_next((*h).free_lists[worker]);
                sfence();
                (*h).free_lists[worker] = page.addr();
                persist_field!(h, free_lists[worker]);
            }

            sfence();
            (*h).to_be_freed[worker] = 0;
            persist_field!(h, to_be_freed[worker]);
        }
    }

    /// Adopt a page reclaimed by WAL replay onto a worker's free list.
    pub(crate) fn adopt_free_page(&self, worker: WorkerId, page_addr: u64) {
        let h = self.header;
        unsafe {
            if page_addr < (*h).base || page_addr >= (*h).end {
                return;
            }
            if (*h).busy[worker] == page_addr {
                (*h).busy[worker] = 0;
                persist_field!(h, busy[worker]);
                sfence();
            }
            let page = PageRef::from_base(page_addr);
            page.set_next((*h).free_lists[worker]);
            sfence();
            (*h).free_lists[worker] = page_addr;
            persist_field!(h, free_lists[worker]);
        }
    }

    /// Address of the first heap page. The engine's bootstrap allocation
    /// always lands there.
    pub fn heap_base(&self) -> u64 {
        unsafe { (*self.header).base }
    }

    #[cfg(test)]
    fn worker_free_pages(&self, worker: WorkerId) -> usize {
        let h = self.header;
        let mut n = 0;
        unsafe {
            let mut cur = (*h).free_lists[worker];
            while cur != 0 {
                n += 1;
                cur = PageRef::from_base(cur).next();
            }
        }
        n
    }
}
