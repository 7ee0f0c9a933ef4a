use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info};

use crate::page::PageRef;
use crate::pmem::{persist, sfence};
use crate::pointer::PolymorphicPointer;
use crate::{StoreError, WorkerId, MAX_WORKERS};

pub const REGION_NUM: usize = MAX_WORKERS;

/// Commits per region before a checkpoint coalesces them.
pub const BATCH_SIZE: usize = 8;

#[cfg(debug_assertions)]
const REGION_SIZE: usize = 16;
#[cfg(not(debug_assertions))]
const REGION_SIZE: usize = 64;

const ENTRY_NUM: usize = BATCH_SIZE * REGION_SIZE;
const LOG_REGIONS_MAGIC: u64 = 0x1357_2468_1357_2468;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Insert = 0,
    Update = 1,
    Delete = 2,
    NodeSplit = 3,
    Unknown = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogStatus {
    None = 0,
    Uncommitted = 1,
    Committed = 2,
}

/*
 * An entry is uncommitted-with-non-null-address exactly when the
 * allocator assigned memory that a crash must reclaim. The address word
 * is written by the allocator itself, through an AddressSlot, so the
 * log is the sole durable record of the in-flight chunk.
 */
#[repr(C)]
struct LogEntry {
    address: u64,
    op: u8,
    status: u8,
    _pad: [u8; 6],
}

#[repr(C)]
struct LogRegion {
    /// reclamation watermark
    checkpointed: u64,
    /// next free entry
    cursor: u64,
    entries: [LogEntry; ENTRY_NUM],
}

#[repr(C)]
struct LogRegions {
    magic: u64,
    regions: [LogRegion; REGION_NUM],
}

/// Bytes of PM the log area occupies at the start of the engine's
/// data region.
pub const fn log_area_size() -> usize {
    std::mem::size_of::<LogRegions>()
}

/// Handle on one log entry's `address` word in PM.
///
/// `Allocator::allocate` (or the remote agent) writes the placed chunk
/// address through it; the caller reads the binding back once the call
/// returns.
#[derive(Clone, Copy)]
pub struct AddressSlot {
    ptr: *mut u64,
}

unsafe impl Send for AddressSlot {}

impl AddressSlot {
    fn new(ptr: *mut u64) -> Self {
        Self { ptr }
    }

    pub(crate) fn raw(&self) -> *mut u64 {
        self.ptr
    }

    pub fn get(&self) -> PolymorphicPointer {
        PolymorphicPointer::from_raw(unsafe { self.ptr.read_volatile() })
    }

    pub fn set(&self, ptr: PolymorphicPointer) {
        unsafe { self.ptr.write_volatile(ptr.raw()) };
        persist(self.ptr as *const u8, 8);
    }

    #[cfg(test)]
    pub(crate) fn for_test(word: &mut u64) -> Self {
        Self::new(word)
    }
}

/// Per-worker write-ahead log over a ring of PM entries.
pub struct Logger {
    regions: *mut LogRegions,
    in_use: [AtomicBool; REGION_NUM],
    counters: [AtomicUsize; REGION_NUM],
}

unsafe impl Send for Logger {}
unsafe impl Sync for Logger {}

impl Logger {
    fn attach(pm: *mut u8) -> Self {
        Self {
            regions: pm as *mut LogRegions,
            in_use: std::array::from_fn(|_| AtomicBool::new(false)),
            counters: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Format fresh log regions at the start of the PM data area.
    ///
    /// # Safety
    ///
    /// `pm` must point at `log_area_size()` bytes of mapped PM reserved
    /// for the log.
    pub unsafe fn format(pm: *mut u8) -> Self {
        let logger = Self::attach(pm);
        let r = logger.regions;
        for i in 0..REGION_NUM {
            Self::format_region(&mut (*r).regions[i]);
        }
        persist(pm as *const u8, log_area_size());
        sfence();
        (*r).magic = LOG_REGIONS_MAGIC;
        persist(r as *const u8, 8);
        logger
    }

    unsafe fn format_region(region: *mut LogRegion) {
        for e in (*region).entries.iter_mut() {
            e.address = 0;
            e.op = LogOp::Unknown as u8;
            e.status = LogStatus::None as u8;
        }
        (*region).checkpointed = 0;
        (*region).cursor = 0;
    }

    /// Replay the log over the PM heap, then hand back a fresh logger.
    ///
    /// Every uncommitted entry holding a local address is an allocation
    /// whose workflow never completed: its record header is zeroed and
    /// its page recounted; pages that come up empty are returned per
    /// region so the caller can link them onto the matching worker
    /// free list. Uncommitted *remote* addresses are skipped: the peer
    /// that owns the memory reclaims it when it recovers.
    ///
    /// # Safety
    ///
    /// As `format`; any addresses recorded in the log must still map to
    /// formatted pages.
    pub unsafe fn recover(pm: *mut u8) -> (Self, Vec<(WorkerId, Vec<u64>)>) {
        let logger = Self::attach(pm);
        let r = logger.regions;
        if (*r).magic != LOG_REGIONS_MAGIC {
            info!("no log regions found, formatting");
            return (Self::format(pm), Vec::new());
        }

        let mut freed = Vec::new();
        for i in 0..REGION_NUM {
            let region = &mut (*r).regions[i];
            let pages = Self::recover_region(region);
            if !pages.is_empty() {
                freed.push((i, pages));
            }
            Self::format_region(region);
        }
        persist(pm as *const u8, log_area_size());
        sfence();
        (logger, freed)
    }

    unsafe fn recover_region(region: *mut LogRegion) -> Vec<u64> {
        let start = (*region).checkpointed.min(ENTRY_NUM as u64) as usize;
        let end = (*region).cursor.min(ENTRY_NUM as u64) as usize;

        let mut touched = HashSet::new();
        let mut replayed = 0;
        for i in start..end {
            let e = &(*region).entries[i];
            if e.status != LogStatus::Uncommitted as u8 || e.address == 0 {
                continue;
            }
            let ptr = PolymorphicPointer::from_raw(e.address);
            if ptr.is_remote() {
                continue;
            }
            let page = PageRef::of_chunk(e.address);
            page.zero_record((e.address - page.addr()) as u16);
            touched.insert(page.addr());
            replayed += 1;
        }

        let mut freed = Vec::new();
        for addr in touched {
            let page = PageRef::from_base(addr);
            // records == 0 means the page was already reclaimed onto a
            // free list before the crash; adopting it again would link
            // it twice
            if page.header().records == 0 {
                continue;
            }
            if page.recount_valid() == 0 {
                page.reset_cursors();
                freed.push(addr);
            }
        }

        (*region).checkpointed = 0;
        persist(std::ptr::addr_of!((*region).checkpointed) as *const u8, 8);
        sfence();
        (*region).cursor = 0;
        persist(std::ptr::addr_of!((*region).cursor) as *const u8, 8);

        if replayed > 0 {
            debug!(
                "log replay retracted {} allocations, freed {} pages",
                replayed,
                freed.len()
            );
        }
        freed
    }

    /// Bind a log region to the calling worker.
    pub fn register_worker(&self) -> Result<WorkerId, StoreError> {
        for i in 0..REGION_NUM {
            if self.in_use[i]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.counters[i].store(0, Ordering::Relaxed);
                return Ok(i);
            }
        }
        Err(StoreError::NoSlot)
    }

    /// Force-checkpoint and release the region.
    pub fn unregister_worker(&self, worker: WorkerId) {
        if worker >= REGION_NUM {
            return;
        }
        self.checkpoint(worker);
        self.counters[worker].store(0, Ordering::Relaxed);
        self.in_use[worker].store(false, Ordering::Release);
    }

    /// Append an uncommitted entry and return a handle on its address
    /// word for the allocator to fill in.
    pub fn make_log(&self, worker: WorkerId, op: LogOp) -> AddressSlot {
        unsafe {
            let region = &mut (*self.regions).regions[worker];
            if region.cursor as usize == ENTRY_NUM {
                // ring is full, coalesce before wrapping
                self.checkpoint_region(region);
            }
            let e = &mut region.entries[region.cursor as usize];
            e.address = 0;
            persist(std::ptr::addr_of!(e.address) as *const u8, 8);
            sfence();
            e.op = op as u8;
            e.status = LogStatus::Uncommitted as u8;
            persist(e as *const LogEntry as *const u8, 16);
            sfence();
            region.cursor += 1;
            persist(std::ptr::addr_of!(region.cursor) as *const u8, 8);
            AddressSlot::new(std::ptr::addr_of_mut!(e.address))
        }
    }

    /// Account one finished logical operation; checkpoints the region
    /// once a whole batch is in.
    pub fn commit(&self, worker: WorkerId) {
        if self.counters[worker].fetch_add(1, Ordering::Relaxed) + 1 >= BATCH_SIZE {
            self.checkpoint(worker);
        }
    }

    /// Checkpoint every region; the clean-shutdown path.
    pub fn checkpoint_all(&self) {
        for i in 0..REGION_NUM {
            self.checkpoint(i);
        }
    }

    /// Force-commit the region.
    pub fn checkpoint(&self, worker: WorkerId) {
        unsafe {
            let region = &mut (*self.regions).regions[worker];
            self.checkpoint_region(region);
        }
        self.counters[worker].store(0, Ordering::Relaxed);
    }

    unsafe fn checkpoint_region(&self, region: &mut LogRegion) {
        let end = (region.cursor as usize).min(ENTRY_NUM);
        for i in (region.checkpointed as usize).min(end)..end {
            region.entries[i].status = LogStatus::Committed as u8;
        }
        if end > 0 {
            persist(region.entries.as_ptr() as *const u8, end * 16);
        }
        region.checkpointed = 0;
        persist(std::ptr::addr_of!(region.checkpointed) as *const u8, 8);
        sfence();
        region.cursor = 0;
        persist(std::ptr::addr_of!(region.cursor) as *const u8, 8);
    }

    #[cfg(test)]
    fn entry_state(&self, worker: WorkerId, idx: usize) -> (u64, u8, u8) {
        unsafe {
            let e = &(*self.regions).regions[worker].entries[idx];
            (e.address, e.op, e.status)
        }
    }

    #[cfg(test)]
    fn cursor(&self, worker: WorkerId) -> u64 {
        unsafe { (*self.regions).regions[worker].cursor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::PmRegion;

    fn fresh() -> (PmRegion, Logger) {
        let region = PmRegion::open_anon(log_area_size() + 64).unwrap();
        let logger = unsafe { Logger::format(region.base()) };
        (region, logger)
    }

    #[test]
    fn make_log_appends_uncommitted_null_entries() {
        let (_region, logger) = fresh();
        let w = logger.register_worker().unwrap();

        let slot = logger.make_log(w, LogOp::Insert);
        assert!(slot.get().is_null());
        assert_eq!(logger.cursor(w), 1);
        let (addr, op, status) = logger.entry_state(w, 0);
        assert_eq!(addr, 0);
        assert_eq!(op, LogOp::Insert as u8);
        assert_eq!(status, LogStatus::Uncommitted as u8);

        slot.set(PolymorphicPointer::make_local(0xdead0));
        let (addr, _, _) = logger.entry_state(w, 0);
        assert_eq!(addr, 0xdead0);
    }

    #[test]
    fn batch_of_commits_checkpoints() {
        let (_region, logger) = fresh();
        let w = logger.register_worker().unwrap();

        for _ in 0..BATCH_SIZE {
            let _ = logger.make_log(w, LogOp::Insert);
            logger.commit(w);
        }
        // the batch boundary reset the ring
        assert_eq!(logger.cursor(w), 0);
        let (_, _, status) = logger.entry_state(w, BATCH_SIZE - 1);
        assert_eq!(status, LogStatus::Committed as u8);
    }

    #[test]
    fn ring_wrap_checkpoints_implicitly() {
        let (_region, logger) = fresh();
        let w = logger.register_worker().unwrap();
        for _ in 0..ENTRY_NUM + 3 {
            let _ = logger.make_log(w, LogOp::Update);
        }
        assert_eq!(logger.cursor(w), 3);
    }

    #[test]
    fn worker_slots_are_exclusive() {
        let (_region, logger) = fresh();
        let a = logger.register_worker().unwrap();
        let b = logger.register_worker().unwrap();
        assert_ne!(a, b);
        logger.unregister_worker(a);
        assert_eq!(logger.register_worker().unwrap(), a);
    }
}
