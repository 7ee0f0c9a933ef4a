use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::pmem::persist;
use crate::pointer::{PolymorphicPointer, RemotePointer};
use crate::wal::AddressSlot;
use crate::{StoreError, WorkerId, MAX_WORKERS};

/// Remote sub-regions a worker can hold at once.
#[cfg(debug_assertions)]
pub const REMOTE_REGIONS: usize = 4;
#[cfg(not(debug_assertions))]
pub const REMOTE_REGIONS: usize = 32;

/// Hard cap per granted sub-region; the cursor is 32 bits.
pub const MAX_REGION_SIZE: u64 = u32::MAX as u64;

/// One-sided byte channel to a peer's PM region. RDMA verbs
/// implementations live outside the engine; tests use [`LoopbackChannel`].
///
/// `post_write`/`post_read` queue the transfer; `poll_completion_once`
/// blocks the worker until it lands. The engine always pairs them, so a
/// returned `Ok` means durably transmitted.
pub trait PeerChannel: Send + Sync {
    fn post_write(&self, offset: u64, payload: &[u8]) -> Result<(), StoreError>;
    fn post_read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError>;
    fn poll_completion_once(&self) -> Result<(), StoreError>;
}

/*
 * Peer-granted regions are bump allocators: freeing only drops the
 * object count, no coalescing. counter and cursor share one word so a
 * bump persists atomically.
 */
#[repr(C)]
struct RemoteRegion {
    /// RemotePointer to the region base; 0 = slot unused
    base: u64,
    /// region length in bytes
    limit: u64,
    /// live objects
    counter: u32,
    /// bump offset
    cursor: u32,
}

#[repr(C)]
struct AgentState {
    rings: [[RemoteRegion; REMOTE_REGIONS]; MAX_WORKERS],
    /// active region per worker
    active: [u64; MAX_WORKERS],
    /// regions granted per worker
    granted: [u64; MAX_WORKERS],
}

/// Bytes of PM the agent state occupies in the engine layout.
pub const fn agent_area_size() -> usize {
    std::mem::size_of::<AgentState>()
}

/// Owns the per-worker rings of peer PM sub-regions and the channels to
/// reach them. Placing a value remotely allocates from the active
/// region and pushes the bytes over the channel before the handle is
/// handed back to the index.
pub struct RemoteMemoryAgent {
    state: *mut AgentState,
    channels: RwLock<HashMap<(WorkerId, u8), Arc<dyn PeerChannel>>>,
}

unsafe impl Send for RemoteMemoryAgent {}
unsafe impl Sync for RemoteMemoryAgent {}

impl RemoteMemoryAgent {
    /// Zero the agent area and attach.
    ///
    /// # Safety
    ///
    /// `pm` must point at `agent_area_size()` bytes of mapped PM
    /// reserved for the agent.
    pub unsafe fn format(pm: *mut u8) -> Self {
        std::ptr::write_bytes(pm, 0, agent_area_size());
        persist(pm, agent_area_size());
        Self::attach(pm)
    }

    /// Attach over existing agent state, keeping region refcounts.
    ///
    /// # Safety
    ///
    /// As `format`.
    pub unsafe fn attach(pm: *mut u8) -> Self {
        Self {
            state: pm as *mut AgentState,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Record a peer-granted sub-region on the worker's ring.
    pub fn add_region(&self, worker: WorkerId, base: RemotePointer, limit: u64) -> bool {
        if limit == 0 || limit > MAX_REGION_SIZE {
            return false;
        }
        let s = self.state;
        unsafe {
            let n = (*s).granted[worker] as usize;
            if n >= REMOTE_REGIONS {
                return false;
            }
            let region = &mut (*s).rings[worker][n];
            region.base = base.raw();
            region.limit = limit;
            region.counter = 0;
            region.cursor = 0;
            persist(region as *const RemoteRegion as *const u8, 24);
            (*s).granted[worker] = (n + 1) as u64;
            persist(std::ptr::addr_of!((*s).granted[worker]) as *const u8, 8);
        }
        debug!(
            "worker {} granted {} bytes on node {}",
            worker,
            limit,
            base.node_id()
        );
        true
    }

    /// Bump-allocate from the active region, rolling to the next on
    /// exhaustion. The handle lands in `slot`; null when no region has
    /// room left.
    pub fn allocate(&self, worker: WorkerId, size: usize, slot: &AddressSlot) {
        let s = self.state;
        unsafe {
            loop {
                let active = (*s).active[worker] as usize;
                if active >= (*s).granted[worker] as usize {
                    slot.set(PolymorphicPointer::NULL);
                    return;
                }
                let region = &mut (*s).rings[worker][active];
                let cursor = u64::from(region.cursor);
                if region.base != 0 && cursor + size as u64 <= region.limit {
                    let base = region_base(region.base);
                    let handle =
                        PolymorphicPointer::make_remote(base.node_id(), base.offset() + cursor);
                    // counter and cursor publish together
                    region.counter += 1;
                    region.cursor = (cursor + size as u64) as u32;
                    persist(std::ptr::addr_of!(region.counter) as *const u8, 8);
                    slot.set(handle);
                    return;
                }
                (*s).active[worker] += 1;
                persist(std::ptr::addr_of!((*s).active[worker]) as *const u8, 8);
            }
        }
    }

    /// Whether the worker still has remote room.
    pub fn available(&self, worker: WorkerId) -> bool {
        let s = self.state;
        unsafe {
            let granted = (*s).granted[worker] as usize;
            ((*s).active[worker] as usize..granted).any(|i| {
                let region = &(*s).rings[worker][i];
                region.base != 0 && u64::from(region.cursor) < region.limit
            })
        }
    }

    /// Drop one object from the region owning `ptr`. Refcount only.
    pub fn free(&self, worker: WorkerId, ptr: RemotePointer) {
        let s = self.state;
        unsafe {
            for i in 0..(*s).granted[worker] as usize {
                let region = &mut (*s).rings[worker][i];
                if region.base == 0 {
                    continue;
                }
                let base = region_base(region.base);
                if base.node_id() == ptr.node_id()
                    && ptr.offset() >= base.offset()
                    && ptr.offset() < base.offset() + region.limit
                {
                    region.counter = region.counter.saturating_sub(1);
                    persist(std::ptr::addr_of!(region.counter) as *const u8, 8);
                    return;
                }
            }
        }
    }

    pub fn set_channel(&self, worker: WorkerId, node: u8, channel: Arc<dyn PeerChannel>) {
        self.channels.write().insert((worker, node), channel);
    }

    pub fn get_peer_connection(&self, worker: WorkerId, node: u8) -> Option<Arc<dyn PeerChannel>> {
        self.channels.read().get(&(worker, node)).cloned()
    }

    /// Push bytes into peer PM and wait for the completion.
    pub fn write_remote(
        &self,
        worker: WorkerId,
        ptr: RemotePointer,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let channel = self
            .get_peer_connection(worker, ptr.node_id())
            .ok_or(StoreError::TransportFailure("no channel to peer"))?;
        channel.post_write(ptr.offset(), payload)?;
        channel.poll_completion_once()
    }

    /// Fetch bytes from peer PM and wait for the completion.
    pub fn read_remote(
        &self,
        worker: WorkerId,
        ptr: RemotePointer,
        buf: &mut [u8],
    ) -> Result<(), StoreError> {
        let channel = self
            .get_peer_connection(worker, ptr.node_id())
            .ok_or(StoreError::TransportFailure("no channel to peer"))?;
        channel.post_read(ptr.offset(), buf)?;
        channel.poll_completion_once()
    }
}

fn region_base(raw: u64) -> RemotePointer {
    PolymorphicPointer::from_raw(raw).remote()
}

/// In-process stand-in for an RDMA queue pair, backed by a shared
/// buffer. Offsets index straight into the buffer.
pub struct LoopbackChannel {
    mem: Mutex<Vec<u8>>,
}

impl LoopbackChannel {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(vec![0; size]),
        })
    }
}

impl PeerChannel for LoopbackChannel {
    fn post_write(&self, offset: u64, payload: &[u8]) -> Result<(), StoreError> {
        let mut mem = self.mem.lock();
        let start = offset as usize;
        let end = start
            .checked_add(payload.len())
            .ok_or(StoreError::TransportFailure("write out of bounds"))?;
        if end > mem.len() {
            return Err(StoreError::TransportFailure("write out of bounds"));
        }
        mem[start..end].copy_from_slice(payload);
        Ok(())
    }

    fn post_read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let mem = self.mem.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(StoreError::TransportFailure("read out of bounds"))?;
        if end > mem.len() {
            return Err(StoreError::TransportFailure("read out of bounds"));
        }
        buf.copy_from_slice(&mem[start..end]);
        Ok(())
    }

    fn poll_completion_once(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> (Vec<u64>, RemoteMemoryAgent) {
        let mut pm = vec![0u64; agent_area_size() / 8 + 1];
        let agent = unsafe { RemoteMemoryAgent::format(pm.as_mut_ptr() as *mut u8) };
        (pm, agent)
    }

    #[test]
    fn bump_allocation_rolls_between_regions() {
        let (_pm, agent) = agent();
        assert!(!agent.available(0));
        assert!(agent.add_region(0, RemotePointer::make(2, 0x1000), 64));
        assert!(agent.add_region(0, RemotePointer::make(3, 0x8000), 64));
        assert!(agent.available(0));

        let mut word = 0u64;
        let slot = AddressSlot::for_test(&mut word);
        agent.allocate(0, 48, &slot);
        let first = slot.get();
        assert!(first.is_remote());
        assert_eq!(first.node_id(), 2);
        assert_eq!(first.remote().offset(), 0x1000);

        // 48 more bytes don't fit region one, roll to region two
        agent.allocate(0, 48, &slot);
        let second = slot.get();
        assert_eq!(second.node_id(), 3);
        assert_eq!(second.remote().offset(), 0x8000);

        agent.allocate(0, 32, &slot);
        assert_eq!(slot.get().node_id(), 3);

        // both exhausted now
        agent.allocate(0, 64, &slot);
        assert!(slot.get().is_null());
        assert!(!agent.available(0));
    }

    #[test]
    fn free_is_refcount_only() {
        let (_pm, agent) = agent();
        agent.add_region(0, RemotePointer::make(5, 0), 128);
        let mut word = 0u64;
        let slot = AddressSlot::for_test(&mut word);
        agent.allocate(0, 64, &slot);
        let ptr = slot.get().remote();
        agent.free(0, ptr);
        // space is not reclaimed
        agent.allocate(0, 128, &slot);
        assert!(slot.get().is_null());
    }

    #[test]
    fn loopback_round_trip() {
        let (_pm, agent) = agent();
        let channel = LoopbackChannel::new(4096);
        agent.set_channel(1, 9, channel);

        let ptr = RemotePointer::make(9, 64);
        agent.write_remote(1, ptr, b"remote value").unwrap();
        let mut buf = [0u8; 12];
        agent.read_remote(1, ptr, &mut buf).unwrap();
        assert_eq!(&buf, b"remote value");

        assert!(agent.write_remote(1, RemotePointer::make(8, 0), b"x").is_err());
    }
}
