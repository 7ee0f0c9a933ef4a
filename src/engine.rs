use std::sync::Arc;

use log::{info, warn};

use crate::alloc::{Allocator, RecoveryStatus};
use crate::config::NodeConfig;
use crate::pmem::{persist, sfence, PmRegion};
use crate::remote::{agent_area_size, RemoteMemoryAgent};
use crate::wal::{log_area_size, Logger};
use crate::{StoreError, WorkerId};

const ENGINE_META_MAGIC: u64 = 0x9e3d_71c4_9e3d_71c4;

/*
 * PM layout, from the base of the mapping:
 *
 *   |  log regions  |  agent state  |  engine meta  |
 *   |  allocator header  |  page-aligned heap ...   |
 *
 * The engine meta pins the bootstrap leaf so the index can find its
 * chain again after a restart.
 */
#[repr(C)]
struct EngineMeta {
    magic: u64,
    root_leaf: u64,
}

/// One node's storage engine: the mapped PM region and the subsystems
/// carved out of it. Workers register here and hold the same slot in
/// the allocator, the WAL and the agent.
pub struct Engine {
    // field order drops the subsystems before the mapping they point into
    logger: Arc<Logger>,
    allocator: Arc<Allocator>,
    agent: Arc<RemoteMemoryAgent>,
    meta: *mut EngineMeta,
    node_id: u8,
    recovered: bool,
    region: PmRegion,
}

unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl Engine {
    /// Map the configured PM file (or DRAM when none is configured) and
    /// recover or format the engine over it.
    pub fn from_config(config: &NodeConfig) -> Result<Self, StoreError> {
        let size = config.available_pm as usize;
        let region = match &config.pmem_file {
            Some(path) => PmRegion::open(path, size)?,
            None => {
                info!("pmem file not specified, using DRAM instead");
                PmRegion::open_anon(size)?
            }
        };
        Self::with_region(region, config.node_id)
    }

    /// Recover or format the engine over an already-mapped region.
    pub fn with_region(region: PmRegion, node_id: u8) -> Result<Self, StoreError> {
        let base = region.base();
        let log_offset = 0usize;
        let agent_offset = log_offset + align8(log_area_size());
        let meta_offset = agent_offset + align8(agent_area_size());
        let alloc_offset = meta_offset + align8(std::mem::size_of::<EngineMeta>());
        if region.len() < alloc_offset + crate::alloc::allocator_min_size() {
            return Err(StoreError::ConfigInvalid(format!(
                "PM region of {} bytes is too small for the engine layout",
                region.len()
            )));
        }

        let meta = unsafe { base.add(meta_offset) } as *mut EngineMeta;
        let alloc_base = unsafe { base.add(alloc_offset) };
        let alloc_size = region.len() - alloc_offset;

        let allocator = unsafe { Allocator::attach(alloc_base, alloc_size) };
        let (logger, allocator, agent, recovered) = match allocator.recover() {
            RecoveryStatus::Ok => {
                if unsafe { (*meta).magic } != ENGINE_META_MAGIC {
                    return Err(StoreError::Corrupted("allocator present but engine meta missing"));
                }
                let (logger, freed) = unsafe { Logger::recover(base.add(log_offset)) };
                for (worker, pages) in freed {
                    for page in pages {
                        allocator.adopt_free_page(worker, page);
                    }
                }
                let agent = unsafe { RemoteMemoryAgent::attach(base.add(agent_offset)) };
                info!("engine recovered from existing PM state");
                (logger, allocator, agent, true)
            }
            RecoveryStatus::Corrupted => return Err(StoreError::Corrupted("allocator header")),
            RecoveryStatus::NoAllocator => {
                let logger = unsafe { Logger::format(base.add(log_offset)) };
                let agent = unsafe { RemoteMemoryAgent::format(base.add(agent_offset)) };
                // the meta block lands before the allocator magic: until
                // the magic is durable the whole region reads as fresh
                unsafe {
                    (*meta).root_leaf = 0;
                    persist(meta as *const u8, std::mem::size_of::<EngineMeta>());
                    sfence();
                    (*meta).magic = ENGINE_META_MAGIC;
                    persist(meta as *const u8, 8);
                }
                let allocator = unsafe { Allocator::format(alloc_base, alloc_size) };
                info!("engine formatted a fresh PM region");
                (logger, allocator, agent, false)
            }
        };

        Ok(Self {
            logger: Arc::new(logger),
            allocator: Arc::new(allocator),
            agent: Arc::new(agent),
            meta,
            node_id,
            recovered,
            region,
        })
    }

    /// Bind the calling thread to one worker slot across the allocator
    /// and the WAL.
    pub fn register_worker(&self) -> Result<WorkerId, StoreError> {
        let a = self.allocator.register_worker()?;
        let l = match self.logger.register_worker() {
            Ok(l) => l,
            Err(e) => {
                self.allocator.unregister_worker(a);
                return Err(e);
            }
        };
        if a != l {
            warn!("allocator and WAL slots diverged ({a} vs {l})");
            self.allocator.unregister_worker(a);
            self.logger.unregister_worker(l);
            return Err(StoreError::NoSlot);
        }
        Ok(a)
    }

    pub fn unregister_worker(&self, worker: WorkerId) {
        self.logger.unregister_worker(worker);
        self.allocator.unregister_worker(worker);
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn agent(&self) -> &Arc<RemoteMemoryAgent> {
        &self.agent
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Whether the engine came up over pre-existing PM state.
    pub fn was_recovered(&self) -> bool {
        self.recovered
    }

    /// Bootstrap leaf of the index chain; 0 until an index exists.
    pub fn root_leaf(&self) -> u64 {
        unsafe { (*self.meta).root_leaf }
    }

    pub(crate) fn set_root_leaf(&self, addr: u64) {
        unsafe {
            (*self.meta).root_leaf = addr;
            persist(std::ptr::addr_of!((*self.meta).root_leaf) as *const u8, 8);
        }
    }

    /// Checkpoint every log region and write the mapping back. Dropping
    /// the engine without calling this models a crash.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.logger.checkpoint_all();
        self.region.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn region() -> PmRegion {
        PmRegion::open_anon(log_area_size() + agent_area_size() + 512 * PAGE_SIZE).unwrap()
    }

    #[test]
    fn format_then_register_workers() {
        let engine = Engine::with_region(region(), 1).unwrap();
        assert!(!engine.was_recovered());
        assert_eq!(engine.root_leaf(), 0);

        let a = engine.register_worker().unwrap();
        let b = engine.register_worker().unwrap();
        assert_ne!(a, b);
        engine.unregister_worker(a);
        assert_eq!(engine.register_worker().unwrap(), a);
    }

    #[test]
    fn too_small_region_is_rejected() {
        let tiny = PmRegion::open_anon(PAGE_SIZE).unwrap();
        assert!(matches!(
            Engine::with_region(tiny, 1),
            Err(StoreError::ConfigInvalid(_))
        ));
    }
}
