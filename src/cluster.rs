use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use parking_lot::RwLock;

use crate::StoreError;

/// Cluster size cap, monitor included. Node ids fit the six bits a
/// remote pointer carries.
pub const MAX_NODE: usize = 64;
pub const MONITOR_ID: u8 = 0;
pub const CLIENT_ID: u8 = 0xff;

/// Per-node slot in the cluster metadata. Fixed wire layout,
/// little-endian, packed.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct NodeInfo {
    pub version: u64,
    pub node_id: i32,
    pub total_pm: u64,
    pub available_pm: u64,
    pub cpu_usage: f32,
    pub addr: [u8; 4],
    pub port: i32,
    pub is_active: u8,
}

/// Periodic node report to the monitor.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Heartbeat {
    pub node_id: i32,
    pub available_pm: u64,
    pub cpu_usage: f32,
}

/// One key range and the servers behind it. `nodes[0]` is the main
/// server; other occupied slots are replicas, `is_mem` marking the ones
/// that serve from memory.
#[derive(Clone, Debug)]
pub struct RangeInfo {
    pub version: u64,
    pub start: Vec<u8>,
    pub nodes: [u8; MAX_NODE],
    pub is_mem: [u8; MAX_NODE],
}

impl RangeInfo {
    fn new(start: Vec<u8>, main: u8) -> Self {
        let mut nodes = [0u8; MAX_NODE];
        nodes[0] = main;
        let mut is_mem = [1u8; MAX_NODE];
        is_mem[0] = 0;
        Self {
            version: 0,
            start,
            nodes,
            is_mem,
        }
    }
}

/// The cluster-wide partitioning of the key space. Reconstructible, so
/// it lives in DRAM only.
#[derive(Clone, Debug, Default)]
pub struct RangeGroup {
    pub infos: Vec<RangeInfo>,
}

impl RangeGroup {
    pub fn add_main(&mut self, start: &[u8], node_id: u8) {
        if node_id == MONITOR_ID {
            warn!("node 0 is not supposed to be in a range group");
            return;
        }
        if self.infos.iter().any(|i| i.start == start) {
            warn!("duplicated main server for range");
            return;
        }
        self.infos.push(RangeInfo::new(start.to_vec(), node_id));
    }

    pub fn append_node(&mut self, start: &[u8], node_id: u8, is_mem: bool) {
        if node_id == MONITOR_ID {
            warn!("node 0 is not supposed to be in a range group");
            return;
        }
        let Some(info) = self.infos.iter_mut().find(|i| i.start == start) else {
            warn!("no main server found for range");
            return;
        };
        if info.nodes[node_id as usize] != 0 {
            return;
        }
        info.nodes[node_id as usize] = node_id;
        info.is_mem[node_id as usize] = is_mem as u8;
    }

    pub fn append_cpu(&mut self, start: &[u8], node_id: u8) {
        self.append_node(start, node_id, false);
    }

    pub fn append_mem(&mut self, start: &[u8], node_id: u8) {
        self.append_node(start, node_id, true);
    }
}

/*
 * Wire format, all little-endian, packed:
 *   version        u64
 *   node_num       u64
 *   nodes          64 x NodeInfo
 *   num_infos      u64
 *   per range:     version u64 | key_len u64 | key bytes
 *                  | is_mem[64] | nodes[64]
 */
#[derive(Clone, Debug)]
pub struct ClusterMeta {
    pub version: u64,
    pub node_num: u64,
    pub nodes: [NodeInfo; MAX_NODE],
    pub group: RangeGroup,
}

impl Default for ClusterMeta {
    fn default() -> Self {
        Self {
            version: 0,
            node_num: 0,
            nodes: [NodeInfo::default(); MAX_NODE],
            group: RangeGroup::default(),
        }
    }
}

const NODE_INFO_SIZE: usize = std::mem::size_of::<NodeInfo>();

impl ClusterMeta {
    pub fn total_size(&self) -> usize {
        let mut size = 8 + 8 + MAX_NODE * NODE_INFO_SIZE + 8;
        for info in &self.group.infos {
            size += 8 + 8 + info.start.len() + MAX_NODE + MAX_NODE;
        }
        size
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        let mut word = [0u8; 8];

        LittleEndian::write_u64(&mut word, self.version);
        buf.extend_from_slice(&word);
        LittleEndian::write_u64(&mut word, self.node_num);
        buf.extend_from_slice(&word);
        buf.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        LittleEndian::write_u64(&mut word, self.group.infos.len() as u64);
        buf.extend_from_slice(&word);

        for info in &self.group.infos {
            LittleEndian::write_u64(&mut word, info.version);
            buf.extend_from_slice(&word);
            LittleEndian::write_u64(&mut word, info.start.len() as u64);
            buf.extend_from_slice(&word);
            buf.extend_from_slice(&info.start);
            buf.extend_from_slice(&info.is_mem);
            buf.extend_from_slice(&info.nodes);
        }
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, StoreError> {
        let mut meta = Self::default();
        let mut rest = buf;

        meta.version = take_u64(&mut rest)?;
        meta.node_num = take_u64(&mut rest)?;
        let nodes = take(&mut rest, MAX_NODE * NODE_INFO_SIZE)?;
        meta.nodes
            .copy_from_slice(bytemuck::cast_slice::<u8, NodeInfo>(nodes));
        let num_infos = take_u64(&mut rest)? as usize;

        for _ in 0..num_infos {
            let version = take_u64(&mut rest)?;
            let key_len = take_u64(&mut rest)? as usize;
            let start = take(&mut rest, key_len)?.to_vec();
            let mut info = RangeInfo::new(start, 1);
            info.version = version;
            info.is_mem.copy_from_slice(take(&mut rest, MAX_NODE)?);
            info.nodes.copy_from_slice(take(&mut rest, MAX_NODE)?);
            meta.group.infos.push(info);
        }
        Ok(meta)
    }

    /// Merge a peer's view in: strictly larger versions win, ties keep
    /// the local entry. The range group's order never changes, so infos
    /// merge positionally.
    pub fn update(&mut self, newer: &ClusterMeta) {
        for i in 0..MAX_NODE {
            if self.nodes[i].version < newer.nodes[i].version {
                self.nodes[i] = newer.nodes[i];
            }
        }
        for (info, incoming) in self.group.infos.iter_mut().zip(&newer.group.infos) {
            if info.version < incoming.version {
                info.version = incoming.version;
                info.nodes = incoming.nodes;
                info.is_mem = incoming.is_mem;
            }
        }
    }

    /// Smallest range index whose start key is strictly greater than
    /// `key`; `None` when every range starts at or below it.
    pub fn filter_node(&self, key: &[u8]) -> Option<usize> {
        self.group
            .infos
            .iter()
            .position(|info| info.start.as_slice() > key)
    }

    /// Main server of the range covering `key`, if any range does.
    pub fn route_node(&self, key: &[u8]) -> Option<u8> {
        let upper = self.filter_node(key).unwrap_or(self.group.infos.len());
        let covering = upper.checked_sub(1)?;
        Some(self.group.infos[covering].nodes[0])
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8], StoreError> {
    if rest.len() < n {
        return Err(StoreError::Wire("truncated cluster meta"));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, StoreError> {
    Ok(LittleEndian::read_u64(take(rest, 8)?))
}

/// Reader-writer-locked view shared between request handlers and the
/// monitor update path.
#[derive(Default)]
pub struct ClusterView {
    meta: RwLock<ClusterMeta>,
}

impl ClusterView {
    pub fn new(meta: ClusterMeta) -> Self {
        Self {
            meta: RwLock::new(meta),
        }
    }

    pub fn snapshot(&self) -> ClusterMeta {
        self.meta.read().clone()
    }

    pub fn merge(&self, newer: &ClusterMeta) {
        self.meta.write().update(newer);
    }

    pub fn route_node(&self, key: &[u8]) -> Option<u8> {
        self.meta.read().route_node(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterMeta {
        let mut meta = ClusterMeta::default();
        meta.version = 3;
        meta.node_num = 2;
        meta.nodes[1] = NodeInfo {
            version: 5,
            node_id: 1,
            total_pm: 1 << 30,
            available_pm: 1 << 29,
            cpu_usage: 0.25,
            addr: [10, 0, 0, 1],
            port: 7000,
            is_active: 1,
        };
        meta.group.add_main(b"a", 1);
        meta.group.add_main(b"m", 2);
        meta.group.append_mem(b"a", 2);
        meta.group.infos[0].version = 2;
        meta.group.infos[1].version = 1;
        meta
    }

    #[test]
    fn serialize_round_trip() {
        let meta = sample();
        let wire = meta.serialize();
        assert_eq!(wire.len(), meta.total_size());

        let back = ClusterMeta::deserialize(&wire).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.node_num, 2);
        assert_eq!({ back.nodes[1].node_id }, 1);
        assert_eq!(back.group.infos.len(), 2);
        assert_eq!(back.group.infos[0].start, b"a");
        assert_eq!(back.group.infos[0].nodes[2], 2);
        assert!(ClusterMeta::deserialize(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn merge_prefers_larger_versions() {
        let mut local = sample();
        let mut newer = sample();
        newer.nodes[1].version = 9;
        newer.nodes[1].available_pm = 42;
        newer.group.infos[0].version = 7;
        newer.group.infos[0].nodes[3] = 3;
        // stale entry must not clobber local state
        newer.group.infos[1].version = 0;
        newer.group.infos[1].nodes[0] = 9;

        local.update(&newer);
        assert_eq!({ local.nodes[1].available_pm }, 42);
        assert_eq!(local.group.infos[0].version, 7);
        assert_eq!(local.group.infos[0].nodes[3], 3);
        assert_eq!(local.group.infos[1].nodes[0], 2);
    }

    #[test]
    fn range_lookup() {
        let meta = sample();
        // ranges start at "a" and "m"
        assert_eq!(meta.filter_node(b"0"), Some(0));
        assert_eq!(meta.filter_node(b"b"), Some(1));
        assert_eq!(meta.filter_node(b"z"), None);

        assert_eq!(meta.route_node(b"0"), None);
        assert_eq!(meta.route_node(b"b"), Some(1));
        assert_eq!(meta.route_node(b"z"), Some(2));
    }
}
