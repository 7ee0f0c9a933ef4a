mod node;
pub use node::*;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::alloc::Allocator;
use crate::kv::{CompactString, MAX_STRING};
use crate::pointer::PolymorphicPointer;
use crate::remote::RemoteMemoryAgent;
use crate::wal::{AddressSlot, LogOp, Logger};
use crate::{StoreError, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    Failed,
    Retry,
    NoMemory,
    NeedSplit,
    RepeatInsert,
    Unknown,
}

/// Concurrent ordered map from key bytes to value handles. Leaves live
/// in PM and are chained in key order; inner nodes route in DRAM and are
/// rebuilt from the chain on restart.
///
/// Readers traverse lock-free over word-atomic slots. Writers are
/// sharded by key range; every mutation follows the order WAL append,
/// allocate, payload write, WAL commit.
pub struct Index {
    root: AtomicU64,
    first_leaf: u64,
    leaf_splits: AtomicU64,
    alloc: Arc<Allocator>,
    logger: Arc<Logger>,
    agent: RwLock<Option<Arc<RemoteMemoryAgent>>>,
}

impl Index {
    /// Create the initial root leaf with one logged allocation.
    pub fn bootstrap(alloc: Arc<Allocator>, logger: Arc<Logger>) -> Result<Self, StoreError> {
        let a = alloc.register_worker()?;
        let l = logger.register_worker()?;
        if a != l {
            alloc.unregister_worker(a);
            logger.unregister_worker(l);
            return Err(StoreError::NoSlot);
        }

        let slot = logger.make_log(a, LogOp::NodeSplit);
        let res = alloc.allocate(a, LeafNode::PM_SIZE, &slot);
        if let Err(e) = res {
            alloc.unregister_worker(a);
            logger.unregister_worker(l);
            return Err(e);
        }
        let leaf = unsafe { LeafNode::format(slot.get().raw()) };
        // the root leaf must survive any crash from here on
        logger.checkpoint(a);

        alloc.unregister_worker(a);
        logger.unregister_worker(l);
        info!("index bootstrapped, degree {}", DEGREE);

        Ok(Self {
            root: AtomicU64::new(NodeRef::Leaf(leaf.addr()).pack()),
            first_leaf: leaf.addr(),
            leaf_splits: AtomicU64::new(0),
            alloc,
            logger,
            agent: RwLock::new(None),
        })
    }

    /// Rebuild the tree over an existing leaf chain.
    ///
    /// Leaves are sanitized first: slots whose chunks were retracted by
    /// log replay, half-published slots, and split residue that already
    /// migrated to a successor all get dropped. The DRAM inner layer is
    /// then reconstructed by pushing each leaf up in chain order.
    ///
    /// # Safety
    ///
    /// `first_leaf` must be the bootstrap leaf of a chain built by this
    /// engine over the currently mapped PM region.
    pub unsafe fn recover(
        alloc: Arc<Allocator>,
        logger: Arc<Logger>,
        first_leaf: u64,
    ) -> Result<Self, StoreError> {
        let index = Self {
            root: AtomicU64::new(NodeRef::Leaf(first_leaf).pack()),
            first_leaf,
            leaf_splits: AtomicU64::new(0),
            alloc,
            logger,
            agent: RwLock::new(None),
        };

        let mut leaves = Vec::new();
        let mut cursor = first_leaf;
        while cursor != 0 {
            leaves.push(cursor);
            cursor = LeafNode::from_addr(cursor).next_leaf();
            if leaves.len() > (1 << 32) {
                return Err(StoreError::Corrupted("leaf chain does not terminate"));
            }
        }

        for (i, &addr) in leaves.iter().enumerate() {
            let leaf = LeafNode::from_addr(addr);
            let successor = match leaves.get(i + 1) {
                Some(&next) => Some(LeafNode::from_addr(next)),
                None => None,
            };
            Self::sanitize_leaf(leaf, successor);
            leaf.set_parent(std::ptr::null_mut());
        }

        let mut prev = LeafNode::from_addr(first_leaf);
        for &addr in &leaves[1..] {
            let leaf = LeafNode::from_addr(addr);
            if leaf.key_count() == 0 {
                continue;
            }
            leaf.set_parent(prev.parent_node());
            if prev.parent_node().is_null() {
                let root = InnerNode::make();
                (*root).set_key(0, leaf.key_addr(0));
                (*root).set_child(0, NodeRef::Leaf(prev.addr()));
                (*root).set_child(1, NodeRef::Leaf(leaf.addr()));
                prev.set_parent(root);
                leaf.set_parent(root);
                index.root.store(NodeRef::Inner(root).pack(), Ordering::Release);
            } else {
                index.push_up(leaf);
            }
            prev = leaf;
        }

        info!("index rebuilt from {} leaves", leaves.len());
        Ok(index)
    }

    unsafe fn sanitize_leaf(leaf: &LeafNode, successor: Option<&LeafNode>) {
        let mut bound = None;
        if let Some(next) = successor {
            if next.key_addr(0) != 0 {
                bound = Some(next.key_str(0).as_bytes().to_vec());
            }
        }

        let mut kept: Vec<(u64, u64, PolymorphicPointer, u64)> = Vec::new();
        for i in 0..NUM_KEYS {
            let key_addr = leaf.key_addr(i);
            if key_addr == 0 {
                continue;
            }
            if !crate::page::PageRef::of_chunk(key_addr).is_chunk_live(key_addr) {
                continue;
            }
            let key = CompactString::from_addr(key_addr);
            if !key.is_valid() {
                continue;
            }
            let value = leaf.value(i);
            if value.is_null() {
                continue;
            }
            if value.is_local()
                && !crate::page::PageRef::of_chunk(value.raw()).is_chunk_live(value.raw())
            {
                continue;
            }
            if let Some(b) = &bound {
                if key.compare(b) != CmpOrdering::Less {
                    // already migrated to the successor by a split
                    continue;
                }
            }
            if let Some(last) = kept.last() {
                if CompactString::from_addr(last.1).compare(key.as_bytes()) == CmpOrdering::Equal {
                    continue;
                }
            }
            kept.push((leaf.fingerprint(i), key_addr, value, leaf.value_size(i)));
        }

        for (i, &(fp, key, value, size)) in kept.iter().enumerate() {
            leaf.set_entry(i, fp, key, value, size);
        }
        for i in kept.len()..NUM_KEYS {
            leaf.clear_entry(i);
        }
    }

    /// Route value placement through the agent once the local region is
    /// exhausted.
    pub fn enable_agent(&self, agent: Arc<RemoteMemoryAgent>) {
        *self.agent.write() = Some(agent);
    }

    pub fn root(&self) -> NodeRef {
        NodeRef::unpack(self.root.load(Ordering::Acquire))
    }

    pub fn first_leaf(&self) -> u64 {
        self.first_leaf
    }

    /// Leaf splits performed since this index was opened.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(Ordering::Relaxed)
    }

    fn traverse(&self, key: &[u8]) -> &LeafNode {
        'restart: loop {
            let mut current = self.root();
            loop {
                match current {
                    NodeRef::Leaf(addr) => return unsafe { LeafNode::from_addr(addr) },
                    NodeRef::Inner(ptr) => {
                        let next = Self::find_next(unsafe { &*ptr }, key);
                        if next.is_none() {
                            // torn descent during a concurrent split
                            continue 'restart;
                        }
                        current = next;
                    }
                    NodeRef::None => continue 'restart,
                }
            }
        }
    }

    /// Descend on the first strictly-greater key, else the last child.
    fn find_next(inner: &InnerNode, key: &[u8]) -> NodeRef {
        for i in 0..NUM_KEYS {
            let k = inner.key_addr(i);
            if k == 0 {
                return inner.child(i);
            }
            let ks = unsafe { CompactString::from_addr(k) };
            if ks.compare(key) == CmpOrdering::Greater {
                return inner.child(i);
            }
        }
        inner.child(NUM_KEYS)
    }

    fn position_of(&self, key: &[u8]) -> (&LeafNode, Option<usize>) {
        let leaf = self.traverse(key);
        let fp = xxh3_64(key);
        for i in 0..NUM_KEYS {
            if leaf.key_addr(i) == 0 {
                return (leaf, None);
            }
            if leaf.fingerprint(i) != fp {
                continue;
            }
            if unsafe { leaf.key_str(i) }.compare(key) == CmpOrdering::Equal {
                return (leaf, Some(i));
            }
        }
        (leaf, None)
    }

    pub fn insert(
        &self,
        worker: WorkerId,
        key: &[u8],
        value: &[u8],
    ) -> (OpStatus, PolymorphicPointer) {
        if key.is_empty() || key.len() > MAX_STRING || value.len() > MAX_STRING {
            return (OpStatus::Failed, PolymorphicPointer::NULL);
        }

        let leaf = self.traverse(key);
        if !leaf.is_full() {
            return self.leaf_insert(worker, leaf, key, value);
        }

        // a full leaf may still hold the key
        let fp = xxh3_64(key);
        for i in 0..NUM_KEYS {
            if leaf.fingerprint(i) == fp
                && unsafe { leaf.key_str(i) }.compare(key) == CmpOrdering::Equal
            {
                return (OpStatus::RepeatInsert, PolymorphicPointer::NULL);
            }
        }

        let (status, new_leaf, value_ptr) = self.split_leaf(worker, leaf, key, value);
        let Some(new_leaf) = new_leaf else {
            return (status, value_ptr);
        };

        if leaf.parent_node().is_null() {
            // root was a leaf: publish a fresh inner root
            let root = InnerNode::make();
            unsafe {
                (*root).set_key(0, new_leaf.key_addr(0));
                (*root).set_child(0, NodeRef::Leaf(leaf.addr()));
                (*root).set_child(1, NodeRef::Leaf(new_leaf.addr()));
            }
            leaf.set_parent(root);
            new_leaf.set_parent(root);
            self.root.store(NodeRef::Inner(root).pack(), Ordering::Release);
        } else {
            self.push_up(new_leaf);
        }
        (status, value_ptr)
    }

    pub fn search(&self, key: &[u8]) -> (PolymorphicPointer, u64) {
        let (leaf, pos) = self.position_of(key);
        match pos {
            Some(i) => (leaf.value(i), leaf.value_size(i)),
            None => (PolymorphicPointer::NULL, 0),
        }
    }

    pub fn update(
        &self,
        worker: WorkerId,
        key: &[u8],
        value: &[u8],
    ) -> (OpStatus, PolymorphicPointer) {
        if value.len() > MAX_STRING {
            return (OpStatus::Failed, PolymorphicPointer::NULL);
        }
        let (leaf, pos) = self.position_of(key);
        let Some(i) = pos else {
            return (OpStatus::Failed, PolymorphicPointer::NULL);
        };

        let old = leaf.value(i);
        if old.is_local() {
            let current = unsafe { CompactString::from_addr(old.raw()) };
            if value.len() <= current.len() {
                let _slot = self.logger.make_log(worker, LogOp::Update);
                current.inplace_update(value);
                leaf.set_value(i, old, CompactString::chunk_size(value.len()) as u64);
                self.logger.commit(worker);
                return (OpStatus::Ok, old);
            }
        }

        let slot = self.logger.make_log(worker, LogOp::Update);
        match self.place_value(worker, value, &slot) {
            Ok((ptr, total)) => {
                leaf.set_value(i, ptr, total);
                self.logger.commit(worker);
                if old.is_local() {
                    self.alloc.free(worker, old.raw());
                } else if let Some(agent) = self.agent.read().as_ref() {
                    agent.free(worker, old.remote());
                }
                (OpStatus::Ok, ptr)
            }
            Err(status) => {
                self.logger.commit(worker);
                (status, PolymorphicPointer::NULL)
            }
        }
    }

    pub fn remove(&self, worker: WorkerId, key: &[u8]) -> OpStatus {
        let (leaf, pos) = self.position_of(key);
        let Some(i) = pos else {
            return OpStatus::Failed;
        };

        let _slot = self.logger.make_log(worker, LogOp::Delete);
        let value = leaf.value(i);
        leaf.shift_left(i, leaf.key_count());

        // the key chunk stays: inner nodes may still route through it
        if value.is_local() {
            self.alloc.free(worker, value.raw());
        } else if let Some(agent) = self.agent.read().as_ref() {
            agent.free(worker, value.remote());
        }
        self.logger.commit(worker);
        OpStatus::Ok
    }

    /// Up to `n` value handles for keys `>= start`, in key order.
    pub fn scan(&self, start: &[u8], n: usize) -> Vec<PolymorphicPointer> {
        self.scan_range_inner(start, None, n)
            .into_iter()
            .map(|(ptr, _)| ptr)
            .collect()
    }

    /// Handles and sizes for keys in `[start, end)`.
    pub fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(PolymorphicPointer, u64)> {
        self.scan_range_inner(start, Some(end), usize::MAX)
    }

    fn scan_range_inner(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        n: usize,
    ) -> Vec<(PolymorphicPointer, u64)> {
        let mut out = Vec::new();
        if n == 0 {
            return out;
        }
        let mut leaf = self.traverse(start);
        loop {
            for i in 0..NUM_KEYS {
                if leaf.key_addr(i) == 0 {
                    break;
                }
                let key = unsafe { leaf.key_str(i) };
                if key.compare(start) == CmpOrdering::Less {
                    continue;
                }
                if let Some(end) = end {
                    if key.compare(end) != CmpOrdering::Less {
                        return out;
                    }
                }
                out.push((leaf.value(i), leaf.value_size(i)));
                if out.len() == n {
                    return out;
                }
            }
            let next = leaf.next_leaf();
            if next == 0 {
                return out;
            }
            leaf = unsafe { LeafNode::from_addr(next) };
        }
    }

    fn leaf_insert(
        &self,
        worker: WorkerId,
        leaf: &LeafNode,
        key: &[u8],
        value: &[u8],
    ) -> (OpStatus, PolymorphicPointer) {
        if leaf.is_full() {
            return (OpStatus::NeedSplit, PolymorphicPointer::NULL);
        }
        let count = leaf.key_count();
        let mut i = count;
        for j in 0..count {
            match unsafe { leaf.key_str(j) }.compare(key) {
                CmpOrdering::Greater => {
                    i = j;
                    break;
                }
                CmpOrdering::Equal => return (OpStatus::RepeatInsert, PolymorphicPointer::NULL),
                CmpOrdering::Less => {}
            }
        }

        leaf.shift_right(i, count);

        let slot = self.logger.make_log(worker, LogOp::Insert);
        let key_size = CompactString::chunk_size(key.len());
        if let Err(e) = self.alloc.allocate(worker, key_size, &slot) {
            leaf.shift_left(i, count + 1);
            self.logger.commit(worker);
            let status = match e {
                StoreError::NoMemory => OpStatus::NoMemory,
                _ => OpStatus::Failed,
            };
            return (status, PolymorphicPointer::NULL);
        }
        let key_ptr = slot.get();
        unsafe { CompactString::make(key_ptr.raw_local(), key) };
        leaf.set_entry(i, xxh3_64(key), key_ptr.raw(), PolymorphicPointer::NULL, 0);
        self.logger.commit(worker);

        let slot = self.logger.make_log(worker, LogOp::Insert);
        match self.place_value(worker, value, &slot) {
            Ok((value_ptr, total)) => {
                leaf.set_value(i, value_ptr, total);
                self.logger.commit(worker);
                (OpStatus::Ok, value_ptr)
            }
            Err(status) => {
                // retract the key so the leaf stays coherent
                leaf.shift_left(i, count + 1);
                self.alloc.free(worker, key_ptr.raw());
                self.logger.commit(worker);
                (status, PolymorphicPointer::NULL)
            }
        }
    }

    /// Place a value chunk locally, falling back to peer PM through the
    /// agent. Remote placement writes the bytes into the peer region
    /// before the handle is returned.
    fn place_value(
        &self,
        worker: WorkerId,
        value: &[u8],
        slot: &AddressSlot,
    ) -> Result<(PolymorphicPointer, u64), OpStatus> {
        let total = CompactString::chunk_size(value.len());
        match self.alloc.allocate(worker, total, slot) {
            Ok(()) => {
                let ptr = slot.get();
                unsafe { CompactString::make(ptr.raw_local(), value) };
                Ok((ptr, total as u64))
            }
            Err(_) => {
                let guard = self.agent.read();
                let Some(agent) = guard.as_ref() else {
                    return Err(OpStatus::NoMemory);
                };
                agent.allocate(worker, total, slot);
                let ptr = slot.get();
                if ptr.is_null() {
                    return Err(OpStatus::NoMemory);
                }
                let mut wire = Vec::with_capacity(total);
                CompactString::encode_into(&mut wire, value);
                if agent.write_remote(worker, ptr.remote(), &wire).is_err() {
                    agent.free(worker, ptr.remote());
                    slot.set(PolymorphicPointer::NULL);
                    return Err(OpStatus::Failed);
                }
                Ok((ptr, total as u64))
            }
        }
    }

    /// Split a full leaf around the incoming key, keeping the lower half
    /// in place. The new leaf becomes durable (checkpoint) before it is
    /// linked behind the old one; a crash in between only leaks it.
    fn split_leaf(
        &self,
        worker: WorkerId,
        leaf: &LeafNode,
        key: &[u8],
        value: &[u8],
    ) -> (OpStatus, Option<&LeafNode>, PolymorphicPointer) {
        let slot = self.logger.make_log(worker, LogOp::NodeSplit);
        if self.alloc.allocate(worker, LeafNode::PM_SIZE, &slot).is_err() {
            self.logger.commit(worker);
            return (OpStatus::NoMemory, None, PolymorphicPointer::NULL);
        }
        let new_leaf = unsafe { LeafNode::format(slot.get().raw()) };
        new_leaf.set_parent(leaf.parent_node());

        let mut i = NUM_KEYS;
        for j in 0..NUM_KEYS {
            if unsafe { leaf.key_str(j) }.compare(key) == CmpOrdering::Greater {
                i = j;
                break;
            }
        }
        let mut split = NUM_KEYS / 2;
        if i < split {
            split -= 1;
        }

        for j in split..NUM_KEYS {
            new_leaf.copy_entry(j - split, leaf, j);
        }
        new_leaf.persist_all();
        new_leaf.set_next(leaf.next_leaf());
        // make the new leaf durable before it becomes reachable
        self.logger.checkpoint(worker);

        leaf.set_next(new_leaf.addr());
        for j in split..NUM_KEYS {
            leaf.clear_entry(j);
        }

        let target = if i < NUM_KEYS / 2 { leaf } else { new_leaf };
        let (status, value_ptr) = self.leaf_insert(worker, target, key, value);
        self.leaf_splits.fetch_add(1, Ordering::Relaxed);
        debug!("leaf split at {:#x}", leaf.addr());
        (status, Some(new_leaf), value_ptr)
    }

    /// Walk the split key upward, splitting full ancestors, until an
    /// inner node has room or a new root is published.
    fn push_up(&self, new_leaf: &LeafNode) -> OpStatus {
        let mut new_node = NodeRef::Leaf(new_leaf.addr());
        let mut split_key = new_leaf.key_addr(0);
        let mut inner_ptr = new_leaf.parent_node();

        while !inner_ptr.is_null() {
            let inner = unsafe { &*inner_ptr };
            if !inner.is_full() {
                Self::inner_insert(inner_ptr, split_key, new_node);
                return OpStatus::Ok;
            }

            let (right, pushed_key) = self.split_inner(inner_ptr, split_key, new_node);
            new_node = NodeRef::Inner(right);
            split_key = pushed_key;

            if inner.parent_node().is_null() {
                let root = InnerNode::make();
                unsafe {
                    (*root).set_key(0, split_key);
                    (*root).set_child(0, NodeRef::Inner(inner_ptr));
                    (*root).set_child(1, new_node);
                }
                inner.set_parent(root);
                set_node_parent(new_node, root);
                self.root.store(NodeRef::Inner(root).pack(), Ordering::Release);
                return OpStatus::Ok;
            }
            inner_ptr = inner.parent_node();
        }
        OpStatus::Ok
    }

    /// Insert `(split_key, child)` into a non-full inner node; the child
    /// goes to the right of the key.
    fn inner_insert(inner_ptr: *mut InnerNode, split_key: u64, child: NodeRef) {
        let inner = unsafe { &*inner_ptr };
        let count = inner.key_count();
        let key = unsafe { CompactString::from_addr(split_key) };

        let mut i = count;
        for j in 0..count {
            if unsafe { inner.key_str(j) }.compare(key.as_bytes()) == CmpOrdering::Greater {
                i = j;
                break;
            }
        }
        for j in (i..count).rev() {
            inner.set_key(j + 1, inner.key_addr(j));
            inner.set_child(j + 2, inner.child(j + 1));
        }
        inner.set_key(i, split_key);
        inner.set_child(i + 1, child);
        set_node_parent(child, inner_ptr);
    }

    /// Split a full inner node around an incoming `(split_key, child)`.
    /// Returns the new right sibling and the key pushed to the parent.
    fn split_inner(
        &self,
        left_ptr: *mut InnerNode,
        split_key: u64,
        child: NodeRef,
    ) -> (*mut InnerNode, u64) {
        let left = unsafe { &*left_ptr };
        let right_ptr = InnerNode::make();
        let right = unsafe { &*right_ptr };
        right.set_parent(left.parent_node());

        let split_pos = DEGREE / 2;
        let incoming = unsafe { CompactString::from_addr(split_key) };
        let mut i = NUM_KEYS;
        for j in 0..NUM_KEYS {
            if unsafe { left.key_str(j) }.compare(incoming.as_bytes()) == CmpOrdering::Greater {
                i = j;
                break;
            }
        }

        if i == split_pos {
            // the incoming key itself is pushed up
            right.set_child(0, child);
            set_node_parent(child, right_ptr);
            for k in i..NUM_KEYS {
                right.set_key(k - i, left.key_addr(k));
                let moved = left.child(k + 1);
                right.set_child(k - i + 1, moved);
                set_node_parent(moved, right_ptr);
            }
            for k in i..NUM_KEYS {
                left.set_key(k, 0);
                left.set_child(k + 1, NodeRef::None);
            }
            return (right_ptr, split_key);
        }

        if i < split_pos {
            let pushed = left.key_addr(split_pos - 1);
            for k in split_pos..NUM_KEYS {
                right.set_key(k - split_pos, left.key_addr(k));
            }
            for k in split_pos..DEGREE {
                let moved = left.child(k);
                right.set_child(k - split_pos, moved);
                set_node_parent(moved, right_ptr);
            }
            for k in (split_pos - 1)..NUM_KEYS {
                left.set_key(k, 0);
            }
            for k in split_pos..DEGREE {
                left.set_child(k, NodeRef::None);
            }
            Self::inner_insert(left_ptr, split_key, child);
            (right_ptr, pushed)
        } else {
            let pushed = left.key_addr(split_pos);
            for k in (split_pos + 1)..NUM_KEYS {
                right.set_key(k - split_pos - 1, left.key_addr(k));
            }
            for k in (split_pos + 1)..DEGREE {
                let moved = left.child(k);
                right.set_child(k - split_pos - 1, moved);
                set_node_parent(moved, right_ptr);
            }
            for k in split_pos..NUM_KEYS {
                left.set_key(k, 0);
            }
            for k in (split_pos + 1)..DEGREE {
                left.set_child(k, NodeRef::None);
            }
            Self::inner_insert(right_ptr, split_key, child);
            (right_ptr, pushed)
        }
    }
}
