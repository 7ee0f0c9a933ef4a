use std::sync::atomic::{AtomicU64, Ordering};

use crate::kv::CompactString;
use crate::pmem::persist;
use crate::pointer::PolymorphicPointer;

/// Tree order. Debug builds shrink it so splits happen within a handful
/// of inserts.
#[cfg(debug_assertions)]
pub const DEGREE: usize = 3;
#[cfg(not(debug_assertions))]
pub const DEGREE: usize = 16;

pub const NUM_KEYS: usize = DEGREE - 1;

const TAG_MASK: u64 = 0b11;
const TAG_LEAF: u64 = 0b01;
const TAG_INNER: u64 = 0b10;

/// Tagged node pointer: leaves live in PM, inner nodes in DRAM, and a
/// single packed word distinguishes them so the root and child slots can
/// be published with one atomic store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRef {
    None,
    Leaf(u64),
    Inner(*mut InnerNode),
}

impl NodeRef {
    pub fn pack(self) -> u64 {
        match self {
            NodeRef::None => 0,
            NodeRef::Leaf(addr) => {
                debug_assert_eq!(addr & TAG_MASK, 0);
                addr | TAG_LEAF
            }
            NodeRef::Inner(ptr) => {
                debug_assert_eq!(ptr as u64 & TAG_MASK, 0);
                ptr as u64 | TAG_INNER
            }
        }
    }

    pub fn unpack(raw: u64) -> Self {
        match raw & TAG_MASK {
            TAG_LEAF => NodeRef::Leaf(raw & !TAG_MASK),
            TAG_INNER => NodeRef::Inner((raw & !TAG_MASK) as *mut InnerNode),
            _ => NodeRef::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, NodeRef::None)
    }
}

/*
 * Leaf layout is a fixed-fanout struct directly on PM. Slots are
 * left-packed and key-sorted; the key word is published last so a slot
 * is visible only once fingerprint, value and size are in place. The
 * sibling link orders leaves by key and is what makes the DRAM-only
 * inner layer reconstructible after restart.
 */
#[repr(C)]
pub struct LeafNode {
    /// DRAM parent; meaningless across restarts
    pub parent: AtomicU64,
    /// next leaf in key order, 0 at the tail
    pub next: AtomicU64,
    fingerprints: [AtomicU64; NUM_KEYS],
    keys: [AtomicU64; NUM_KEYS],
    values: [AtomicU64; NUM_KEYS],
    value_sizes: [AtomicU64; NUM_KEYS],
}

impl LeafNode {
    pub const PM_SIZE: usize = std::mem::size_of::<LeafNode>();

    /// Format the chunk at `addr` as an empty leaf.
    ///
    /// # Safety
    ///
    /// `addr` must point at `PM_SIZE` bytes of allocated PM.
    pub unsafe fn format<'a>(addr: u64) -> &'a LeafNode {
        std::ptr::write_bytes(addr as *mut u8, 0, Self::PM_SIZE);
        persist(addr as *const u8, Self::PM_SIZE);
        Self::from_addr(addr)
    }

    /// # Safety
    ///
    /// `addr` must point at a previously formatted leaf.
    pub unsafe fn from_addr<'a>(addr: u64) -> &'a LeafNode {
        &*(addr as *const LeafNode)
    }

    pub fn addr(&self) -> u64 {
        self as *const LeafNode as u64
    }

    pub fn is_full(&self) -> bool {
        self.keys[NUM_KEYS - 1].load(Ordering::Acquire) != 0
    }

    pub fn key_count(&self) -> usize {
        (0..NUM_KEYS)
            .take_while(|&i| self.keys[i].load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn key_addr(&self, i: usize) -> u64 {
        self.keys[i].load(Ordering::Acquire)
    }

    pub fn fingerprint(&self, i: usize) -> u64 {
        self.fingerprints[i].load(Ordering::Relaxed)
    }

    pub fn value(&self, i: usize) -> PolymorphicPointer {
        PolymorphicPointer::from_raw(self.values[i].load(Ordering::Acquire))
    }

    pub fn value_size(&self, i: usize) -> u64 {
        self.value_sizes[i].load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// Slot `i` must hold a key (`key_addr(i) != 0`).
    pub unsafe fn key_str(&self, i: usize) -> &CompactString {
        CompactString::from_addr(self.key_addr(i))
    }

    /// Publish a complete slot; the key word lands last.
    pub fn set_entry(&self, i: usize, fp: u64, key: u64, value: PolymorphicPointer, size: u64) {
        self.fingerprints[i].store(fp, Ordering::Relaxed);
        self.values[i].store(value.raw(), Ordering::Relaxed);
        self.value_sizes[i].store(size, Ordering::Relaxed);
        self.keys[i].store(key, Ordering::Release);
        self.persist_all();
    }

    pub fn set_value(&self, i: usize, value: PolymorphicPointer, size: u64) {
        self.value_sizes[i].store(size, Ordering::Relaxed);
        self.values[i].store(value.raw(), Ordering::Release);
        self.persist_all();
    }

    pub fn clear_entry(&self, i: usize) {
        self.keys[i].store(0, Ordering::Release);
        self.fingerprints[i].store(0, Ordering::Relaxed);
        self.values[i].store(0, Ordering::Relaxed);
        self.value_sizes[i].store(0, Ordering::Relaxed);
        self.persist_all();
    }

    /// Copy slot `from` of `src` into slot `to` of `self`.
    pub fn copy_entry(&self, to: usize, src: &LeafNode, from: usize) {
        self.fingerprints[to].store(src.fingerprint(from), Ordering::Relaxed);
        self.values[to].store(src.value(from).raw(), Ordering::Relaxed);
        self.value_sizes[to].store(src.value_size(from), Ordering::Relaxed);
        self.keys[to].store(src.key_addr(from), Ordering::Release);
    }

    /// Open slot `i` by shifting `[i, count)` one to the right.
    pub fn shift_right(&self, i: usize, count: usize) {
        for j in (i..count).rev() {
            self.copy_entry(j + 1, self, j);
        }
        self.persist_all();
    }

    /// Close slot `i` by shifting `(i, count)` one to the left.
    pub fn shift_left(&self, i: usize, count: usize) {
        for j in i..count - 1 {
            self.copy_entry(j, self, j + 1);
        }
        self.clear_entry(count - 1);
    }

    pub fn persist_all(&self) {
        persist(self as *const LeafNode as *const u8, Self::PM_SIZE);
    }

    pub fn parent_node(&self) -> *mut InnerNode {
        self.parent.load(Ordering::Acquire) as *mut InnerNode
    }

    pub fn set_parent(&self, parent: *mut InnerNode) {
        self.parent.store(parent as u64, Ordering::Release);
    }

    pub fn next_leaf(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: u64) {
        self.next.store(next, Ordering::Release);
        persist(
            &self.next as *const AtomicU64 as *const u8,
            std::mem::size_of::<u64>(),
        );
    }
}

/// Inner nodes route only; they live in DRAM, are owned by the tree and
/// are rebuilt from the leaf chain on restart. Key and child slots are
/// single words so concurrent readers never see a torn value.
#[repr(C)]
pub struct InnerNode {
    pub parent: AtomicU64,
    keys: [AtomicU64; NUM_KEYS],
    children: [AtomicU64; DEGREE],
}

impl InnerNode {
    /// Allocate an empty inner node. The tree leaks these at process
    /// exit; PM persists, DRAM does not.
    pub fn make() -> *mut InnerNode {
        Box::into_raw(Box::new(InnerNode {
            parent: AtomicU64::new(0),
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            children: std::array::from_fn(|_| AtomicU64::new(0)),
        }))
    }

    pub fn is_full(&self) -> bool {
        self.keys[NUM_KEYS - 1].load(Ordering::Acquire) != 0
    }

    pub fn key_count(&self) -> usize {
        (0..NUM_KEYS)
            .take_while(|&i| self.keys[i].load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn key_addr(&self, i: usize) -> u64 {
        self.keys[i].load(Ordering::Acquire)
    }

    pub fn set_key(&self, i: usize, key: u64) {
        self.keys[i].store(key, Ordering::Release);
    }

    /// # Safety
    ///
    /// Slot `i` must hold a key.
    pub unsafe fn key_str(&self, i: usize) -> &CompactString {
        CompactString::from_addr(self.key_addr(i))
    }

    pub fn child(&self, i: usize) -> NodeRef {
        NodeRef::unpack(self.children[i].load(Ordering::Acquire))
    }

    pub fn set_child(&self, i: usize, child: NodeRef) {
        self.children[i].store(child.pack(), Ordering::Release);
    }

    pub fn parent_node(&self) -> *mut InnerNode {
        self.parent.load(Ordering::Acquire) as *mut InnerNode
    }

    pub fn set_parent(&self, parent: *mut InnerNode) {
        self.parent.store(parent as u64, Ordering::Release);
    }
}

/// Point a child's parent link at `parent`, whichever kind it is.
pub fn set_node_parent(node: NodeRef, parent: *mut InnerNode) {
    match node {
        NodeRef::Leaf(addr) => unsafe { LeafNode::from_addr(addr).set_parent(parent) },
        NodeRef::Inner(ptr) => unsafe { (*ptr).set_parent(parent) },
        NodeRef::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ref_packing() {
        assert!(NodeRef::unpack(0).is_none());
        let leaf = NodeRef::Leaf(0x1000);
        assert_eq!(NodeRef::unpack(leaf.pack()), leaf);
        let inner = InnerNode::make();
        let r = NodeRef::Inner(inner);
        assert_eq!(NodeRef::unpack(r.pack()), r);
        unsafe { drop(Box::from_raw(inner)) };
    }

    #[test]
    fn leaf_slots_publish_key_last() {
        let mut backing = vec![0u8; LeafNode::PM_SIZE + 8];
        let addr = (backing.as_mut_ptr() as u64 + 7) & !7;
        let leaf = unsafe { LeafNode::format(addr) };
        assert_eq!(leaf.key_count(), 0);
        assert!(!leaf.is_full());

        leaf.set_entry(0, 7, 0x100, PolymorphicPointer::make_local(0x200), 10);
        assert_eq!(leaf.key_count(), 1);
        assert_eq!(leaf.fingerprint(0), 7);
        assert_eq!(leaf.value(0).raw(), 0x200);

        leaf.shift_right(0, 1);
        assert_eq!(leaf.key_addr(1), 0x100);
        leaf.set_entry(0, 3, 0x80, PolymorphicPointer::make_local(0x300), 4);
        assert_eq!(leaf.key_count(), 2);
        assert!(leaf.is_full());

        leaf.shift_left(0, 2);
        assert_eq!(leaf.key_count(), 1);
        assert_eq!(leaf.key_addr(0), 0x100);
    }
}
