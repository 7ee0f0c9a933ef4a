use bytemuck::{Pod, Zeroable};

/*
 * A value handle is one 64-bit word, persisted inside index leaves, so
 * the encoding must be stable across processes.
 *
 * 63 62 61      56 55      48 47                               0
 * ----------------------------------------------------------------
 * |  A  |    B    |          |                C                 |
 * ----------------------------------------------------------------
 * A: remote bits, 0b10 marks a remote handle
 * B: node id (63 peers at most)
 * C: 48-bit address payload
 *
 * A local pointer is a canonical 48-bit virtual address stored verbatim:
 * its top bits are all-zero or all-one, never 0b10.
 */

const REMOTE_BITS: u64 = 0b10;
const REMOTE_BITS_SHIFT: u32 = 62;
const REMOTE_BITS_MASK: u64 = 0b11 << REMOTE_BITS_SHIFT;
const NODE_SHIFT: u32 = 56;
const NODE_MASK: u64 = 0x3f;
const ADDR_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A handle on memory inside a peer's PM region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(transparent)]
pub struct RemotePointer(u64);

impl RemotePointer {
    pub fn make(node: u8, addr: u64) -> Self {
        let meta = (REMOTE_BITS << 6) | (u64::from(node) & NODE_MASK);
        Self((meta << NODE_SHIFT) | (addr & ADDR_MASK))
    }

    pub fn node_id(&self) -> u8 {
        ((self.0 >> NODE_SHIFT) & NODE_MASK) as u8
    }

    /// Offset within the owning node's PM region.
    pub fn offset(&self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Tagged 64-bit handle addressing either local PM or a peer's PM.
///
/// Never dereference a remote handle: route it through the agent. The
/// split happens at the call site by testing `is_remote` first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(transparent)]
pub struct PolymorphicPointer(u64);

impl PolymorphicPointer {
    pub const NULL: Self = Self(0);

    pub fn make_local(addr: u64) -> Self {
        Self(addr)
    }

    pub fn make_local_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    pub fn make_remote(node: u8, offset: u64) -> Self {
        Self(RemotePointer::make(node, offset).0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn is_remote(&self) -> bool {
        (self.0 & REMOTE_BITS_MASK) >> REMOTE_BITS_SHIFT == REMOTE_BITS
    }

    pub fn is_local(&self) -> bool {
        !self.is_remote()
    }

    pub fn node_id(&self) -> u8 {
        ((self.0 >> NODE_SHIFT) & NODE_MASK) as u8
    }

    pub fn remote(&self) -> RemotePointer {
        RemotePointer(self.0)
    }

    /// Sign-extend the 48-bit payload back into a canonical address. On a
    /// local handle this is the pointer that was stored; on a remote one
    /// it is the offset within the peer's region.
    pub fn get_as_address(&self) -> u64 {
        (((self.0 << 16) as i64) >> 16) as u64
    }

    /// The stored local address, dereferenceable in this process.
    pub fn raw_local(&self) -> *mut u8 {
        self.0 as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_round_trip() {
        let addr = 0x7fff_dead_beef_u64;
        let p = PolymorphicPointer::make_local(addr);
        assert!(p.is_local());
        assert!(!p.is_remote());
        assert_eq!(p.raw_local() as u64, addr);
        assert_eq!(p.get_as_address(), addr);
    }

    #[test]
    fn remote_round_trip() {
        for node in 1..=63u8 {
            let p = PolymorphicPointer::make_remote(node, 0x1234_5678);
            assert!(p.is_remote());
            assert!(!p.is_local());
            assert_eq!(p.node_id(), node);
            assert_eq!(p.remote().offset(), 0x1234_5678);
        }
    }

    #[test]
    fn remote_bit_layout() {
        let p = PolymorphicPointer::make_remote(7, 0x1000);
        assert_eq!(p.raw() >> 62, 0b10);
        assert_eq!((p.raw() >> 56) & 0x3f, 0b000111);
        assert_eq!(p.get_as_address(), 0x1000);
    }

    #[test]
    fn null_is_local_and_null() {
        let p = PolymorphicPointer::NULL;
        assert!(p.is_null());
        assert!(p.is_local());
        assert_eq!(p, PolymorphicPointer::from_raw(0));
    }
}
