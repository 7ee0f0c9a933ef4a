use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::pmem::{persist, sfence};
use crate::StoreError;

const VALID_BIT: u16 = 1 << 15;
const LEN_MASK: u16 = VALID_BIT - 1;

/// Longest representable payload, just under 32 KiB.
pub const MAX_STRING: usize = LEN_MASK as usize;

const HEADER_SIZE: usize = 2;

/// Self-describing length-prefixed byte blob living inside an allocated
/// PM chunk. The same layout doubles as the wire framing of keys and
/// values in RPC messages.
///
/// Header is `{ valid: 1, length: 15 }`; the valid bit is set last, with
/// the payload already persisted, so a reader never observes a
/// half-written blob with the valid bit on.
#[repr(C)]
pub struct CompactString {
    header: u16,
}

impl CompactString {
    /// Chunk bytes needed to hold a payload of `len` bytes.
    pub const fn chunk_size(len: usize) -> usize {
        HEADER_SIZE + len
    }

    /// Build a blob inside `chunk`.
    ///
    /// # Safety
    ///
    /// `chunk` must point at least `chunk_size(bytes.len())` writable
    /// bytes of PM, and `bytes.len() <= MAX_STRING`.
    pub unsafe fn make<'a>(chunk: *mut u8, bytes: &[u8]) -> &'a CompactString {
        debug_assert!(bytes.len() <= MAX_STRING);
        let header = chunk as *mut u16;
        header.write_volatile(bytes.len() as u16);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), chunk.add(HEADER_SIZE), bytes.len());
        persist(chunk, HEADER_SIZE + bytes.len());
        sfence();
        header.write_volatile(bytes.len() as u16 | VALID_BIT);
        persist(chunk, HEADER_SIZE);
        &*(chunk as *const CompactString)
    }

    /// Reinterpret a PM address as a blob.
    ///
    /// # Safety
    ///
    /// `addr` must point at a blob previously built with `make`.
    pub unsafe fn from_addr<'a>(addr: u64) -> &'a CompactString {
        &*(addr as *const CompactString)
    }

    pub fn addr(&self) -> u64 {
        self as *const CompactString as u64
    }

    fn raw_header(&self) -> u16 {
        unsafe { (self as *const CompactString as *const u16).read_volatile() }
    }

    pub fn len(&self) -> usize {
        (self.raw_header() & LEN_MASK) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        self.raw_header() & VALID_BIT != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let base = (self as *const CompactString as *const u8).add(HEADER_SIZE);
            std::slice::from_raw_parts(base, self.len())
        }
    }

    /// Byte-wise prefix comparison; equal prefixes order by length.
    pub fn compare(&self, rhs: &[u8]) -> Ordering {
        self.as_bytes().cmp(rhs)
    }

    /// Overwrite the payload without reallocating. Only shrinking (or
    /// equal-length) updates fit; anything larger needs a fresh chunk.
    pub fn inplace_update(&self, bytes: &[u8]) -> bool {
        if bytes.len() > self.len() {
            return false;
        }
        unsafe {
            let base = (self as *const CompactString as *mut u8).add(HEADER_SIZE);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len());
            persist(base, bytes.len());
            sfence();
            let header = self as *const CompactString as *mut u16;
            header.write_volatile(bytes.len() as u16 | VALID_BIT);
            persist(header as *const u8, HEADER_SIZE);
        }
        true
    }

    /// Append the wire form (header + payload) of `bytes` to a buffer.
    pub fn encode_into(buf: &mut Vec<u8>, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_STRING);
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut header, bytes.len() as u16 | VALID_BIT);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(bytes);
    }

    /// Split one wire-framed blob off the front of `buf`, returning the
    /// payload and the remainder.
    pub fn decode(buf: &[u8]) -> Result<(&[u8], &[u8]), StoreError> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Wire("truncated string header"));
        }
        let header = LittleEndian::read_u16(buf);
        let len = (header & LEN_MASK) as usize;
        let rest = &buf[HEADER_SIZE..];
        if rest.len() < len {
            return Err(StoreError::Wire("truncated string payload"));
        }
        Ok((&rest[..len], &rest[len..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_sets_valid_last() {
        let mut chunk = [0u16; 16];
        let s = unsafe { CompactString::make(chunk.as_mut_ptr() as *mut u8, b"hello") };
        assert!(s.is_valid());
        assert_eq!(s.len(), 5);
        assert_eq!(s.as_bytes(), b"hello");
    }

    #[test]
    fn ordering_is_prefix_then_length() {
        let mut chunk = [0u16; 16];
        let s = unsafe { CompactString::make(chunk.as_mut_ptr() as *mut u8, b"abc") };
        assert_eq!(s.compare(b"abd"), Ordering::Less);
        assert_eq!(s.compare(b"abb"), Ordering::Greater);
        assert_eq!(s.compare(b"abc"), Ordering::Equal);
        // shorter prefix sorts first
        assert_eq!(s.compare(b"abcd"), Ordering::Less);
        assert_eq!(s.compare(b"ab"), Ordering::Greater);
    }

    #[test]
    fn inplace_update_only_shrinks() {
        let mut chunk = [0u16; 16];
        let s = unsafe { CompactString::make(chunk.as_mut_ptr() as *mut u8, b"abcdef") };
        assert!(!s.inplace_update(b"toolongforit"));
        assert!(s.inplace_update(b"xy"));
        assert_eq!(s.as_bytes(), b"xy");
        assert!(s.is_valid());
    }

    #[test]
    fn wire_round_trip() {
        let mut buf = Vec::new();
        CompactString::encode_into(&mut buf, b"key");
        CompactString::encode_into(&mut buf, b"value");
        let (k, rest) = CompactString::decode(&buf).unwrap();
        assert_eq!(k, b"key");
        let (v, rest) = CompactString::decode(rest).unwrap();
        assert_eq!(v, b"value");
        assert!(rest.is_empty());
        assert!(matches!(CompactString::decode(&buf[..1]), Err(_)));
    }
}
