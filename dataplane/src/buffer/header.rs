//! On-buffer header encoding.
//!
//! ```text
//!  0       4   5     6        8        10       12         16     20      64
//!  ├ next  ┼ f ┼ pad ┼ next   ┼ next   ┼ pad    ┼ clone    ┼ save ┼ zero ─┤
//!  │offset │   │     │ d_off  │ d_len  │        │ count    │      │       │
//! ```
//!
//! All fields little-endian. The next-ref carries no opaque words.

use dma_pool::PhysicalHeap;

use super::{Ref, RefFlags, RefOpaque, BUFFER_HEADER_BYTES};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Successor; only meaningful when the owning ref is CHAINED.
    pub next: Ref,
    /// Extra holders beyond the first.
    pub clone_count: u32,
    /// Driver scratch word, survives free.
    pub save: u32,
}

impl Header {
    pub fn empty(save: u32) -> Self {
        Self {
            next: Ref::new(0, 0, 0, RefOpaque::default()),
            clone_count: 0,
            save,
        }
    }

    pub fn decode(bytes: &[u8; BUFFER_HEADER_BYTES]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let mut next = Ref::new(u32_at(0), u16_at(6), u16_at(8), RefOpaque::default());
        next.set_flags(RefFlags::from_bits_truncate(bytes[4]));
        Self {
            next,
            clone_count: u32_at(12),
            save: u32_at(16),
        }
    }

    pub fn encode(&self) -> [u8; BUFFER_HEADER_BYTES] {
        let mut bytes = [0u8; BUFFER_HEADER_BYTES];
        bytes[0..4].copy_from_slice(&self.next.offset().to_le_bytes());
        bytes[4] = self.next.flags().bits();
        bytes[6..8].copy_from_slice(&self.next.data_offset().to_le_bytes());
        bytes[8..10].copy_from_slice(&self.next.data_len().to_le_bytes());
        bytes[12..16].copy_from_slice(&self.clone_count.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.save.to_le_bytes());
        bytes
    }

    /// Read the header of the buffer at `offset`.
    pub fn load(heap: &PhysicalHeap, offset: u32) -> Result<Self> {
        let mut bytes = [0u8; BUFFER_HEADER_BYTES];
        heap.read(offset as usize, &mut bytes)?;
        Ok(Self::decode(&bytes))
    }

    pub fn store(&self, heap: &PhysicalHeap, offset: u32) -> Result<()> {
        heap.write(offset as usize, &self.encode())?;
        Ok(())
    }

    /// Point the buffer at `offset` to `next`, leaving the rest intact.
    pub fn link(heap: &PhysicalHeap, offset: u32, next: &Ref) -> Result<()> {
        let mut header = Self::load(heap, offset)?;
        header.next = *next;
        header.next.opaque = RefOpaque::default();
        header.store(heap, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut next = Ref::new(0x0001_2340, 64, 1500, RefOpaque::default());
        next.set_flags(RefFlags::CHAINED);
        let header = Header {
            next,
            clone_count: 2,
            save: 0xDEAD_BEEF,
        };
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[0x40, 0x23, 0x01, 0x00]);
        assert_eq!(bytes[4], RefFlags::CHAINED.bits());
        assert_eq!(&bytes[6..8], &64u16.to_le_bytes());
        assert_eq!(&bytes[8..10], &1500u16.to_le_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0xDEAD_BEEFu32.to_le_bytes());
        assert!(bytes[20..].iter().all(|&b| b == 0));

        assert_eq!(Header::decode(&bytes), header);
    }

    #[test]
    fn test_empty_keeps_save() {
        let header = Header::empty(7);
        assert_eq!(header.save, 7);
        assert_eq!(header.clone_count, 0);
        assert!(!header.next.is_chained());
    }
}
