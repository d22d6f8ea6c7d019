//! Packet buffers and the handles that reference them.
//!
//! # Buffer layout
//!
//! ```text
//!  ref.offset
//!  │
//!  ├─ header (64) ─┼─ rewrite (64) ─┼────────── payload ───────────┤
//!  │ next, clones, │ prepend room   │                              │
//!  │ save          │                │                              │
//!                  └──────────────── data area ────────────────────┘
//!                     ▲ data_offset (from data area start)
//!                     └─ data_len bytes ─▶
//! ```
//!
//! The header is private to this module: only the pool and [`RefChain`]
//! read or write it.

mod chain;
mod header;
mod pool;
mod state;

pub use chain::{Links, RefChain};
pub use pool::{BufferPool, PoolStats};
pub use state::BufferState;

pub(crate) use header::Header;

use bitflags::bitflags;
use dma_pool::{PhysicalHeap, CACHE_LINE_BYTES};

use crate::error::{DataplaneError, Result};

/// Bytes of the private buffer header.
pub const BUFFER_HEADER_BYTES: usize = CACHE_LINE_BYTES;

/// Headroom in front of the payload for prepending headers.
pub const REWRITE_BYTES: usize = 64;

/// Per-buffer bytes that are not payload.
pub const BUFFER_OVERHEAD_BYTES: usize = BUFFER_HEADER_BYTES + REWRITE_BYTES;

bitflags! {
    /// Per-reference flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RefFlags: u8 {
        /// Buffer header holds the next reference of a chain.
        const CHAINED = 1 << 0;
        /// Buffer is shared; freeing drops one clone count.
        const CLONED = 1 << 1;
    }
}

/// Per-packet metadata carried with a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RefOpaque {
    /// Receiving or transmitting interface index.
    pub interface: u32,
    /// Error code; 0 when the packet is good.
    pub error: u32,
}

/// Handle to a buffer: heap offset, flags, data window and opaque.
///
/// Refs are plain values; copying one does not share the buffer. Use
/// [`BufferPool::clone_ref`] to share, and free every handle exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref {
    offset: u32,
    flags: RefFlags,
    data_offset: u16,
    data_len: u16,
    pub opaque: RefOpaque,
}

impl Ref {
    pub(crate) const fn new(offset: u32, data_offset: u16, data_len: u16, opaque: RefOpaque) -> Self {
        Self {
            offset,
            flags: RefFlags::empty(),
            data_offset,
            data_len,
            opaque,
        }
    }

    /// Heap offset of the buffer.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn flags(&self) -> RefFlags {
        self.flags
    }

    #[inline]
    pub fn is_chained(&self) -> bool {
        self.flags.contains(RefFlags::CHAINED)
    }

    #[inline]
    pub fn is_cloned(&self) -> bool {
        self.flags.contains(RefFlags::CLONED)
    }

    pub(crate) fn set_flags(&mut self, flags: RefFlags) {
        self.flags = flags;
    }

    /// Start of the data window, relative to the data area.
    #[inline]
    pub fn data_offset(&self) -> u16 {
        self.data_offset
    }

    #[inline]
    pub fn data_len(&self) -> u16 {
        self.data_len
    }

    #[inline]
    pub fn set_data_len(&mut self, len: u16) {
        self.data_len = len;
    }

    /// Heap offset of the buffer's data area.
    #[inline]
    pub fn data_area(&self) -> usize {
        self.offset as usize + BUFFER_HEADER_BYTES
    }

    /// Heap offset of the first data byte.
    #[inline]
    pub fn data_start(&self) -> usize {
        self.data_area() + self.data_offset as usize
    }

    /// Move the start of the data window by `n` bytes.
    ///
    /// Positive `n` consumes a header, negative `n` prepends into the
    /// rewrite area. The window end stays put: `n` is clamped so the start
    /// neither moves before the data area nor past the window end.
    ///
    /// # Returns
    /// The previous data offset, for [`Ref::restore`].
    pub fn advance(&mut self, n: i32) -> u16 {
        let old = self.data_offset;
        let n = n.clamp(-i32::from(old), i32::from(self.data_len));
        self.data_offset = (i32::from(old) + n) as u16;
        self.data_len = (i32::from(self.data_len) - n) as u16;
        old
    }

    /// Undo an [`advance`](Ref::advance).
    pub fn restore(&mut self, old_offset: u16) {
        let delta = i32::from(self.data_offset) - i32::from(old_offset);
        self.data_len = (i32::from(self.data_len) + delta).clamp(0, i32::from(u16::MAX)) as u16;
        self.data_offset = old_offset;
    }

    /// Successor in a chain, read from this buffer's header.
    pub fn next(&self, heap: &PhysicalHeap) -> Result<Option<Ref>> {
        if !self.is_chained() {
            return Ok(None);
        }
        Ok(Some(Header::load(heap, self.offset)?.next))
    }

    /// Iterate this ref and all of its chained successors.
    pub fn links<'h>(&self, heap: &'h PhysicalHeap) -> Links<'h> {
        Links::new(heap, *self)
    }

    /// Number of buffers in the chain starting here.
    pub fn chain_len(&self, heap: &PhysicalHeap) -> Result<usize> {
        let mut count = 0;
        for link in self.links(heap) {
            link?;
            count += 1;
        }
        Ok(count)
    }

    /// Bytes in the chain starting here.
    pub fn chain_bytes_len(&self, heap: &PhysicalHeap) -> Result<usize> {
        let mut total = 0;
        for link in self.links(heap) {
            total += link?.data_len as usize;
        }
        Ok(total)
    }

    pub(crate) fn check_window(&self, data_capacity: usize) -> Result<()> {
        let end = self.data_offset as usize + self.data_len as usize;
        if end > data_capacity {
            return Err(DataplaneError::BufferTooSmall {
                needed: end,
                available: data_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_restore() {
        let mut r = Ref::new(0x1000, REWRITE_BYTES as u16, 100, RefOpaque::default());

        let old = r.advance(14);
        assert_eq!(old, 64);
        assert_eq!(r.data_offset(), 78);
        assert_eq!(r.data_len(), 86);

        r.restore(old);
        assert_eq!(r.data_offset(), 64);
        assert_eq!(r.data_len(), 100);

        // Prepend into the rewrite area.
        let old = r.advance(-8);
        assert_eq!(r.data_offset(), 56);
        assert_eq!(r.data_len(), 108);
        r.restore(old);
        assert_eq!(r.data_len(), 100);
    }

    #[test]
    fn test_advance_keeps_window_end() {
        let mut r = Ref::new(0x1000, 16, 100, RefOpaque::default());
        let end = r.data_offset() + r.data_len();

        r.advance(-40);
        assert_eq!(r.data_offset(), 0);
        assert_eq!(r.data_len(), 116);
        assert_eq!(r.data_offset() + r.data_len(), end);

        r.advance(500);
        assert_eq!(r.data_offset(), end);
        assert_eq!(r.data_len(), 0);
    }

    #[test]
    fn test_data_offsets() {
        let r = Ref::new(0x2000, 64, 0, RefOpaque::default());
        assert_eq!(r.data_area(), 0x2000 + 64);
        assert_eq!(r.data_start(), 0x2000 + 128);
    }

    #[test]
    fn test_window_check() {
        let r = Ref::new(0, 64, 200, RefOpaque::default());
        assert!(r.check_window(264).is_ok());
        assert_eq!(
            r.check_window(263),
            Err(DataplaneError::BufferTooSmall {
                needed: 264,
                available: 263
            })
        );
    }
}
