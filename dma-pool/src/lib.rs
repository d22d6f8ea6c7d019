//! Physically-addressed DMA heap.
//!
//! This crate owns the DMA-visible memory a device driver works with. Every
//! other layer (buffer pools, descriptor rings) addresses that memory by
//! *heap offset* and goes through the narrow accessors here whenever it needs
//! a pointer or a device-visible address.
//!
//! # Memory Sources
//!
//! 1. **Owned**: page-aligned memory allocated from the global allocator and
//!    released when the heap is dropped (hosted builds, tests)
//! 2. **External**: caller provides a pinned region (firmware, UIO, VFIO)
//!
//! # Physical Mapping
//!
//! Each region translates CPU addresses to bus addresses one of three ways:
//! identity, physically contiguous at a fixed bus base, or through a page
//! table of per-page bus addresses. When the platform hands out DMA memory
//! in scattered pages, set a page bound on the heap so that no allocation
//! crosses a page and every extent stays physically contiguous.
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::{PhysicalHeap, PhysMapping};
//!
//! let heap = PhysicalHeap::builder()
//!     .owned_region(1 << 20, PhysMapping::Identity)
//!     .page_bound(4096)
//!     .build()?;
//!
//! let extent = heap.alloc(2048, 64)?;
//! let bus = heap.offset_to_physical(extent.offset());
//! heap.free(extent.id())?;
//! ```

#![no_std]

extern crate alloc;

pub mod heap;
pub mod region;

pub use heap::{Extent, ExtentId, HeapBuilder, HeapStats, PhysicalHeap};
pub use region::{MemoryRegion, PageTable, PhysMapping};

use core::fmt;

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Cache line size; the allocation granule of the heap.
pub const CACHE_LINE_BYTES: usize = 64;

/// log2 of [`CACHE_LINE_BYTES`].
pub const LOG2_CACHE_LINE_BYTES: u32 = 6;

/// Minimum usable memory region size (64KB).
pub const MIN_REGION_SIZE: usize = 64 * 1024;

/// Largest single extent handed out when no page bound is configured (1MB).
pub const MAX_EXTENT_BYTES: usize = 1 << 20;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Round a byte count up to a whole number of cache lines.
#[inline]
pub const fn round_cache_line(bytes: usize) -> usize {
    align_up(bytes, CACHE_LINE_BYTES)
}

// ============================================================================
// Error types
// ============================================================================

/// DMA heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Requested 0 bytes.
    ZeroSize,
    /// No free extent can satisfy the request.
    OutOfMemory,
    /// Request can never be satisfied (larger than the page bound or any region).
    TooLarge,
    /// Alignment is not a power of two.
    InvalidAlignment,
    /// Region is misaligned, too small, or inconsistent with its mapping.
    InvalidRegion,
    /// Extent id is not live.
    InvalidId,
    /// Heap was built without any region.
    NoRegions,
    /// Offset range falls outside a single region.
    OutOfBounds,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-sized DMA allocation"),
            Self::OutOfMemory => write!(f, "DMA heap out of memory"),
            Self::TooLarge => write!(f, "DMA allocation exceeds largest possible extent"),
            Self::InvalidAlignment => write!(f, "alignment is not a power of two"),
            Self::InvalidRegion => write!(f, "invalid DMA memory region"),
            Self::InvalidId => write!(f, "unknown DMA extent id"),
            Self::NoRegions => write!(f, "DMA heap has no regions"),
            Self::OutOfBounds => write!(f, "offset outside DMA heap"),
        }
    }
}

/// Result type for DMA operations.
pub type Result<T> = core::result::Result<T, DmaError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(round_cache_line(65), 128);
    }
}
