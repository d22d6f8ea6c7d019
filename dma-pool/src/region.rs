//! DMA memory regions and bus address translation.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::{DmaError, Result, MIN_REGION_SIZE, PAGE_SIZE};

// ============================================================================
// Memory regions
// ============================================================================

/// A CPU-visible memory range suitable for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base virtual address.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Check if region is usable for DMA (page-aligned, large enough).
    pub fn is_usable(&self) -> bool {
        self.base != 0 && self.base % PAGE_SIZE == 0 && self.size >= MIN_REGION_SIZE
    }

    /// One past the last address.
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

// ============================================================================
// Physical mapping
// ============================================================================

/// Per-page bus addresses for memory that is only contiguous page by page.
///
/// Populated at heap init from whatever page-frame information the OS
/// provides (UIO chunk list, pagemap, firmware memory map).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    log2_page_size: u32,
    pages: Vec<u64>,
}

impl PageTable {
    /// Create a page table.
    ///
    /// Every page address must be aligned to the page size.
    pub fn new(log2_page_size: u32, pages: Vec<u64>) -> Result<Self> {
        if !(12..=30).contains(&log2_page_size) || pages.is_empty() {
            return Err(DmaError::InvalidRegion);
        }
        let mask = (1u64 << log2_page_size) - 1;
        if pages.iter().any(|p| p & mask != 0) {
            return Err(DmaError::InvalidRegion);
        }
        Ok(Self {
            log2_page_size,
            pages,
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.log2_page_size
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True when the table maps no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Bytes covered by the table.
    pub fn covered_bytes(&self) -> usize {
        self.pages.len() << self.log2_page_size
    }

    /// Translate a region-relative offset.
    #[inline]
    pub fn translate(&self, offset: usize) -> Option<u64> {
        let page = self.pages.get(offset >> self.log2_page_size)?;
        Some(page + (offset & (self.page_size() - 1)) as u64)
    }
}

/// How CPU addresses in a region become device-visible addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysMapping {
    /// Bus address equals the CPU address (identity-mapped firmware memory).
    Identity,
    /// Region is physically contiguous starting at this bus address.
    Contiguous(u64),
    /// Region is made of pages scattered in physical memory.
    PageTable(PageTable),
}

impl PhysMapping {
    #[inline]
    fn translate(&self, cpu_base: usize, offset: usize) -> Option<u64> {
        match self {
            PhysMapping::Identity => Some((cpu_base + offset) as u64),
            PhysMapping::Contiguous(bus) => Some(bus + offset as u64),
            PhysMapping::PageTable(table) => table.translate(offset),
        }
    }

    /// Largest boundary the mapping needs allocations to respect, if any.
    pub(crate) fn required_bound(&self) -> Option<usize> {
        match self {
            PhysMapping::PageTable(table) => Some(table.page_size()),
            _ => None,
        }
    }
}

// ============================================================================
// Heap regions
// ============================================================================

enum Backing {
    /// Memory belongs to someone else; never freed by us.
    External,
    /// Allocated from the global allocator with this layout.
    Owned(Layout),
}

/// A region adopted by a heap, placed at `heap_offset` in heap offset space.
pub(crate) struct HeapRegion {
    pub(crate) cpu: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) heap_offset: usize,
    pub(crate) mapping: PhysMapping,
    backing: Backing,
}

impl HeapRegion {
    /// Allocate zeroed, `align`-aligned backing memory.
    pub(crate) fn owned(size: usize, align: usize, mapping: PhysMapping) -> Result<Self> {
        if size < MIN_REGION_SIZE {
            return Err(DmaError::InvalidRegion);
        }
        let layout = Layout::from_size_align(size, align.max(PAGE_SIZE))
            .map_err(|_| DmaError::InvalidAlignment)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let cpu = NonNull::new(ptr).ok_or(DmaError::OutOfMemory)?;
        Ok(Self {
            cpu,
            size,
            heap_offset: 0,
            mapping,
            backing: Backing::Owned(layout),
        })
    }

    /// Adopt caller-provided memory.
    ///
    /// # Safety
    /// The region must be valid, pinned, DMA-visible memory that nothing else
    /// uses for as long as the heap lives.
    pub(crate) unsafe fn external(region: MemoryRegion, mapping: PhysMapping) -> Result<Self> {
        if !region.is_usable() {
            return Err(DmaError::InvalidRegion);
        }
        let cpu = NonNull::new(region.base as *mut u8).ok_or(DmaError::InvalidRegion)?;
        core::ptr::write_bytes(cpu.as_ptr(), 0, region.size);
        Ok(Self {
            cpu,
            size: region.size,
            heap_offset: 0,
            mapping,
            backing: Backing::External,
        })
    }

    /// Check the mapping covers the region and the base honours `bound`.
    pub(crate) fn validate(&self, bound: Option<usize>) -> Result<()> {
        if let PhysMapping::PageTable(table) = &self.mapping {
            if table.covered_bytes() < self.size {
                return Err(DmaError::InvalidRegion);
            }
        }
        if let Some(bound) = bound {
            if self.cpu_addr() % bound != 0 {
                return Err(DmaError::InvalidRegion);
            }
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.heap_offset + self.size
    }

    #[inline]
    pub(crate) fn cpu_addr(&self) -> usize {
        self.cpu.as_ptr() as usize
    }

    /// Region-relative offset of a CPU pointer, if it falls inside.
    #[inline]
    pub(crate) fn local_offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.cpu_addr();
        (addr >= base && addr < base + self.size).then(|| addr - base)
    }

    /// Bus address of a region-relative offset.
    #[inline]
    pub(crate) fn bus_addr(&self, local: usize) -> Option<u64> {
        if local >= self.size {
            return None;
        }
        self.mapping.translate(self.cpu_addr(), local)
    }

    pub(crate) fn as_memory_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.cpu_addr(), self.size)
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        if let Backing::Owned(layout) = self.backing {
            // SAFETY: allocated in `owned` with exactly this layout.
            unsafe { dealloc(self.cpu.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_memory_region() {
        let region = MemoryRegion::new(4096, 65536);
        assert!(region.is_usable());

        let small = MemoryRegion::new(4096, 1024);
        assert!(!small.is_usable());
        assert!(!MemoryRegion::new(4097, 65536).is_usable());
        assert_eq!(region.end(), 4096 + 65536);
    }

    #[test]
    fn test_page_table_translate() {
        let table = PageTable::new(12, vec![0x8000_0000, 0x1000_0000]).unwrap();
        assert_eq!(table.translate(0x10), Some(0x8000_0010));
        assert_eq!(table.translate(0x1004), Some(0x1000_0004));
        assert_eq!(table.translate(0x2000), None);
    }

    #[test]
    fn test_page_table_rejects_unaligned_pages() {
        assert_eq!(
            PageTable::new(12, vec![0x8000_0010]),
            Err(DmaError::InvalidRegion)
        );
        assert_eq!(PageTable::new(12, vec![]), Err(DmaError::InvalidRegion));
    }
}
