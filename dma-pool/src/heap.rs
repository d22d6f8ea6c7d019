//! Physical heap: extent allocator over DMA regions.
//!
//! # Offset space
//!
//! Regions are laid out back to back in a single *heap offset* space:
//!
//! ```text
//!  offset 0                    region0.size                     capacity
//!  ├──────── region 0 ─────────┼──────── region 1 ──────────────┤
//!  │ ext │ ext │   hole   │ ext│ ext │     hole     │ ext │ ext │
//! ```
//!
//! Offsets always fit in a `u32`, which is what buffer handles store. Each
//! region has its own first-fit free list (`linked_list_allocator::Heap`),
//! so an extent never spans two regions.
//!
//! # Page bounding
//!
//! When the platform only guarantees physical contiguity within a page, the
//! heap is built with a page bound. A candidate extent that would cross a
//! bound is *held* (kept allocated) while the allocator retries; every held
//! fragment is handed back once a conforming extent is found or the search
//! fails.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use linked_list_allocator::Heap;
use log::{debug, trace};
use spin::Mutex;

use crate::region::{HeapRegion, MemoryRegion, PhysMapping};
use crate::{round_cache_line, DmaError, Result, CACHE_LINE_BYTES, PAGE_SIZE};

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

// ═══════════════════════════════════════════════════════════════════════════
// EXTENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Handle of a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentId(u32);

impl ExtentId {
    /// Raw index.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// A live allocation: `capacity` bytes starting at heap `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    id: ExtentId,
    offset: usize,
    capacity: usize,
}

impl Extent {
    pub fn id(&self) -> ExtentId {
        self.id
    }

    /// Heap offset of the first byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Usable bytes (request rounded up to a cache line).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the last heap offset.
    pub fn end(&self) -> usize {
        self.offset + self.capacity
    }
}

/// Heap usage in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub used: usize,
    pub free: usize,
    pub capacity: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used {}, free {}, capacity {}",
            self.used, self.free, self.capacity
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ALLOCATOR STATE
// ═══════════════════════════════════════════════════════════════════════════

struct Allocation {
    region: usize,
    ptr: NonNull<u8>,
    layout: Layout,
}

struct AllocState {
    /// One free list per region, same index as `PhysicalHeap::regions`.
    arenas: Vec<Heap>,
    allocations: Vec<Option<Allocation>>,
    free_ids: Vec<u32>,
    used: usize,
}

impl AllocState {
    fn record(&mut self, allocation: Allocation) -> ExtentId {
        self.used += allocation.layout.size();
        match self.free_ids.pop() {
            Some(id) => {
                self.allocations[id as usize] = Some(allocation);
                ExtentId(id)
            }
            None => {
                self.allocations.push(Some(allocation));
                ExtentId((self.allocations.len() - 1) as u32)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PHYSICAL HEAP
// ═══════════════════════════════════════════════════════════════════════════

/// DMA-visible memory addressed by heap offset.
pub struct PhysicalHeap {
    id: u32,
    /// Immutable after build; only the free lists change.
    regions: Vec<HeapRegion>,
    page_bound: Option<usize>,
    capacity: usize,
    state: Mutex<AllocState>,
}

// SAFETY: region pointers are only dereferenced through bounds-checked
// accessors, and all allocator state sits behind the mutex.
unsafe impl Send for PhysicalHeap {}
unsafe impl Sync for PhysicalHeap {}

impl PhysicalHeap {
    /// Start building a heap.
    pub fn builder() -> HeapBuilder {
        HeapBuilder::new()
    }

    /// Process-unique heap id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Boundary no extent may cross, if page bounding is active.
    pub fn page_bound(&self) -> Option<usize> {
        self.page_bound
    }

    /// Total bytes over all regions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest single request the heap could ever satisfy.
    pub fn max_extent(&self) -> usize {
        let largest = self.regions.iter().map(|r| r.size).max().unwrap_or(0);
        match self.page_bound {
            Some(bound) => bound.min(largest),
            None => largest,
        }
    }

    /// Regions in heap offset order.
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.regions.iter().map(HeapRegion::as_memory_region)
    }

    pub fn stats(&self) -> HeapStats {
        let used = self.state.lock().used;
        HeapStats {
            used,
            free: self.capacity - used,
            capacity: self.capacity,
        }
    }

    /// Allocate at least `size` bytes aligned to `max(align, 64)`.
    ///
    /// # Returns
    /// An extent whose capacity is `size` rounded up to a cache line.
    pub fn alloc(&self, size: usize, align: usize) -> Result<Extent> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        if !align.is_power_of_two() {
            return Err(DmaError::InvalidAlignment);
        }
        let align = align.max(CACHE_LINE_BYTES);
        let capacity = round_cache_line(size);
        if capacity > self.max_extent() {
            return Err(DmaError::TooLarge);
        }
        if matches!(self.page_bound, Some(bound) if align > bound) {
            return Err(DmaError::InvalidAlignment);
        }
        let layout =
            Layout::from_size_align(capacity, align).map_err(|_| DmaError::InvalidAlignment)?;

        let mut state = self.state.lock();
        let mut held = Vec::new();
        let found = self.first_fit(&mut state, layout, &mut held);

        if !held.is_empty() {
            trace!("dma heap {}: released {} straddling fragments", self.id, held.len());
        }
        for (region, ptr) in held {
            // SAFETY: allocated just above from this arena with this layout.
            unsafe { state.arenas[region].deallocate(ptr, layout) };
        }

        let (region, ptr) = found.ok_or(DmaError::OutOfMemory)?;
        let offset = self.regions[region].heap_offset
            + (ptr.as_ptr() as usize - self.regions[region].cpu_addr());
        let id = state.record(Allocation { region, ptr, layout });
        Ok(Extent {
            id,
            offset,
            capacity,
        })
    }

    fn first_fit(
        &self,
        state: &mut AllocState,
        layout: Layout,
        held: &mut Vec<(usize, NonNull<u8>)>,
    ) -> Option<(usize, NonNull<u8>)> {
        for (index, region) in self.regions.iter().enumerate() {
            while let Ok(ptr) = state.arenas[index].allocate_first_fit(layout) {
                let local = ptr.as_ptr() as usize - region.cpu_addr();
                if self.straddles(local, layout.size()) {
                    held.push((index, ptr));
                    continue;
                }
                return Some((index, ptr));
            }
        }
        None
    }

    #[inline]
    fn straddles(&self, local: usize, len: usize) -> bool {
        match self.page_bound {
            Some(bound) => local / bound != (local + len - 1) / bound,
            None => false,
        }
    }

    /// Return an extent to its region's free list.
    pub fn free(&self, id: ExtentId) -> Result<()> {
        let mut state = self.state.lock();
        let allocation = state
            .allocations
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(DmaError::InvalidId)?;
        // SAFETY: the allocation record holds the pointer and layout returned
        // by this arena, and `take` guarantees it is freed once.
        unsafe {
            state.arenas[allocation.region].deallocate(allocation.ptr, allocation.layout);
        }
        state.used -= allocation.layout.size();
        state.free_ids.push(id.0);
        Ok(())
    }

    /// Look up a live extent.
    pub fn extent(&self, id: ExtentId) -> Option<Extent> {
        let state = self.state.lock();
        let allocation = state.allocations.get(id.0 as usize)?.as_ref()?;
        let region = &self.regions[allocation.region];
        Some(Extent {
            id,
            offset: region.heap_offset + (allocation.ptr.as_ptr() as usize - region.cpu_addr()),
            capacity: allocation.layout.size(),
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Translation
    // ───────────────────────────────────────────────────────────────────────

    fn region_of(&self, offset: usize) -> Option<&HeapRegion> {
        self.regions
            .iter()
            .find(|r| offset >= r.heap_offset && offset < r.end())
    }

    /// Region and region-local offset for `len` bytes at `offset`.
    fn locate(&self, offset: usize, len: usize) -> Result<(&HeapRegion, usize)> {
        let region = self.region_of(offset).ok_or(DmaError::OutOfBounds)?;
        let local = offset - region.heap_offset;
        if local.checked_add(len).map_or(true, |end| end > region.size) {
            return Err(DmaError::OutOfBounds);
        }
        Ok((region, local))
    }

    /// True when `offset` lies inside some region.
    #[inline]
    pub fn pointer_valid(&self, offset: usize) -> bool {
        self.region_of(offset).is_some()
    }

    /// CPU pointer for a heap offset.
    #[inline]
    pub fn offset_to_pointer(&self, offset: usize) -> Option<NonNull<u8>> {
        let region = self.region_of(offset)?;
        // SAFETY: offset is inside the region, so the result is in bounds.
        let ptr = unsafe { region.cpu.as_ptr().add(offset - region.heap_offset) };
        NonNull::new(ptr)
    }

    /// Heap offset of a CPU pointer.
    pub fn pointer_to_offset(&self, ptr: *const u8) -> Option<usize> {
        self.regions.iter().find_map(|r| {
            r.local_offset_of(ptr as usize)
                .map(|local| r.heap_offset + local)
        })
    }

    /// Device-visible address of a CPU pointer.
    pub fn physical_address(&self, ptr: *const u8) -> Option<u64> {
        self.regions.iter().find_map(|r| {
            r.local_offset_of(ptr as usize)
                .and_then(|local| r.bus_addr(local))
        })
    }

    /// Device-visible address of a heap offset.
    #[inline]
    pub fn offset_to_physical(&self, offset: usize) -> Option<u64> {
        let region = self.region_of(offset)?;
        region.bus_addr(offset - region.heap_offset)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Byte access
    // ───────────────────────────────────────────────────────────────────────

    /// Copy `dst.len()` bytes out of the heap.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let (region, local) = self.locate(offset, dst.len())?;
        // SAFETY: range checked by `locate`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                region.cpu.as_ptr().add(local),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy `src` into the heap.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        let (region, local) = self.locate(offset, src.len())?;
        // SAFETY: range checked by `locate`.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), region.cpu.as_ptr().add(local), src.len());
        }
        Ok(())
    }

    /// Set `len` bytes at `offset` to `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        let (region, local) = self.locate(offset, len)?;
        // SAFETY: range checked by `locate`.
        unsafe { core::ptr::write_bytes(region.cpu.as_ptr().add(local), byte, len) };
        Ok(())
    }

    /// Volatile load of a `T` at `offset`.
    ///
    /// # Safety
    /// `T` must be valid for any bit pattern and `offset` suitably aligned
    /// for it.
    #[inline]
    pub unsafe fn read_volatile<T: Copy>(&self, offset: usize) -> Result<T> {
        let (region, local) = self.locate(offset, core::mem::size_of::<T>())?;
        let ptr = region.cpu.as_ptr().add(local) as *const T;
        debug_assert!(ptr as usize % core::mem::align_of::<T>() == 0);
        Ok(core::ptr::read_volatile(ptr))
    }

    /// Volatile store of a `T` at `offset`.
    ///
    /// # Safety
    /// `offset` must be suitably aligned for `T`, and nothing may hold a
    /// reference into the overwritten bytes.
    #[inline]
    pub unsafe fn write_volatile<T: Copy>(&self, offset: usize, value: T) -> Result<()> {
        let (region, local) = self.locate(offset, core::mem::size_of::<T>())?;
        let ptr = region.cpu.as_ptr().add(local) as *mut T;
        debug_assert!(ptr as usize % core::mem::align_of::<T>() == 0);
        core::ptr::write_volatile(ptr, value);
        Ok(())
    }
}

impl fmt::Debug for PhysicalHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalHeap")
            .field("id", &self.id)
            .field("regions", &self.regions.len())
            .field("page_bound", &self.page_bound)
            .field("stats", &self.stats())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════

enum PendingRegion {
    Owned { size: usize, mapping: PhysMapping },
    External { region: MemoryRegion, mapping: PhysMapping },
}

/// Collects regions and options, then builds a [`PhysicalHeap`].
pub struct HeapBuilder {
    pending: Vec<PendingRegion>,
    page_bound: Option<usize>,
}

impl HeapBuilder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            page_bound: None,
        }
    }

    /// Add a zeroed region allocated from the global allocator.
    ///
    /// The heap frees it when dropped. `size` is rounded up to whole pages.
    pub fn owned_region(mut self, size: usize, mapping: PhysMapping) -> Self {
        self.pending.push(PendingRegion::Owned {
            size: crate::align_up(size, PAGE_SIZE),
            mapping,
        });
        self
    }

    /// Adopt caller-provided DMA memory.
    ///
    /// # Safety
    /// - `region` must be valid, pinned, DMA-visible memory
    /// - nothing else may use it for the lifetime of the heap
    /// - `mapping` must describe its real bus addresses
    pub unsafe fn external_region(mut self, region: MemoryRegion, mapping: PhysMapping) -> Self {
        self.pending.push(PendingRegion::External { region, mapping });
        self
    }

    /// Forbid extents crossing a multiple of `bound` bytes.
    pub fn page_bound(mut self, bound: usize) -> Self {
        self.page_bound = Some(bound);
        self
    }

    pub fn build(self) -> Result<PhysicalHeap> {
        if self.pending.is_empty() {
            return Err(DmaError::NoRegions);
        }

        // Page-table mappings only guarantee contiguity within a page.
        let mut bound = self.page_bound;
        for pending in &self.pending {
            let mapping = match pending {
                PendingRegion::Owned { mapping, .. } => mapping,
                PendingRegion::External { mapping, .. } => mapping,
            };
            if let Some(required) = mapping.required_bound() {
                bound = Some(bound.map_or(required, |b| b.min(required)));
            }
        }
        if let Some(b) = bound {
            if !b.is_power_of_two() || b < CACHE_LINE_BYTES {
                return Err(DmaError::InvalidAlignment);
            }
        }

        let mut regions = Vec::with_capacity(self.pending.len());
        let mut heap_offset = 0usize;
        for pending in self.pending {
            let mut region = match pending {
                PendingRegion::Owned { size, mapping } => {
                    HeapRegion::owned(size, bound.unwrap_or(PAGE_SIZE), mapping)?
                }
                // SAFETY: upheld by the caller of `external_region`.
                PendingRegion::External { region, mapping } => unsafe {
                    HeapRegion::external(region, mapping)?
                },
            };
            region.validate(bound)?;
            region.heap_offset = heap_offset;
            heap_offset += region.size;
            regions.push(region);
        }
        if heap_offset > u32::MAX as usize {
            return Err(DmaError::InvalidRegion);
        }

        let arenas = regions
            .iter()
            .map(|region| {
                let mut arena = Heap::empty();
                // SAFETY: the region is exclusively ours for the heap's lifetime.
                unsafe { arena.init(region.cpu.as_ptr(), region.size) };
                arena
            })
            .collect();

        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "dma heap {}: {} regions, {} bytes, page bound {:?}",
            id,
            regions.len(),
            heap_offset,
            bound
        );

        Ok(PhysicalHeap {
            id,
            regions,
            page_bound: bound,
            capacity: heap_offset,
            state: Mutex::new(AllocState {
                arenas,
                allocations: Vec::new(),
                free_ids: Vec::new(),
                used: 0,
            }),
        })
    }
}

impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PageTable;
    use alloc::vec::Vec;

    fn small_heap() -> PhysicalHeap {
        PhysicalHeap::builder()
            .owned_region(64 * 1024, PhysMapping::Identity)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_region() {
        assert_eq!(
            PhysicalHeap::builder().build().err(),
            Some(DmaError::NoRegions)
        );
    }

    #[test]
    fn test_alloc_rounds_and_aligns() {
        let heap = small_heap();
        let a = heap.alloc(100, 8).unwrap();
        assert_eq!(a.capacity(), 128);
        assert_eq!(a.offset() % CACHE_LINE_BYTES, 0);

        let b = heap.alloc(64, 1024).unwrap();
        assert_eq!(b.offset() % 1024, 0);
        assert_eq!(heap.stats().used, 128 + 64);
    }

    #[test]
    fn test_alloc_rejects_bad_requests() {
        let heap = small_heap();
        assert_eq!(heap.alloc(0, 64), Err(DmaError::ZeroSize));
        assert_eq!(heap.alloc(64, 48), Err(DmaError::InvalidAlignment));
        assert_eq!(heap.alloc(64 * 1024 + 1, 64), Err(DmaError::TooLarge));
    }

    #[test]
    fn test_free_and_reuse() {
        let heap = small_heap();
        let a = heap.alloc(4096, 64).unwrap();
        heap.free(a.id()).unwrap();
        assert_eq!(heap.stats().used, 0);

        let b = heap.alloc(4096, 64).unwrap();
        assert_eq!(a.offset(), b.offset());
        // Ids are recycled.
        assert_eq!(a.id(), b.id());
        assert_eq!(heap.free(b.id()), Ok(()));
        assert_eq!(heap.free(b.id()), Err(DmaError::InvalidId));
    }

    #[test]
    fn test_out_of_memory() {
        let heap = small_heap();
        let all = heap.alloc(64 * 1024, 64).unwrap();
        assert_eq!(heap.alloc(64, 64), Err(DmaError::OutOfMemory));
        heap.free(all.id()).unwrap();
        assert!(heap.alloc(64, 64).is_ok());
    }

    #[test]
    fn test_neighbours_coalesce() {
        let heap = small_heap();
        let a = heap.alloc(32 * 1024, 64).unwrap();
        let b = heap.alloc(32 * 1024, 64).unwrap();
        heap.free(a.id()).unwrap();
        heap.free(b.id()).unwrap();
        assert!(heap.alloc(64 * 1024, 64).is_ok());
    }

    #[test]
    fn test_byte_access_bounds() {
        let heap = small_heap();
        let e = heap.alloc(256, 64).unwrap();
        heap.write(e.offset(), b"hello").unwrap();
        let mut out = [0u8; 5];
        heap.read(e.offset(), &mut out).unwrap();
        assert_eq!(&out, b"hello");

        heap.fill(e.offset(), 2, 0xAA).unwrap();
        heap.read(e.offset(), &mut out).unwrap();
        assert_eq!(out, [0xAA, 0xAA, b'l', b'l', b'o']);

        let mut big = [0u8; 8];
        assert_eq!(heap.read(64 * 1024 - 4, &mut big), Err(DmaError::OutOfBounds));
        assert_eq!(heap.write(1 << 20, b"x"), Err(DmaError::OutOfBounds));
    }

    #[test]
    fn test_volatile_access() {
        let heap = small_heap();
        let e = heap.alloc(64, 64).unwrap();
        unsafe {
            heap.write_volatile::<u64>(e.offset(), 0x1122_3344_5566_7788).unwrap();
            assert_eq!(heap.read_volatile::<u64>(e.offset()), Ok(0x1122_3344_5566_7788));
        }
    }

    #[test]
    fn test_identity_translation() {
        let heap = small_heap();
        let e = heap.alloc(64, 64).unwrap();
        let ptr = heap.offset_to_pointer(e.offset()).unwrap();
        assert_eq!(heap.physical_address(ptr.as_ptr()), Some(ptr.as_ptr() as u64));
        assert_eq!(heap.offset_to_physical(e.offset()), Some(ptr.as_ptr() as u64));
        assert_eq!(heap.pointer_to_offset(ptr.as_ptr()), Some(e.offset()));
        assert!(heap.pointer_valid(e.offset()));
        assert!(!heap.pointer_valid(64 * 1024));
    }

    #[test]
    fn test_contiguous_translation_across_regions() {
        let heap = PhysicalHeap::builder()
            .owned_region(64 * 1024, PhysMapping::Contiguous(0x4000_0000))
            .owned_region(64 * 1024, PhysMapping::Contiguous(0x9000_0000))
            .build()
            .unwrap();
        assert_eq!(heap.capacity(), 128 * 1024);
        assert_eq!(heap.offset_to_physical(0x10), Some(0x4000_0010));
        assert_eq!(heap.offset_to_physical(64 * 1024 + 0x20), Some(0x9000_0020));
    }

    #[test]
    fn test_page_table_translation() {
        let pages: Vec<u64> = (0..16u64).map(|i| 0x10_0000 + (15 - i) * 0x1000).collect();
        let table = PageTable::new(12, pages.clone()).unwrap();
        let heap = PhysicalHeap::builder()
            .owned_region(64 * 1024, PhysMapping::PageTable(table))
            .build()
            .unwrap();

        // Page tables imply a page bound.
        assert_eq!(heap.page_bound(), Some(4096));
        assert_eq!(heap.offset_to_physical(0x1008), Some(pages[1] + 8));
        assert_eq!(heap.offset_to_physical(0xF000), Some(pages[15]));
        assert_eq!(heap.alloc(8192, 64), Err(DmaError::TooLarge));
    }

    #[test]
    fn test_page_bounded_allocation_never_straddles() {
        let heap = PhysicalHeap::builder()
            .owned_region(64 * 1024, PhysMapping::Identity)
            .page_bound(4096)
            .build()
            .unwrap();

        let mut extents = Vec::new();
        loop {
            match heap.alloc(300, 64) {
                Ok(e) => extents.push(e),
                Err(DmaError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        assert!(!extents.is_empty());
        for e in &extents {
            assert_eq!(e.capacity(), 320);
            assert_eq!(e.offset() / 4096, (e.end() - 1) / 4096, "{e:?} straddles");
        }
        // Held fragments were released; only straddle gaps remain free.
        let stats = heap.stats();
        assert_eq!(stats.used, extents.len() * 320);
        assert!(stats.free <= 2 * 4096, "{stats}");
    }

    #[test]
    fn test_external_region_rejects_unaligned_base() {
        let result = unsafe {
            PhysicalHeap::builder()
                .external_region(MemoryRegion::new(0x1001, 64 * 1024), PhysMapping::Identity)
                .build()
        };
        assert_eq!(result.err(), Some(DmaError::InvalidRegion));
    }

    #[test]
    fn test_stats_display() {
        let heap = small_heap();
        heap.alloc(128, 64).unwrap();
        assert_eq!(
            alloc::format!("{}", heap.stats()),
            "used 128, free 65408, capacity 65536"
        );
    }
}
