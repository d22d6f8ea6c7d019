//! Buffer pool management.
//!
//! Buffers are carved out of heap extents in growth steps and recycled
//! through a LIFO free list of ready-made refs. A buffer's stride is a
//! prime number of cache lines so consecutive buffers spread over all cache
//! sets instead of hammering a few.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use dma_pool::{
    round_cache_line, DmaError, Extent, PhysicalHeap, CACHE_LINE_BYTES, LOG2_CACHE_LINE_BYTES,
    MAX_EXTENT_BYTES,
};
use log::{debug, trace, warn};
use spin::Mutex;

use super::header::Header;
use super::state::{self, BufferState};
use super::{Ref, RefFlags, BUFFER_OVERHEAD_BYTES, REWRITE_BYTES};
use crate::config::PoolConfig;
use crate::error::{DataplaneError, Result};

/// Pool usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers on the free list.
    pub free_buffers: usize,
    /// Buffers carved so far.
    pub total_buffers: usize,
    /// Payload bytes per buffer.
    pub buffer_bytes: usize,
    /// Heap bytes held by the pool.
    pub dma_bytes: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} buffers free, {} byte buffers, {} DMA bytes",
            self.free_buffers, self.total_buffers, self.buffer_bytes, self.dma_bytes
        )
    }
}

struct PoolInner {
    /// Ready-to-hand-out refs; the top is the most recently freed.
    free: Vec<Ref>,
    extents: Vec<Extent>,
    total: usize,
}

/// Pool of fixed-size DMA buffers.
pub struct BufferPool {
    heap: Arc<PhysicalHeap>,
    name: String,
    /// Payload bytes after the rewrite area.
    payload_bytes: usize,
    stride: usize,
    /// Pattern for every ref handed out (offset filled in per buffer).
    template: Ref,
    template_data: Vec<u8>,
    growth_min: usize,
    max_buffers: Option<usize>,
    scrub_on_free: bool,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create an empty pool; buffers are carved on first allocation.
    pub fn new(heap: Arc<PhysicalHeap>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let payload = round_cache_line(config.buffer_size);
        let lines = next_prime((BUFFER_OVERHEAD_BYTES + payload) >> LOG2_CACHE_LINE_BYTES);
        let stride = lines << LOG2_CACHE_LINE_BYTES;
        let payload_bytes = stride - BUFFER_OVERHEAD_BYTES;

        if REWRITE_BYTES + payload_bytes > u16::MAX as usize {
            return Err(DataplaneError::InvalidConfig("buffer size too large"));
        }
        if stride > heap.max_extent().min(MAX_EXTENT_BYTES) {
            return Err(DataplaneError::InvalidConfig(
                "buffer larger than largest heap extent",
            ));
        }

        let template = Ref::new(
            0,
            REWRITE_BYTES as u16,
            config.template_data.len() as u16,
            config.opaque,
        );

        debug!(
            "pool {}: {} byte buffers, stride {} ({} lines)",
            config.name, payload_bytes, stride, lines
        );

        Ok(Self {
            heap,
            name: config.name,
            payload_bytes,
            stride,
            template,
            template_data: config.template_data,
            growth_min: config.growth_min,
            max_buffers: config.max_buffers,
            scrub_on_free: config.scrub_on_free,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                extents: Vec::new(),
                total: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap(&self) -> &Arc<PhysicalHeap> {
        &self.heap
    }

    /// Payload bytes per buffer.
    pub fn buffer_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Bytes between consecutive buffers.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes of data area (rewrite area plus payload).
    pub fn data_capacity(&self) -> usize {
        REWRITE_BYTES + self.payload_bytes
    }

    /// The ref every allocation starts from (offset zero).
    pub fn template(&self) -> Ref {
        self.template
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            free_buffers: inner.free.len(),
            total_buffers: inner.total,
            buffer_bytes: self.payload_bytes,
            dma_bytes: inner.extents.iter().map(Extent::capacity).sum(),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Allocation
    // ───────────────────────────────────────────────────────────────────────

    /// Allocate `n` refs.
    pub fn allocate_refs(&self, n: usize) -> Result<Vec<Ref>> {
        let mut refs = Vec::with_capacity(n);
        self.allocate_into(&mut refs, n)?;
        Ok(refs)
    }

    /// Append `n` refs to `out`, growing the pool if needed.
    ///
    /// On error nothing is appended.
    pub fn allocate_into(&self, out: &mut Vec<Ref>, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.free.len() < n {
            let need = n - inner.free.len();
            self.grow(&mut inner, need)?;
        }
        self.take(&mut inner, out, n);
        Ok(())
    }

    /// Append as many as `n` refs to `out`, growing as far as possible.
    ///
    /// # Returns
    /// Number of refs appended.
    pub fn allocate_up_to(&self, out: &mut Vec<Ref>, n: usize) -> usize {
        let mut inner = self.inner.lock();
        if inner.free.len() < n {
            let headroom = match self.max_buffers {
                Some(max) => max.saturating_sub(inner.total),
                None => usize::MAX,
            };
            let need = (n - inner.free.len()).min(headroom);
            if need > 0 {
                if let Err(err) = self.grow(&mut inner, need) {
                    trace!("pool {}: growth failed: {}", self.name, err);
                }
            }
        }
        let n = n.min(inner.free.len());
        self.take(&mut inner, out, n);
        n
    }

    /// Append up to `n` already-carved refs to `out`; never touches the heap.
    ///
    /// Safe to call from interrupt context.
    pub fn take_cached(&self, out: &mut Vec<Ref>, n: usize) -> usize {
        let mut inner = self.inner.lock();
        let n = n.min(inner.free.len());
        self.take(&mut inner, out, n);
        n
    }

    fn take(&self, inner: &mut PoolInner, out: &mut Vec<Ref>, n: usize) {
        let start = inner.free.len() - n;
        let first = out.len();
        out.extend(inner.free.drain(start..).rev());
        state::transition(
            self.heap.id(),
            &out[first..],
            BufferState::Free,
            BufferState::Allocated,
        );
    }

    /// Carve at least `need` new buffers.
    fn grow(&self, inner: &mut PoolInner, need: usize) -> Result<()> {
        if let Some(max) = self.max_buffers {
            if inner.total + need > max {
                return Err(DataplaneError::OutOfMemory);
            }
        }
        let cap = MAX_EXTENT_BYTES.min(self.heap.max_extent());

        let mut added = 0;
        while added < need {
            let mut count = (need - added).max(self.growth_min).next_power_of_two();
            if let Some(max) = self.max_buffers {
                count = count.min(max - inner.total);
            }
            while count > 1 && count * self.stride > cap {
                count /= 2;
            }

            let extent = loop {
                match self.heap.alloc(count * self.stride, CACHE_LINE_BYTES) {
                    Ok(extent) => break extent,
                    Err(DmaError::OutOfMemory) if count > 1 => count /= 2,
                    Err(err) => {
                        warn!("pool {}: cannot grow: {}", self.name, err);
                        return Err(err.into());
                    }
                }
            };
            inner.extents.push(extent);
            inner.total += count;

            let first = inner.free.len();
            // Reverse so the lowest buffer is handed out first.
            for i in (0..count).rev() {
                let r = self.template_at((extent.offset() + i * self.stride) as u32);
                self.reset_buffer(&r, 0, true)?;
                inner.free.push(r);
            }
            state::transition(
                self.heap.id(),
                &inner.free[first..],
                BufferState::Unknown,
                BufferState::Free,
            );

            debug!(
                "pool {}: +{} buffers at {:#x} ({} total)",
                self.name,
                count,
                extent.offset(),
                inner.total
            );
            added += count;
        }
        Ok(())
    }

    #[inline]
    fn template_at(&self, offset: u32) -> Ref {
        let mut r = self.template;
        r.offset = offset;
        r
    }

    /// Restore header and data area to the template.
    fn reset_buffer(&self, r: &Ref, save: u32, scrub: bool) -> Result<()> {
        Header::empty(save).store(&self.heap, r.offset)?;
        if scrub {
            self.heap.fill(r.data_area(), self.data_capacity(), 0)?;
        }
        if !self.template_data.is_empty() {
            self.heap
                .write(r.data_area() + REWRITE_BYTES, &self.template_data)?;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Free
    // ───────────────────────────────────────────────────────────────────────

    /// Return refs to the pool.
    ///
    /// # Arguments
    /// - `refs`: buffers to free; cloned buffers only drop a clone count
    /// - `follow_chain`: also free every chained successor
    pub fn free_refs(&self, refs: &[Ref], follow_chain: bool) -> Result<()> {
        let mut chained = Vec::new();
        self.free_batch(refs, follow_chain, &mut chained)?;
        while !chained.is_empty() {
            let batch = core::mem::take(&mut chained);
            self.free_batch(&batch, true, &mut chained)?;
        }
        Ok(())
    }

    fn free_batch(&self, refs: &[Ref], follow_chain: bool, chained: &mut Vec<Ref>) -> Result<()> {
        let heap = &*self.heap;
        let mut recycled = Vec::with_capacity(refs.len());

        let mut quads = refs.chunks_exact(4);
        for quad in quads.by_ref() {
            let headers = [
                Header::load(heap, quad[0].offset)?,
                Header::load(heap, quad[1].offset)?,
                Header::load(heap, quad[2].offset)?,
                Header::load(heap, quad[3].offset)?,
            ];
            let plain = headers.iter().all(|h| h.clone_count == 0)
                && (!follow_chain || quad.iter().all(|r| !r.is_chained()));
            if plain {
                for (r, h) in quad.iter().zip(&headers) {
                    self.reset_buffer(r, h.save, self.scrub_on_free)?;
                    recycled.push(self.template_at(r.offset));
                }
            } else {
                for (r, h) in quad.iter().zip(headers) {
                    self.free_one(r, h, follow_chain, chained, &mut recycled)?;
                }
            }
        }
        for r in quads.remainder() {
            let header = Header::load(heap, r.offset)?;
            self.free_one(r, header, follow_chain, chained, &mut recycled)?;
        }

        state::transition(
            heap.id(),
            &recycled,
            BufferState::Allocated,
            BufferState::Free,
        );
        self.inner.lock().free.extend(recycled);
        Ok(())
    }

    fn free_one(
        &self,
        r: &Ref,
        mut header: Header,
        follow_chain: bool,
        chained: &mut Vec<Ref>,
        recycled: &mut Vec<Ref>,
    ) -> Result<()> {
        if header.clone_count > 0 {
            state::validate(self.heap.id(), core::slice::from_ref(r), BufferState::Allocated);
            header.clone_count -= 1;
            return header.store(&self.heap, r.offset);
        }
        if follow_chain && r.is_chained() {
            chained.push(header.next);
        }
        self.reset_buffer(r, header.save, self.scrub_on_free)?;
        recycled.push(self.template_at(r.offset));
        Ok(())
    }

    /// Share a buffer: bump its clone count and mark both handles CLONED.
    ///
    /// Each handle must be freed; the buffer is recycled by the last one.
    pub fn clone_ref(&self, r: &mut Ref) -> Result<Ref> {
        let mut header = Header::load(&self.heap, r.offset)?;
        header.clone_count += 1;
        header.store(&self.heap, r.offset)?;
        r.flags |= RefFlags::CLONED;
        Ok(*r)
    }

    /// Return every free-listed extent to the heap.
    ///
    /// Fails with `InvalidState` while refs are still outstanding.
    pub fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.free.len() != inner.total {
            warn!(
                "pool {}: teardown with {} buffers outstanding",
                self.name,
                inner.total - inner.free.len()
            );
            return Err(DataplaneError::InvalidState);
        }
        state::transition(
            self.heap.id(),
            &inner.free,
            BufferState::Free,
            BufferState::Unknown,
        );
        inner.free.clear();
        for extent in inner.extents.drain(..) {
            self.heap.free(extent.id())?;
        }
        inner.total = 0;
        debug!("pool {}: torn down", self.name);
        Ok(())
    }

    /// Panic unless every ref is in `expected` state (`validate-state` only).
    #[inline]
    pub fn validate_state(&self, refs: &[Ref], expected: BufferState) {
        state::validate(self.heap.id(), refs, expected);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Data access
    // ───────────────────────────────────────────────────────────────────────

    /// Copy the data window of `r` into `dst`.
    ///
    /// # Returns
    /// Bytes copied (the smaller of `dst.len()` and the data length).
    pub fn read_data(&self, r: &Ref, dst: &mut [u8]) -> Result<usize> {
        r.check_window(self.data_capacity())?;
        let n = dst.len().min(r.data_len() as usize);
        self.heap.read(r.data_start(), &mut dst[..n])?;
        Ok(n)
    }

    /// Replace the data window contents and set its length.
    pub fn write_data(&self, r: &mut Ref, src: &[u8]) -> Result<()> {
        let available = self.data_capacity().saturating_sub(r.data_offset() as usize);
        if src.len() > available {
            return Err(DataplaneError::BufferTooSmall {
                needed: src.len(),
                available,
            });
        }
        self.heap.write(r.data_start(), src)?;
        r.data_len = src.len() as u16;
        Ok(())
    }

    /// Device address of the first data byte.
    pub fn data_physical(&self, r: &Ref) -> Option<u64> {
        self.heap.offset_to_physical(r.data_start())
    }

    /// Gather the data of a whole chain.
    pub fn chain_bytes(&self, head: &Ref) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for link in head.links(&self.heap) {
            let link = link?;
            link.check_window(self.data_capacity())?;
            let start = bytes.len();
            bytes.resize(start + link.data_len() as usize, 0);
            self.heap.read(link.data_start(), &mut bytes[start..])?;
        }
        Ok(bytes)
    }

    /// Driver scratch word of the buffer; survives free.
    pub fn save(&self, r: &Ref) -> Result<u32> {
        Ok(Header::load(&self.heap, r.offset)?.save)
    }

    pub fn set_save(&self, r: &Ref, word: u32) -> Result<()> {
        let mut header = Header::load(&self.heap, r.offset)?;
        header.save = word;
        header.store(&self.heap, r.offset)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("stride", &self.stride)
            .field("stats", &self.stats())
            .finish()
    }
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Smallest prime not below `n`.
fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}
