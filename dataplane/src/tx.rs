//! Transmit queue.
//!
//! Packets are written one descriptor per buffer; the head ref is parked on
//! the packet's last slot and handed back by reclaim once the device is done
//! with every descriptor up to it. Only the last descriptor of each submit
//! batch asks for status.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use dma_pool::{DmaError, Extent, CACHE_LINE_BYTES};
use log::{debug, trace};
use spin::Mutex;

use crate::barriers::lfence;
use crate::buffer::{BufferPool, Ref};
use crate::config::{ReclaimMode, TxConfig, WrapPolicy};
use crate::descriptor::TxDescriptor;
use crate::error::{DataplaneError, Result};
use crate::ring::{wait_for, DescriptorRing, QueueRegisters, RingState, RingStatus, SlotHandler};

/// Transmit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxStats {
    /// Packets accepted by submit.
    pub packets: u64,
    pub descriptors: u64,
    pub bytes: u64,
    /// Packets handed back by reclaim.
    pub completed: u64,
    /// Submits that did not fit.
    pub ring_full: u64,
}

impl fmt::Display for TxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets, {} bytes, {} completed, {} ring full",
            self.packets, self.bytes, self.completed, self.ring_full
        )
    }
}

struct TxInner<D: TxDescriptor, R> {
    ring: DescriptorRing<D>,
    regs: R,
    config: TxConfig,
    /// Head write-back word.
    writeback: Option<Extent>,
    /// Slots that requested status, oldest first.
    rs_marks: VecDeque<u16>,
    stats: TxStats,
}

/// Transmit queue over one descriptor ring.
pub struct TxQueue<D: TxDescriptor, R: QueueRegisters> {
    pool: Arc<BufferPool>,
    inner: Mutex<TxInner<D, R>>,
}

impl<D: TxDescriptor, R: QueueRegisters> TxQueue<D, R> {
    pub fn new(pool: Arc<BufferPool>, regs: R, config: TxConfig) -> Result<Self> {
        let ring = DescriptorRing::new(pool.heap().clone(), &config.ring)?;
        Ok(Self {
            pool,
            inner: Mutex::new(TxInner {
                ring,
                regs,
                config,
                writeback: None,
                rs_marks: VecDeque::new(),
                stats: TxStats::default(),
            }),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> TxStats {
        self.inner.lock().stats
    }

    pub fn ring_status(&self) -> RingStatus {
        self.inner.lock().ring.status()
    }

    /// Descriptors that can still be submitted.
    pub fn free_slots(&self) -> u16 {
        self.inner.lock().ring.free_slots()
    }

    /// Program the ring (empty) and start the device.
    pub fn arm(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !matches!(inner.ring.state(), RingState::Idle | RingState::Halted) {
            return Err(DataplaneError::InvalidState);
        }

        let stale = inner.ring.take_all_refs();
        self.pool.free_refs(&stale, true)?;
        inner.rs_marks.clear();
        inner.ring.arm()?;

        let heap = self.pool.heap();
        match inner.config.reclaim {
            ReclaimMode::HeadWriteback => {
                let word = match inner.writeback {
                    Some(extent) => extent,
                    None => {
                        let extent = heap.alloc(CACHE_LINE_BYTES, CACHE_LINE_BYTES)?;
                        inner.writeback = Some(extent);
                        extent
                    }
                };
                heap.fill(word.offset(), word.capacity(), 0)?;
                let phys = heap
                    .offset_to_physical(word.offset())
                    .ok_or(DataplaneError::Dma(DmaError::OutOfBounds))?;
                inner.regs.set_head_writeback(Some(phys));
            }
            ReclaimMode::DescriptorDone | ReclaimMode::HeadRegister => {
                inner.regs.set_head_writeback(None)
            }
        }

        inner.ring.program(&mut inner.regs)?;
        inner.ring.publish(&mut inner.regs)?;
        inner.regs.set_enabled(true);
        wait_for(&mut inner.regs, true, "arm", &inner.config.ring)?;
        debug!(
            "tx queue armed: {} slots, {:?}",
            inner.ring.len(),
            inner.config.reclaim
        );
        Ok(())
    }

    /// Queue packets for transmission.
    ///
    /// Each entry is a packet head; chained buffers take one descriptor
    /// each. Packets are accepted in order, whole, until the ring is full.
    /// Every packet that fits is checked before any descriptor is written,
    /// so an error leaves the ring untouched.
    ///
    /// # Returns
    /// Packets accepted, or `RingFull` with that count if some did not fit.
    /// Accepted packets belong to the queue until reclaimed.
    pub fn submit(&self, packets: &[Ref]) -> Result<usize> {
        if packets.is_empty() {
            return Ok(0);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !matches!(inner.ring.state(), RingState::Armed | RingState::Running) {
            return Err(DataplaneError::InvalidState);
        }

        let heap = self.pool.heap();
        let capacity = self.pool.data_capacity();
        let mut free = inner.ring.free_slots() as usize;
        let mut accepted = 0;
        let mut planned: Vec<(D, Option<Ref>, u16)> = Vec::new();
        let mut links = Vec::new();

        for head in packets {
            links.clear();
            for link in head.links(heap) {
                links.push(link?);
            }
            if links.len() > free {
                break;
            }
            let count = links.len();
            for (i, link) in links.iter().enumerate() {
                link.check_window(capacity)?;
                let phys = self
                    .pool
                    .data_physical(link)
                    .ok_or(DataplaneError::Dma(DmaError::OutOfBounds))?;
                let eop = i + 1 == count;
                let parked = if eop { Some(*head) } else { None };
                planned.push((D::transmit(phys, link.data_len(), eop), parked, link.data_len()));
            }
            free -= count;
            accepted += 1;
        }

        let mut last_slot = None;
        for (desc, parked, len) in planned.iter().copied() {
            last_slot = Some(inner.ring.push(desc, parked)?);
            inner.stats.bytes += u64::from(len);
        }
        inner.stats.descriptors += planned.len() as u64;

        if let Some(slot) = last_slot {
            let mut desc = inner.ring.read(slot)?;
            desc.request_status();
            inner.ring.write(slot, desc)?;
            if inner.config.reclaim == ReclaimMode::DescriptorDone {
                inner.rs_marks.push_back(slot);
            }
            inner.ring.publish(&mut inner.regs)?;
        }
        inner.stats.packets += accepted as u64;

        if accepted < packets.len() {
            inner.stats.ring_full += 1;
            trace!(
                "tx ring full: {} of {} packets accepted",
                accepted,
                packets.len()
            );
            return Err(DataplaneError::RingFull { accepted });
        }
        Ok(accepted)
    }

    /// Free every completed packet (with its chain) back to the pool.
    ///
    /// # Returns
    /// Packets reclaimed.
    pub fn reclaim(&self) -> Result<usize> {
        let mut done = Vec::new();
        let n = self.reclaim_into(&mut done)?;
        self.pool.free_refs(&done, true)?;
        Ok(n)
    }

    /// Move completed packet heads into `out` instead of freeing them.
    pub fn reclaim_into(&self, out: &mut Vec<Ref>) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.ring.state() == RingState::Idle {
            return Ok(0);
        }

        let len = inner.ring.len() as u32;
        let head = inner.ring.head() as u32;
        let completed = match inner.config.reclaim {
            ReclaimMode::HeadWriteback => {
                let word = inner.writeback.ok_or(DataplaneError::InvalidState)?;
                // SAFETY: the word is a live u32-aligned extent owned by this queue.
                let hw = unsafe { self.pool.heap().read_volatile::<u32>(word.offset())? };
                lfence();
                let done = (hw % len + len - head) % len;
                done.min(u32::from(inner.ring.outstanding()))
            }
            ReclaimMode::HeadRegister => {
                let hw = u32::from(inner.regs.head());
                let done = (hw % len + len - head) % len;
                done.min(u32::from(inner.ring.outstanding()))
            }
            ReclaimMode::DescriptorDone => {
                let mut done_to = None;
                while let Some(&mark) = inner.rs_marks.front() {
                    if !inner.ring.read(mark)?.is_done() {
                        break;
                    }
                    done_to = Some(mark as u32);
                    inner.rs_marks.pop_front();
                }
                match done_to {
                    Some(mark) => (mark + 1 + len - head) % len,
                    None => 0,
                }
            }
        };
        if completed == 0 {
            return Ok(0);
        }

        let mut collect = Collect { out, packets: 0 };
        inner
            .ring
            .drain(completed as usize, WrapPolicy::Continue, &mut collect)?;
        let packets = collect.packets;
        inner.stats.completed += packets as u64;
        trace!("tx reclaimed {} packets, head {}", packets, inner.ring.head());
        Ok(packets)
    }

    /// Halt the device and wait for it to go idle.
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.ring.stop(&mut inner.regs, &inner.config.ring)?;
        debug!(
            "tx queue stopped, {} descriptors outstanding",
            inner.ring.outstanding()
        );
        Ok(())
    }

    /// Free unsent packets, the write-back word and the descriptor memory.
    pub fn teardown(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if matches!(inner.ring.state(), RingState::Armed | RingState::Running) {
            return Err(DataplaneError::InvalidState);
        }
        let parked = inner.ring.take_all_refs();
        self.pool.free_refs(&parked, true)?;
        inner.rs_marks.clear();
        if let Some(word) = inner.writeback.take() {
            inner.regs.set_head_writeback(None);
            self.pool.heap().free(word.id())?;
        }
        inner.ring.teardown()?;
        debug!("tx queue torn down, {}", inner.stats);
        Ok(())
    }
}

/// Collects parked heads of slots the device has finished.
struct Collect<'a> {
    out: &'a mut Vec<Ref>,
    packets: usize,
}

impl<'a, D: TxDescriptor> SlotHandler<D> for Collect<'a> {
    /// The caller already bounded the drain by the completed count.
    fn is_done(&self, _slot: u16, _desc: &D) -> bool {
        true
    }

    fn reserve(&mut self, n: usize) -> usize {
        n
    }

    fn complete(&mut self, ring: &mut DescriptorRing<D>, slot: u16, _desc: D) -> Result<()> {
        if let Some(head) = ring.take_ref(slot) {
            self.out.push(head);
            self.packets += 1;
        }
        Ok(())
    }
}
