//! Generic DMA descriptor ring.
//!
//! # Indices
//!
//! ```text
//!        head                    tail
//!         ▼                       ▼
//!  ┌───┬───┬───┬───┬───┬───┬───┬───┐
//!  │   │ H │ H │ H │ H │ H │ H │   │   H = published, device-owned
//!  └───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! `head` is the next slot software inspects, `tail` one past the last slot
//! published to the device. One slot always stays unpublished so that
//! `head == tail` means empty: at most N-1 slots are outstanding.
//!
//! # State Machine
//! ```text
//!   IDLE ──arm()──> ARMED ──first completion──> RUNNING
//!                     ▲                            │
//!                     └────arm()──── HALTED <─stop()┘
//! ```
//!
//! Each slot has a shadow entry holding the [`Ref`] the device is working
//! on, so buffers never have to be recovered from descriptor addresses.

mod registers;

pub use registers::QueueRegisters;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem::size_of;

use dma_pool::{DmaError, Extent, PhysicalHeap};
use log::{trace, warn};

use crate::barriers::{lfence, mfence, sfence};
use crate::buffer::Ref;
use crate::config::{RingConfig, WrapPolicy};
use crate::descriptor::Descriptor;
use crate::error::{DataplaneError, Result};

/// Alignment of descriptor memory.
pub const RING_ALIGN: usize = 128;

/// Ring life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Idle,
    Armed,
    Running,
    Halted,
}

/// Why a drain returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// Caller's batch limit reached.
    BatchLimit,
    /// Next slot still belongs to the device (or nothing is outstanding).
    HardwareOwned,
    /// Handler could not take more slots.
    Backpressure,
    /// Reached the end of the ring under [`WrapPolicy::Defer`].
    Wrap,
}

/// Result of one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: usize,
    pub stop: DrainStop,
}

/// Snapshot of ring indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub head: u16,
    pub tail: u16,
    pub outstanding: u16,
    pub state: RingState,
}

/// Consumer of completed slots during [`DescriptorRing::drain`].
pub trait SlotHandler<D: Descriptor> {
    /// Slot has been handed back by the device.
    fn is_done(&self, slot: u16, desc: &D) -> bool;

    /// Prepare to consume up to `n` slots.
    ///
    /// # Returns
    /// How many slots may be consumed now; 0 means backpressure.
    fn reserve(&mut self, n: usize) -> usize;

    /// Consume one completed slot. Head has already moved past it.
    fn complete(&mut self, ring: &mut DescriptorRing<D>, slot: u16, desc: D) -> Result<()>;

    /// Consume four consecutive completed slots.
    fn complete4(&mut self, ring: &mut DescriptorRing<D>, first: u16, descs: [D; 4]) -> Result<()> {
        for (i, desc) in descs.into_iter().enumerate() {
            self.complete(ring, first + i as u16, desc)?;
        }
        Ok(())
    }
}

/// Descriptor array in heap memory plus software indices.
pub struct DescriptorRing<D: Descriptor> {
    heap: Arc<PhysicalHeap>,
    extent: Option<Extent>,
    len: u16,
    reload_slot: bool,
    head: u16,
    tail: u16,
    state: RingState,
    slots: Vec<Option<Ref>>,
    _desc: PhantomData<D>,
}

impl<D: Descriptor> DescriptorRing<D> {
    /// Allocate and zero descriptor memory for `config.len` slots.
    pub fn new(heap: Arc<PhysicalHeap>, config: &RingConfig) -> Result<Self> {
        config.validate()?;
        let physical = config.len as usize + usize::from(config.reload_slot);
        let extent = heap.alloc(physical * size_of::<D>(), RING_ALIGN)?;
        heap.fill(extent.offset(), extent.capacity(), 0)?;

        let mut ring = Self {
            heap,
            extent: Some(extent),
            len: config.len,
            reload_slot: config.reload_slot,
            head: 0,
            tail: 0,
            state: RingState::Idle,
            slots: (0..config.len).map(|_| None).collect(),
            _desc: PhantomData,
        };

        if config.reload_slot {
            let target = ring.slot_physical(0)?;
            let reload = D::reload(target).ok_or(DataplaneError::InvalidConfig(
                "descriptor format has no reload form",
            ))?;
            ring.write(config.len, reload)?;
        }
        Ok(ring)
    }

    /// Number of usable slots (N).
    #[inline]
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Descriptors in memory, including the reload slot.
    #[inline]
    pub fn physical_len(&self) -> u16 {
        self.len + u16::from(self.reload_slot)
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.tail
    }

    #[inline]
    pub fn state(&self) -> RingState {
        self.state
    }

    /// Published slots not yet reclaimed.
    #[inline]
    pub fn outstanding(&self) -> u16 {
        ((self.tail as u32 + self.len as u32 - self.head as u32) % self.len as u32) as u16
    }

    /// Slots that can still be published.
    #[inline]
    pub fn free_slots(&self) -> u16 {
        self.len - 1 - self.outstanding()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn status(&self) -> RingStatus {
        RingStatus {
            head: self.head,
            tail: self.tail,
            outstanding: self.outstanding(),
            state: self.state,
        }
    }

    pub fn heap(&self) -> &Arc<PhysicalHeap> {
        &self.heap
    }

    #[inline]
    fn next_index(&self, index: u16, n: u16) -> u16 {
        ((index as u32 + n as u32) % self.len as u32) as u16
    }

    fn extent(&self) -> Result<&Extent> {
        self.extent.as_ref().ok_or(DataplaneError::InvalidState)
    }

    #[inline]
    fn desc_offset(&self, slot: u16) -> Result<usize> {
        debug_assert!(slot < self.physical_len());
        Ok(self.extent()?.offset() + slot as usize * size_of::<D>())
    }

    /// Bus address of descriptor 0.
    pub fn base_physical(&self) -> Result<u64> {
        self.slot_physical(0)
    }

    /// Bus address of a descriptor.
    pub fn slot_physical(&self, slot: u16) -> Result<u64> {
        let offset = self.desc_offset(slot)?;
        self.heap
            .offset_to_physical(offset)
            .ok_or(DataplaneError::Dma(DmaError::OutOfBounds))
    }

    /// Volatile read of a descriptor.
    #[inline]
    pub fn read(&self, slot: u16) -> Result<D> {
        let offset = self.desc_offset(slot)?;
        // SAFETY: `Descriptor` types are POD; the extent is RING_ALIGN
        // aligned and slots are whole descriptors apart.
        Ok(unsafe { self.heap.read_volatile::<D>(offset)? })
    }

    /// Volatile write of a descriptor.
    #[inline]
    pub fn write(&self, slot: u16, desc: D) -> Result<()> {
        let offset = self.desc_offset(slot)?;
        // SAFETY: as in `read`; the device only reads descriptors we publish.
        unsafe { self.heap.write_volatile(offset, desc)? };
        Ok(())
    }

    /// Buffer parked in a slot.
    pub fn slot_ref(&self, slot: u16) -> Option<&Ref> {
        self.slots.get(slot as usize)?.as_ref()
    }

    /// Remove the buffer parked in a slot.
    pub fn take_ref(&mut self, slot: u16) -> Option<Ref> {
        self.slots.get_mut(slot as usize)?.take()
    }

    /// Write `desc` at the tail, park `r` there and advance the tail.
    ///
    /// Not visible to the device until [`publish`](Self::publish).
    pub fn push(&mut self, desc: D, r: Option<Ref>) -> Result<u16> {
        if self.free_slots() == 0 {
            return Err(DataplaneError::InvalidState);
        }
        let slot = self.tail;
        self.write(slot, desc)?;
        self.slots[slot as usize] = r;
        self.tail = self.next_index(slot, 1);
        Ok(slot)
    }

    /// Barrier, then hand everything before `tail` to the device.
    pub fn publish<R: QueueRegisters>(&self, regs: &mut R) -> Result<()> {
        let slot_phys = self.slot_physical(self.tail)?;
        sfence();
        regs.set_tail(self.tail, slot_phys);
        Ok(())
    }

    /// Point the device at this ring.
    pub fn program<R: QueueRegisters>(&self, regs: &mut R) -> Result<()> {
        regs.set_ring_base(self.base_physical()?);
        regs.set_ring_size(self.physical_len(), size_of::<D>());
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // State transitions
    // ───────────────────────────────────────────────────────────────────────

    /// Idle/Halted → Armed. Resets indices; slots must be empty.
    pub fn arm(&mut self) -> Result<()> {
        match self.state {
            RingState::Idle | RingState::Halted => {
                if self.slots.iter().any(Option::is_some) {
                    return Err(DataplaneError::InvalidState);
                }
                self.head = 0;
                self.tail = 0;
                self.state = RingState::Armed;
                Ok(())
            }
            _ => Err(DataplaneError::InvalidState),
        }
    }

    /// Disable the queue and wait for the device to go idle.
    pub fn stop<R: QueueRegisters>(&mut self, regs: &mut R, config: &RingConfig) -> Result<()> {
        if self.state == RingState::Idle || self.state == RingState::Halted {
            return Ok(());
        }
        regs.set_enabled(false);
        mfence();
        wait_for(regs, false, "stop", config)?;
        self.state = RingState::Halted;
        Ok(())
    }

    /// Take every parked buffer out of the ring.
    pub fn take_all_refs(&mut self) -> Vec<Ref> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Release descriptor memory. The ring is unusable afterwards.
    pub fn teardown(&mut self) -> Result<()> {
        if matches!(self.state, RingState::Armed | RingState::Running) {
            return Err(DataplaneError::InvalidState);
        }
        if let Some(extent) = self.extent.take() {
            self.heap.free(extent.id())?;
        }
        self.state = RingState::Idle;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Drain
    // ───────────────────────────────────────────────────────────────────────

    fn consume(&mut self, n: u16) {
        self.head = self.next_index(self.head, n);
        if self.state == RingState::Armed {
            self.state = RingState::Running;
        }
    }

    /// Hand completed slots, oldest first, to `handler`.
    ///
    /// Inspects at most `limit` slots: four at a time while all four are
    /// done and the handler has room, one at a time otherwise.
    pub fn drain<H: SlotHandler<D>>(
        &mut self,
        limit: usize,
        wrap: WrapPolicy,
        handler: &mut H,
    ) -> Result<DrainReport> {
        let start = self.head;
        let mut drained = 0usize;
        let mut pending = self.outstanding() as usize;

        let stop = loop {
            if drained >= limit {
                break DrainStop::BatchLimit;
            }
            if pending == 0 {
                break DrainStop::HardwareOwned;
            }
            let head = self.head;

            if limit - drained >= 4 && pending >= 4 && head as usize + 4 <= self.len as usize {
                let descs = [
                    self.read(head)?,
                    self.read(head + 1)?,
                    self.read(head + 2)?,
                    self.read(head + 3)?,
                ];
                let all_done = descs
                    .iter()
                    .enumerate()
                    .all(|(i, d)| handler.is_done(head + i as u16, d));
                if all_done && handler.reserve(4) >= 4 {
                    lfence();
                    let descs = [
                        self.read(head)?,
                        self.read(head + 1)?,
                        self.read(head + 2)?,
                        self.read(head + 3)?,
                    ];
                    self.consume(4);
                    handler.complete4(self, head, descs)?;
                    drained += 4;
                    pending -= 4;
                    if self.head == 0 && wrap == WrapPolicy::Defer {
                        break DrainStop::Wrap;
                    }
                    continue;
                }
            }

            let desc = self.read(head)?;
            if !handler.is_done(head, &desc) {
                break DrainStop::HardwareOwned;
            }
            if handler.reserve(1) == 0 {
                break DrainStop::Backpressure;
            }
            lfence();
            let desc = self.read(head)?;
            self.consume(1);
            handler.complete(self, head, desc)?;
            drained += 1;
            pending -= 1;
            if self.head == 0 && wrap == WrapPolicy::Defer {
                break DrainStop::Wrap;
            }
        };

        if drained > 0 {
            trace!(
                "ring drain: head {} -> {}, tail {}, {} done, {:?}",
                start,
                self.head,
                self.tail,
                drained,
                stop
            );
        }
        Ok(DrainReport { drained, stop })
    }
}

impl<D: Descriptor> Drop for DescriptorRing<D> {
    fn drop(&mut self) {
        if let Some(extent) = self.extent.take() {
            let _ = self.heap.free(extent.id());
        }
    }
}

/// Poll `is_active` until it reads `active`.
pub(crate) fn wait_for<R: QueueRegisters>(
    regs: &mut R,
    active: bool,
    transition: &'static str,
    config: &RingConfig,
) -> Result<()> {
    let mut waited_us = 0u32;
    loop {
        if regs.is_active() == active {
            return Ok(());
        }
        if waited_us >= config.stop_timeout_us {
            warn!("queue {} timed out after {}us", transition, waited_us);
            return Err(DataplaneError::HardwareTimeout {
                transition,
                waited_us,
            });
        }
        regs.delay_us(config.poll_interval_us);
        waited_us = waited_us.saturating_add(config.poll_interval_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::e1000::{E1000RxDescriptor, RXD_STAT_DD};
    use crate::descriptor::RxDescriptor;
    use dma_pool::PhysMapping;

    fn heap() -> Arc<PhysicalHeap> {
        Arc::new(
            PhysicalHeap::builder()
                .owned_region(64 * 1024, PhysMapping::Identity)
                .build()
                .unwrap(),
        )
    }

    /// Counts completions; refuses after `room` slots.
    struct Counter {
        room: usize,
        seen: Vec<u16>,
    }

    impl SlotHandler<E1000RxDescriptor> for Counter {
        fn is_done(&self, _slot: u16, desc: &E1000RxDescriptor) -> bool {
            desc.is_done()
        }

        fn reserve(&mut self, n: usize) -> usize {
            n.min(self.room - self.seen.len())
        }

        fn complete(
            &mut self,
            _ring: &mut DescriptorRing<E1000RxDescriptor>,
            slot: u16,
            _desc: E1000RxDescriptor,
        ) -> Result<()> {
            self.seen.push(slot);
            Ok(())
        }
    }

    fn armed_ring(len: u16) -> DescriptorRing<E1000RxDescriptor> {
        let mut ring = DescriptorRing::new(heap(), &RingConfig::new(len)).unwrap();
        ring.arm().unwrap();
        for i in 0..len - 1 {
            ring.push(E1000RxDescriptor::armed(0x1000 * i as u64), None)
                .unwrap();
        }
        ring
    }

    fn complete(ring: &DescriptorRing<E1000RxDescriptor>, slot: u16) {
        let mut desc = ring.read(slot).unwrap();
        desc.status |= RXD_STAT_DD;
        ring.write(slot, desc).unwrap();
    }

    #[test]
    fn test_capacity_is_len_minus_one() {
        let mut ring = armed_ring(8);
        assert_eq!(ring.outstanding(), 7);
        assert_eq!(ring.free_slots(), 0);
        assert_eq!(
            ring.push(E1000RxDescriptor::default(), None),
            Err(DataplaneError::InvalidState)
        );
    }

    #[test]
    fn test_idle_drain_is_noop() {
        let mut ring = armed_ring(8);
        let mut counter = Counter {
            room: 100,
            seen: Vec::new(),
        };
        for _ in 0..2 {
            let report = ring.drain(64, WrapPolicy::Continue, &mut counter).unwrap();
            assert_eq!(report.drained, 0);
            assert_eq!(report.stop, DrainStop::HardwareOwned);
        }
        assert_eq!(ring.status().head, 0);
        assert_eq!(ring.state(), RingState::Armed);
    }

    #[test]
    fn test_drain_four_then_one() {
        let mut ring = armed_ring(8);
        for slot in 0..5 {
            complete(&ring, slot);
        }
        let mut counter = Counter {
            room: 100,
            seen: Vec::new(),
        };
        let report = ring.drain(64, WrapPolicy::Continue, &mut counter).unwrap();
        assert_eq!(report.drained, 5);
        assert_eq!(report.stop, DrainStop::HardwareOwned);
        assert_eq!(counter.seen, [0, 1, 2, 3, 4]);
        assert_eq!(ring.head(), 5);
        assert_eq!(ring.state(), RingState::Running);
    }

    #[test]
    fn test_drain_stops_on_limit_and_backpressure() {
        let mut ring = armed_ring(8);
        for slot in 0..6 {
            complete(&ring, slot);
        }
        let mut counter = Counter {
            room: 100,
            seen: Vec::new(),
        };
        let report = ring.drain(2, WrapPolicy::Continue, &mut counter).unwrap();
        assert_eq!(report, DrainReport { drained: 2, stop: DrainStop::BatchLimit });

        counter.room = 3;
        let report = ring.drain(64, WrapPolicy::Continue, &mut counter).unwrap();
        assert_eq!(report, DrainReport { drained: 1, stop: DrainStop::Backpressure });
        assert_eq!(ring.head(), 3);
    }

    #[test]
    fn test_reload_requires_descriptor_support() {
        let mut config = RingConfig::new(8);
        config.reload_slot = true;
        assert_eq!(
            DescriptorRing::<E1000RxDescriptor>::new(heap(), &config).err(),
            Some(DataplaneError::InvalidConfig(
                "descriptor format has no reload form"
            ))
        );
    }

    #[test]
    fn test_teardown_frees_descriptor_memory() {
        let heap = heap();
        let mut ring =
            DescriptorRing::<E1000RxDescriptor>::new(heap.clone(), &RingConfig::new(8)).unwrap();
        assert_eq!(heap.stats().used, 128);
        ring.teardown().unwrap();
        assert_eq!(heap.stats().used, 0);
        assert_eq!(ring.read(0), Err(DataplaneError::InvalidState));
    }
}
