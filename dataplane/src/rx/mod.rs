//! Receive queue.
//!
//! # Refill
//!
//! Every completed slot is replaced before the packet leaves the queue:
//! the drain moves head past the slot, the filled buffer is detached and a
//! spare buffer is armed at the tail. A completed slot is only consumed
//! when a spare is in hand, so pool exhaustion leaves the descriptor done
//! and the packet in place for the next poll.
//!
//! The ring therefore always holds N-1 armed buffers while running.
//!
//! # Contexts
//!
//! [`RxQueue::poll`] may grow the pool to obtain spares.
//! [`RxQueue::interrupt`] only takes buffers already on the free list.

pub mod classify;
pub mod dispatch;

pub use classify::{
    Classifier, DefaultClassifier, Disposition, NextStage, ETHERNET_HEADER_BYTES,
    RX_ERROR_FRAME, RX_ERROR_IP4_CHECKSUM, RX_ERROR_NONE, VLAN_TAG_BYTES,
};
pub use dispatch::{RxFrames, RxPacket, RxSink, SWITCH_AFTER_MISSES};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use dma_pool::DmaError;
use log::{debug, trace};
use spin::Mutex;

use crate::buffer::{BufferPool, Ref, RefChain, RefOpaque};
use crate::config::RxConfig;
use crate::descriptor::{RxDescriptor, RxFlags};
use crate::error::{DataplaneError, Result};
use crate::ring::{
    wait_for, DescriptorRing, DrainStop, QueueRegisters, RingState, RingStatus, SlotHandler,
};
use dispatch::Dispatcher;

/// Receive counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    /// Packets spanning more than one buffer.
    pub chained: u64,
    /// Packets classified with a nonzero error.
    pub errors: u64,
    /// Drains cut short for lack of spares or sink room.
    pub backpressure: u64,
    /// Cached next-stage changes.
    pub dispatch_switches: u64,
}

impl fmt::Display for RxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets, {} bytes, {} chained, {} errors, {} backpressure",
            self.packets, self.bytes, self.chained, self.errors, self.backpressure
        )
    }
}

/// What a poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Descriptors consumed.
    pub drained: usize,
    pub stop: DrainStop,
    /// More work may be waiting; poll again.
    pub needs_polling: bool,
}

struct RxInner<D: RxDescriptor, R, C> {
    ring: DescriptorRing<D>,
    regs: R,
    classifier: C,
    config: RxConfig,
    /// Packet spanning several descriptors, under assembly.
    chain: RefChain,
    chain_flags: RxFlags,
    /// Buffers obtained for refill but not yet armed.
    spares: Vec<Ref>,
    dispatch: Dispatcher,
    /// Last classification, reused while flags repeat.
    cached: Option<(RxFlags, Disposition)>,
    stats: RxStats,
}

/// Receive queue over one descriptor ring.
pub struct RxQueue<D: RxDescriptor, R: QueueRegisters, C: Classifier = DefaultClassifier> {
    pool: Arc<BufferPool>,
    inner: Mutex<RxInner<D, R, C>>,
}

impl<D: RxDescriptor, R: QueueRegisters> RxQueue<D, R, DefaultClassifier> {
    pub fn new(pool: Arc<BufferPool>, regs: R, config: RxConfig) -> Result<Self> {
        Self::with_classifier(pool, regs, DefaultClassifier::default(), config)
    }
}

impl<D: RxDescriptor, R: QueueRegisters, C: Classifier> RxQueue<D, R, C> {
    /// Create an idle queue; descriptor memory comes from the pool's heap.
    pub fn with_classifier(
        pool: Arc<BufferPool>,
        regs: R,
        classifier: C,
        config: RxConfig,
    ) -> Result<Self> {
        let ring = DescriptorRing::new(pool.heap().clone(), &config.ring)?;
        Ok(Self {
            pool,
            inner: Mutex::new(RxInner {
                ring,
                regs,
                classifier,
                config,
                chain: RefChain::new(),
                chain_flags: RxFlags::empty(),
                spares: Vec::new(),
                dispatch: Dispatcher::new(),
                cached: None,
                stats: RxStats::default(),
            }),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> RxStats {
        let inner = self.inner.lock();
        RxStats {
            dispatch_switches: inner.dispatch.switches,
            ..inner.stats
        }
    }

    pub fn ring_status(&self) -> RingStatus {
        self.inner.lock().ring.status()
    }

    /// Spare buffers held for refill.
    pub fn spare_count(&self) -> usize {
        self.inner.lock().spares.len()
    }

    /// Fill the ring with N-1 buffers and start the device.
    ///
    /// Allowed from Idle or Halted. Buffers left in a halted ring are
    /// returned to the pool first.
    pub fn arm(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !matches!(inner.ring.state(), RingState::Idle | RingState::Halted) {
            return Err(DataplaneError::InvalidState);
        }

        let stale = inner.ring.take_all_refs();
        self.pool.free_refs(&stale, false)?;
        if let Some(head) = inner.chain.done() {
            self.pool.free_refs(&[head], true)?;
        }

        let fill = inner.ring.len() as usize - 1;
        let refs = self.pool.allocate_refs(fill)?;
        let addrs = refs
            .iter()
            .map(|r| self.pool.data_physical(r))
            .collect::<Option<Vec<_>>>();
        let Some(addrs) = addrs else {
            self.pool.free_refs(&refs, false)?;
            return Err(DataplaneError::Dma(DmaError::OutOfBounds));
        };

        inner.ring.arm()?;
        for (r, phys) in refs.into_iter().zip(addrs) {
            inner.ring.push(D::armed(phys), Some(r))?;
        }
        inner.ring.program(&mut inner.regs)?;
        inner.ring.publish(&mut inner.regs)?;
        inner.regs.set_enabled(true);
        wait_for(&mut inner.regs, true, "arm", &inner.config.ring)?;

        debug!(
            "rx queue armed: {} slots, {} buffers from pool {}",
            inner.ring.len(),
            fill,
            self.pool.name()
        );
        Ok(())
    }

    /// Drain completions, allowed to grow the pool for refill.
    pub fn poll<S: RxSink>(&self, sink: &mut S) -> Result<PollOutcome> {
        self.drain(sink, false)
    }

    /// Drain completions using only already-carved buffers.
    pub fn interrupt<S: RxSink>(&self, sink: &mut S) -> Result<PollOutcome> {
        self.drain(sink, true)
    }

    fn drain<S: RxSink>(&self, sink: &mut S, interrupt: bool) -> Result<PollOutcome> {
        let mut guard = self.inner.lock();
        let RxInner {
            ring,
            regs,
            classifier,
            config,
            chain,
            chain_flags,
            spares,
            dispatch,
            cached,
            stats,
        } = &mut *guard;

        if !matches!(ring.state(), RingState::Armed | RingState::Running) {
            return Err(DataplaneError::InvalidState);
        }

        let mut handler = Refill {
            pool: &self.pool,
            interrupt,
            budget: sink.room(),
            classifier: &*classifier,
            interface: config.interface,
            chain,
            chain_flags,
            spares,
            dispatch,
            cached,
            stats: &mut *stats,
            sink: &mut *sink,
        };
        let refilled_from = ring.tail();
        let result = ring.drain(config.ring.batch_limit, config.ring.wrap, &mut handler);
        handler.dispatch.flush(handler.sink);

        // Slots refilled before a failure still go to the device.
        if ring.tail() != refilled_from {
            ring.publish(regs)?;
        }
        let report = result?;
        if report.stop == DrainStop::Backpressure {
            stats.backpressure += 1;
            trace!("rx backpressure at slot {}", ring.head());
        }

        Ok(PollOutcome {
            drained: report.drained,
            stop: report.stop,
            needs_polling: matches!(
                report.stop,
                DrainStop::BatchLimit | DrainStop::Backpressure | DrainStop::Wrap
            ),
        })
    }

    /// Halt the device and wait for it to go idle.
    ///
    /// Buffers stay parked until [`arm`](Self::arm) or
    /// [`teardown`](Self::teardown).
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.ring.stop(&mut inner.regs, &inner.config.ring)?;
        debug!("rx queue stopped at head {}", inner.ring.head());
        Ok(())
    }

    /// Return every buffer and the descriptor memory. Device must be stopped.
    pub fn teardown(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if matches!(inner.ring.state(), RingState::Armed | RingState::Running) {
            return Err(DataplaneError::InvalidState);
        }
        let parked = inner.ring.take_all_refs();
        self.pool.free_refs(&parked, false)?;
        self.pool.free_refs(&inner.spares, false)?;
        inner.spares.clear();
        if let Some(head) = inner.chain.done() {
            self.pool.free_refs(&[head], true)?;
        }
        inner.ring.teardown()?;
        debug!("rx queue torn down, {}", inner.stats);
        Ok(())
    }
}

/// Slot handler for one receive drain.
struct Refill<'a, C, S> {
    pool: &'a BufferPool,
    interrupt: bool,
    /// Slots the sink can still absorb.
    budget: usize,
    classifier: &'a C,
    interface: u32,
    chain: &'a mut RefChain,
    chain_flags: &'a mut RxFlags,
    spares: &'a mut Vec<Ref>,
    dispatch: &'a mut Dispatcher,
    cached: &'a mut Option<(RxFlags, Disposition)>,
    stats: &'a mut RxStats,
    sink: &'a mut S,
}

impl<'a, C: Classifier, S: RxSink> Refill<'a, C, S> {
    fn classify(&mut self, flags: RxFlags) -> Disposition {
        match *self.cached {
            Some((cached_flags, disposition)) if cached_flags == flags => disposition,
            _ => {
                let disposition = self.classifier.classify(flags);
                *self.cached = Some((flags, disposition));
                disposition
            }
        }
    }

    /// Replace `slot` with a spare and detach the filled buffer.
    ///
    /// The spare is armed even when the slot turns out to hold nothing, so
    /// a consumed slot always leaves the ring refilled.
    fn swap<D: RxDescriptor>(&mut self, ring: &mut DescriptorRing<D>, slot: u16) -> Result<Ref> {
        let filled = ring.take_ref(slot);
        let spare = self.spares.pop().ok_or(DataplaneError::InvalidState)?;
        let Some(phys) = self.pool.data_physical(&spare) else {
            self.spares.push(spare);
            return Err(DataplaneError::Dma(DmaError::OutOfBounds));
        };
        ring.push(D::armed(phys), Some(spare))?;
        self.budget = self.budget.saturating_sub(1);
        filled.ok_or(DataplaneError::CorruptDescriptor { slot })
    }

    /// Swap `slot` and vet its write-back. A rejected buffer goes back to
    /// the spares untouched.
    fn take_filled<D: RxDescriptor>(
        &mut self,
        ring: &mut DescriptorRing<D>,
        slot: u16,
        desc: &D,
    ) -> Result<Ref> {
        let filled = self.swap(ring, slot)?;
        if let Err(err) = Self::check(slot, desc) {
            self.spares.push(filled);
            return Err(err);
        }
        Ok(filled)
    }

    /// Stamp a finished packet.
    fn finish(&mut self, mut head: Ref, len: usize, flags: RxFlags, d: Disposition) -> RxPacket {
        head.advance(d.advance.min(i32::from(head.data_len())));
        head.opaque = RefOpaque {
            interface: self.interface,
            error: d.error,
        };
        self.stats.packets += 1;
        self.stats.bytes += len as u64;
        if d.error != RX_ERROR_NONE {
            self.stats.errors += 1;
        }
        RxPacket { head, len, flags }
    }

    fn check<D: RxDescriptor>(slot: u16, desc: &D) -> Result<()> {
        if cfg!(debug_assertions) && !desc.is_consistent() {
            return Err(DataplaneError::CorruptDescriptor { slot });
        }
        Ok(())
    }
}

impl<'a, D: RxDescriptor, C: Classifier, S: RxSink> SlotHandler<D> for Refill<'a, C, S> {
    #[inline]
    fn is_done(&self, _slot: u16, desc: &D) -> bool {
        desc.is_done()
    }

    fn reserve(&mut self, n: usize) -> usize {
        let want = n.min(self.budget);
        if self.spares.len() < want {
            let short = want - self.spares.len();
            if self.interrupt {
                self.pool.take_cached(self.spares, short);
            } else {
                self.pool.allocate_up_to(self.spares, short);
            }
        }
        self.spares.len().min(want)
    }

    fn complete(&mut self, ring: &mut DescriptorRing<D>, slot: u16, desc: D) -> Result<()> {
        let mut filled = self.take_filled(ring, slot, &desc)?;
        filled.set_data_len(desc.byte_count());
        let flags = desc.flags();

        if self.chain.is_empty() && desc.is_end_of_packet() {
            let disposition = self.classify(flags);
            let packet = self.finish(filled, desc.byte_count() as usize, flags, disposition);
            self.dispatch.push(self.sink, disposition.next, packet);
            return Ok(());
        }

        self.chain.append(self.pool.heap(), filled)?;
        *self.chain_flags |= flags & RxFlags::FRAME_ERROR;
        if !desc.is_end_of_packet() {
            return Ok(());
        }

        self.chain.validate(self.pool.heap())?;
        let len = self.chain.total_length();
        let flags = flags | *self.chain_flags;
        *self.chain_flags = RxFlags::empty();
        let head = self.chain.done().ok_or(DataplaneError::CorruptChain)?;
        let disposition = self.classify(flags);
        let packet = self.finish(head, len, flags, disposition);
        self.stats.chained += 1;
        self.dispatch.push(self.sink, disposition.next, packet);
        Ok(())
    }

    fn complete4(&mut self, ring: &mut DescriptorRing<D>, first: u16, descs: [D; 4]) -> Result<()> {
        let fast = match *self.cached {
            Some((flags, _)) => {
                self.chain.is_empty()
                    && descs.iter().enumerate().all(|(i, d)| {
                        d.is_end_of_packet()
                            && d.flags() == flags
                            && Self::check(first + i as u16, d).is_ok()
                    })
            }
            None => false,
        };
        if !fast {
            // All four slots are already consumed: complete each one even
            // if an earlier one fails, then report the first failure.
            let mut result = Ok(());
            for (i, desc) in descs.into_iter().enumerate() {
                let done = self.complete(ring, first + i as u16, desc);
                if result.is_ok() {
                    result = done;
                }
            }
            return result;
        }

        let Some((flags, disposition)) = *self.cached else {
            return Err(DataplaneError::InvalidState);
        };
        let mut packets = [RxPacket {
            head: self.pool.template(),
            len: 0,
            flags,
        }; 4];
        for (i, desc) in descs.iter().enumerate() {
            let mut filled = self.swap(ring, first + i as u16)?;
            filled.set_data_len(desc.byte_count());
            packets[i] = self.finish(filled, desc.byte_count() as usize, flags, disposition);
        }
        self.dispatch.push4(self.sink, disposition.next, packets);
        Ok(())
    }
}
