//! Packet hand-off to the next stage.
//!
//! Packets headed for the currently cached stage are batched and delivered
//! together at the end of a drain. Packets for any other stage go out one
//! at a time; once four in a row pick the same other stage, the pending
//! batch is flushed and that stage becomes the cached one. Order is kept
//! per stage, not across stages.

use alloc::vec::Vec;

use super::classify::NextStage;
use crate::buffer::Ref;
use crate::descriptor::RxFlags;

/// Consecutive misses to one stage before it becomes the cached stage.
pub const SWITCH_AFTER_MISSES: u8 = 4;

/// A received packet. The sink owns `head` (and its chain) from delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxPacket {
    pub head: Ref,
    /// Bytes written by the device over all buffers.
    pub len: usize,
    pub flags: RxFlags,
}

/// Receiver of classified packets.
pub trait RxSink {
    fn deliver(&mut self, stage: NextStage, packets: &[RxPacket]);

    /// Packets the sink can still accept in this drain.
    fn room(&self) -> usize {
        usize::MAX
    }
}

/// Sink collecting packets in arrival order.
#[derive(Debug, Default)]
pub struct RxFrames {
    pub frames: Vec<(NextStage, RxPacket)>,
    /// Refuse packets beyond this many held.
    pub limit: Option<usize>,
    /// Number of `deliver` calls.
    pub deliveries: usize,
}

impl RxFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Head refs of every collected packet, for freeing.
    pub fn heads(&self) -> Vec<Ref> {
        self.frames.iter().map(|(_, p)| p.head).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl RxSink for RxFrames {
    fn deliver(&mut self, stage: NextStage, packets: &[RxPacket]) {
        self.deliveries += 1;
        self.frames.extend(packets.iter().map(|p| (stage, *p)));
    }

    fn room(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.frames.len()),
            None => usize::MAX,
        }
    }
}

/// Per-queue stage cache.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    stage: NextStage,
    pending: Vec<RxPacket>,
    miss_stage: NextStage,
    misses: u8,
    pub(crate) switches: u64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            stage: NextStage::EthernetInput,
            pending: Vec::new(),
            miss_stage: NextStage::EthernetInput,
            misses: 0,
            switches: 0,
        }
    }

    pub(crate) fn stage(&self) -> NextStage {
        self.stage
    }

    pub(crate) fn push<S: RxSink>(&mut self, sink: &mut S, stage: NextStage, packet: RxPacket) {
        if stage == self.stage {
            self.pending.push(packet);
            self.misses = 0;
            return;
        }

        sink.deliver(stage, core::slice::from_ref(&packet));
        if stage == self.miss_stage {
            self.misses += 1;
        } else {
            self.miss_stage = stage;
            self.misses = 1;
        }
        if self.misses >= SWITCH_AFTER_MISSES {
            self.flush(sink);
            self.stage = stage;
            self.misses = 0;
            self.switches += 1;
        }
    }

    /// Four packets for one stage.
    pub(crate) fn push4<S: RxSink>(&mut self, sink: &mut S, stage: NextStage, packets: [RxPacket; 4]) {
        if stage == self.stage {
            self.pending.extend_from_slice(&packets);
            self.misses = 0;
        } else {
            for packet in packets {
                self.push(sink, stage, packet);
            }
        }
    }

    pub(crate) fn flush<S: RxSink>(&mut self, sink: &mut S) {
        if !self.pending.is_empty() {
            sink.deliver(self.stage, &self.pending);
            self.pending.clear();
        }
    }
}
