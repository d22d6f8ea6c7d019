//! Packet buffers and descriptor rings for MorpheusX NIC drivers.
//!
//! # Layers
//!
//! ```text
//!  RxQueue / TxQueue        arm, poll, submit, reclaim, stop
//!        │
//!  DescriptorRing<D>        head/tail, shadow refs, 4-wide drain
//!        │
//!  BufferPool               prime-stride buffers, LIFO free list, chains
//!        │
//!  dma_pool::PhysicalHeap   offsets ↔ pointers ↔ bus addresses
//! ```
//!
//! Buffers are named by [`Ref`]s: heap offset plus a data window. A ref is
//! owned by exactly one party at a time (pool, ring slot, caller) and moves
//! between them by value.
//!
//! # Usage
//!
//! ```ignore
//! let heap = Arc::new(PhysicalHeap::builder()
//!     .owned_region(4 << 20, PhysMapping::Identity)
//!     .build()?);
//! let pool = Arc::new(BufferPool::new(heap, PoolConfig::new("rx", 2048))?);
//! let rx: RxQueue<E1000RxDescriptor, _> = RxQueue::new(pool, regs, RxConfig::new(256))?;
//! rx.arm()?;
//! let mut frames = RxFrames::new();
//! rx.poll(&mut frames)?;
//! ```

#![no_std]

extern crate alloc;

pub mod barriers;
pub mod buffer;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod ring;
pub mod rx;
pub mod tx;

pub use buffer::{
    BufferPool, BufferState, PoolStats, Ref, RefChain, RefFlags, RefOpaque, BUFFER_HEADER_BYTES,
    BUFFER_OVERHEAD_BYTES, REWRITE_BYTES,
};
pub use config::{PoolConfig, ReclaimMode, RingConfig, RxConfig, TxConfig, WrapPolicy};
pub use descriptor::{Descriptor, RxDescriptor, RxFlags, TxDescriptor};
pub use error::{DataplaneError, Result};
pub use ring::{
    DescriptorRing, DrainReport, DrainStop, QueueRegisters, RingState, RingStatus, SlotHandler,
};
pub use rx::{
    Classifier, DefaultClassifier, Disposition, NextStage, PollOutcome, RxFrames, RxPacket,
    RxQueue, RxSink, RxStats,
};
pub use tx::{TxQueue, TxStats};
