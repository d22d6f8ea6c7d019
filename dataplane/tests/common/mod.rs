//! Simulated NIC queue for integration tests.
//!
//! The heap uses identity mapping, so every bus address the queues program
//! is also a CPU address inside the heap. The mock "device" plays its part
//! by translating those addresses back to heap offsets.

#![allow(dead_code)]

use std::sync::Arc;

use dma_pool::{PhysMapping, PhysicalHeap};
use morpheus_dataplane::descriptor::e1000::{
    E1000RxDescriptor, E1000TxDescriptor, RXD_STAT_DD, RXD_STAT_EOP, TXD_STAT_DD,
};
use morpheus_dataplane::{BufferPool, PoolConfig, QueueRegisters};
use spin::Mutex;

/// Register file of one queue.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub ring_base: u64,
    pub ring_len: u16,
    pub descriptor_bytes: usize,
    pub tail: u16,
    pub head: u16,
    pub tail_writes: usize,
    pub enabled: bool,
    pub active: bool,
    /// Enable/disable requests are ignored.
    pub stuck: bool,
    pub writeback: Option<u64>,
    pub delayed_us: u64,
}

#[derive(Clone, Default)]
pub struct MockRegisters(pub Arc<Mutex<DeviceState>>);

impl QueueRegisters for MockRegisters {
    fn set_ring_base(&mut self, phys: u64) {
        self.0.lock().ring_base = phys;
    }

    fn set_ring_size(&mut self, descriptors: u16, descriptor_bytes: usize) {
        let mut state = self.0.lock();
        state.ring_len = descriptors;
        state.descriptor_bytes = descriptor_bytes;
    }

    fn head(&self) -> u16 {
        self.0.lock().head
    }

    fn set_tail(&mut self, index: u16, _slot_phys: u64) {
        let mut state = self.0.lock();
        state.tail = index;
        state.tail_writes += 1;
    }

    fn set_enabled(&mut self, enabled: bool) {
        let mut state = self.0.lock();
        state.enabled = enabled;
        if !state.stuck {
            state.active = enabled;
        }
    }

    fn is_active(&self) -> bool {
        self.0.lock().active
    }

    fn set_head_writeback(&mut self, phys: Option<u64>) {
        self.0.lock().writeback = phys;
    }

    fn delay_us(&mut self, us: u32) {
        self.0.lock().delayed_us += u64::from(us);
    }
}

pub fn heap(size: usize) -> Arc<PhysicalHeap> {
    Arc::new(
        PhysicalHeap::builder()
            .owned_region(size, PhysMapping::Identity)
            .build()
            .unwrap(),
    )
}

pub fn pool(buffer_size: usize, max_buffers: Option<usize>) -> Arc<BufferPool> {
    let mut config = PoolConfig::new("test", buffer_size);
    config.max_buffers = max_buffers;
    Arc::new(BufferPool::new(heap(1 << 20), config).unwrap())
}

/// The device side of one queue.
pub struct MockNic {
    pub heap: Arc<PhysicalHeap>,
    pub regs: MockRegisters,
}

impl MockNic {
    pub fn new(heap: Arc<PhysicalHeap>) -> Self {
        Self {
            heap,
            regs: MockRegisters::default(),
        }
    }

    pub fn state(&self) -> spin::MutexGuard<'_, DeviceState> {
        self.regs.0.lock()
    }

    fn offset_of(&self, phys: u64) -> usize {
        self.heap
            .pointer_to_offset(phys as usize as *const u8)
            .expect("bus address outside heap")
    }

    fn descriptor_offset(&self, slot: u16) -> usize {
        let state = self.state();
        assert!(slot < state.ring_len, "slot {} beyond ring", slot);
        self.offset_of(state.ring_base + slot as u64 * state.descriptor_bytes as u64)
    }

    pub fn rx_descriptor(&self, slot: u16) -> E1000RxDescriptor {
        let offset = self.descriptor_offset(slot);
        unsafe { self.heap.read_volatile(offset).unwrap() }
    }

    pub fn tx_descriptor(&self, slot: u16) -> E1000TxDescriptor {
        let offset = self.descriptor_offset(slot);
        unsafe { self.heap.read_volatile(offset).unwrap() }
    }

    /// DMA `payload` into the buffer armed at `slot` and write back.
    pub fn receive(&self, slot: u16, payload: &[u8], status: u8, errors: u8) {
        let offset = self.descriptor_offset(slot);
        let mut desc: E1000RxDescriptor = unsafe { self.heap.read_volatile(offset).unwrap() };
        assert_eq!(desc.status & RXD_STAT_DD, 0, "slot {} already written back", slot);
        assert_ne!(desc.addr, 0, "slot {} not armed", slot);
        self.heap.write(self.offset_of(desc.addr), payload).unwrap();
        desc.length = payload.len() as u16;
        desc.status = status | RXD_STAT_DD;
        desc.errors = errors;
        unsafe { self.heap.write_volatile(offset, desc).unwrap() };
    }

    /// Single-buffer frame with extra status bits.
    pub fn receive_frame(&self, slot: u16, payload: &[u8], status: u8) {
        self.receive(slot, payload, status | RXD_STAT_EOP, 0);
    }

    /// Mark a transmit descriptor done.
    pub fn complete_tx(&self, slot: u16) {
        let offset = self.descriptor_offset(slot);
        let mut desc: E1000TxDescriptor = unsafe { self.heap.read_volatile(offset).unwrap() };
        desc.status |= TXD_STAT_DD;
        unsafe { self.heap.write_volatile(offset, desc).unwrap() };
    }

    /// Bytes of the buffer a transmit descriptor points at.
    pub fn tx_payload(&self, slot: u16) -> Vec<u8> {
        let desc = self.tx_descriptor(slot);
        let mut bytes = vec![0u8; desc.length as usize];
        self.heap.read(self.offset_of(desc.addr), &mut bytes).unwrap();
        bytes
    }

    /// DMA the head index into the write-back word.
    pub fn write_back_head(&self, head: u16) {
        let phys = self.state().writeback.expect("no write-back address");
        let offset = self.offset_of(phys);
        unsafe { self.heap.write_volatile(offset, head as u32).unwrap() };
    }
}

/// Frame with a recognizable pattern.
pub fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}
