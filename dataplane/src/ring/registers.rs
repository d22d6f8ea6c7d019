//! Device queue register interface.

/// Per-queue registers a descriptor ring needs from the device layer.
///
/// Implemented by chip drivers over MMIO. Index arguments are ring slots
/// (`0..N`), addresses are bus addresses.
pub trait QueueRegisters {
    /// Program the bus address of descriptor 0.
    fn set_ring_base(&mut self, phys: u64);

    /// Program the ring length.
    ///
    /// # Arguments
    /// - `descriptors`: physical descriptors, including any reload slot
    /// - `descriptor_bytes`: size of one descriptor
    fn set_ring_size(&mut self, descriptors: u16, descriptor_bytes: usize);

    /// Hardware head index.
    fn head(&self) -> u16;

    /// Publish the tail.
    ///
    /// `slot_phys` is the bus address of the tail slot, for devices that
    /// take a halt address instead of an index.
    fn set_tail(&mut self, index: u16, slot_phys: u64);

    /// Request the queue to start (`true`) or halt (`false`).
    fn set_enabled(&mut self, enabled: bool);

    /// Queue is running.
    fn is_active(&self) -> bool;

    /// Program (or clear) the head write-back address.
    fn set_head_writeback(&mut self, _phys: Option<u64>) {}

    /// Busy-wait.
    fn delay_us(&mut self, us: u32);
}
