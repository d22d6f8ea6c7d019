//! Hardware descriptor abstraction.
//!
//! A ring only needs a handful of facts about a descriptor: how to build
//! one that hands a buffer to the device, and how to tell that the device
//! handed it back. Chip drivers implement these traits over their own
//! `#[repr(C)]` layouts; [`e1000`] has the legacy Intel formats.

pub mod e1000;

use bitflags::bitflags;

bitflags! {
    /// Chip-independent receive status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxFlags: u32 {
        /// IPv4 header checksum verified by hardware.
        const IP4_CHECKSUMMED = 1 << 0;
        /// IPv4 header checksum wrong.
        const IP4_INVALID_CHECKSUM = 1 << 1;
        const IP6 = 1 << 2;
        /// L4 checksum verified by hardware.
        const L4_CHECKSUMMED = 1 << 3;
        const L4_INVALID_CHECKSUM = 1 << 4;
        /// One VLAN tag present.
        const VLAN = 1 << 5;
        /// Two VLAN tags present.
        const DOUBLE_VLAN = 1 << 6;
        /// Frame matched a layer 2 ethertype filter (index in LAYER2_TYPE).
        const LAYER2 = 1 << 7;
        /// Frame-level receive error (CRC, symbol, length).
        const FRAME_ERROR = 1 << 8;
        /// Layer 2 filter index.
        const LAYER2_TYPE = 0x7 << 16;
    }
}

/// Number of layer 2 filter indices.
pub const LAYER2_TYPES: usize = 8;

impl RxFlags {
    /// Layer 2 filter index, meaningful with [`RxFlags::LAYER2`].
    #[inline]
    pub fn layer2_type(self) -> usize {
        ((self.bits() & Self::LAYER2_TYPE.bits()) >> 16) as usize
    }

    /// Flags for a layer 2 filter match.
    pub fn with_layer2_type(index: usize) -> Self {
        let index = (index % LAYER2_TYPES) as u32;
        Self::LAYER2 | Self::from_bits_retain(index << 16)
    }
}

/// Marker for plain-old-data descriptor layouts.
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or `transparent`), contain no
/// pointers or padding-dependent invariants, and be valid for any bit
/// pattern the device may write.
pub unsafe trait Descriptor: Copy + Default {
    /// Descriptor that makes the device jump back to `target` (the bus
    /// address of slot 0), if the format has one.
    fn reload(_target: u64) -> Option<Self> {
        None
    }
}

/// Receive descriptor.
pub trait RxDescriptor: Descriptor {
    /// Descriptor handing a buffer at `buffer_phys` to the device.
    fn armed(buffer_phys: u64) -> Self;

    /// Device has written this descriptor back.
    fn is_done(&self) -> bool;

    /// Bytes written into the buffer.
    fn byte_count(&self) -> u16;

    fn flags(&self) -> RxFlags;

    fn is_end_of_packet(&self) -> bool;

    /// Sanity check of a written-back descriptor (debug builds only).
    fn is_consistent(&self) -> bool {
        true
    }
}

/// Transmit descriptor.
pub trait TxDescriptor: Descriptor {
    /// Descriptor sending `len` bytes at `buffer_phys`.
    fn transmit(buffer_phys: u64, len: u16, end_of_packet: bool) -> Self;

    /// Ask the device to report completion of this descriptor.
    fn request_status(&mut self);

    /// Device has reported completion.
    fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer2_type_field() {
        let flags = RxFlags::with_layer2_type(5) | RxFlags::VLAN;
        assert!(flags.contains(RxFlags::LAYER2));
        assert_eq!(flags.layer2_type(), 5);
        assert_eq!(RxFlags::IP6.layer2_type(), 0);
    }
}
