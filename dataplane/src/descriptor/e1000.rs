//! Legacy e1000/e1000e descriptor formats.
//!
//! # Receive descriptor (16 bytes)
//! ```text
//! 0        8        10       12       13       14
//! ├ addr ──┼ length ┼ csum   ┼ status ┼ errors ┼ special ┤
//! ```
//!
//! # Transmit descriptor (16 bytes)
//! ```text
//! 0        8        10    11    12       13    14
//! ├ addr ──┼ length ┼ cso ┼ cmd ┼ status ┼ css ┼ special ┤
//! ```

use static_assertions::const_assert_eq;

use super::{Descriptor, RxDescriptor, RxFlags, TxDescriptor};

// ═══════════════════════════════════════════════════════════════════════════
// BIT DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// RX status: descriptor done.
pub const RXD_STAT_DD: u8 = 1 << 0;
/// RX status: end of packet.
pub const RXD_STAT_EOP: u8 = 1 << 1;
/// RX status: ignore checksum indication.
pub const RXD_STAT_IXSM: u8 = 1 << 2;
/// RX status: 802.1Q tagged.
pub const RXD_STAT_VP: u8 = 1 << 3;
/// RX status: TCP checksum calculated.
pub const RXD_STAT_TCPCS: u8 = 1 << 5;
/// RX status: IP checksum calculated.
pub const RXD_STAT_IPCS: u8 = 1 << 6;

/// RX error: CRC error.
pub const RXD_ERR_CE: u8 = 1 << 0;
/// RX error: symbol error.
pub const RXD_ERR_SE: u8 = 1 << 1;
/// RX error: sequence error.
pub const RXD_ERR_SEQ: u8 = 1 << 2;
/// RX error: carrier extension error.
pub const RXD_ERR_CXE: u8 = 1 << 4;
/// RX error: TCP/UDP checksum error.
pub const RXD_ERR_TCPE: u8 = 1 << 5;
/// RX error: IP checksum error.
pub const RXD_ERR_IPE: u8 = 1 << 6;
/// RX error: data error.
pub const RXD_ERR_RXE: u8 = 1 << 7;

const RXD_ERR_FRAME: u8 = RXD_ERR_CE | RXD_ERR_SE | RXD_ERR_SEQ | RXD_ERR_CXE | RXD_ERR_RXE;

/// TX command: end of packet.
pub const TXD_CMD_EOP: u8 = 1 << 0;
/// TX command: insert FCS.
pub const TXD_CMD_IFCS: u8 = 1 << 1;
/// TX command: report status.
pub const TXD_CMD_RS: u8 = 1 << 3;

/// TX status: descriptor done.
pub const TXD_STAT_DD: u8 = 1 << 0;

// ═══════════════════════════════════════════════════════════════════════════
// RX
// ═══════════════════════════════════════════════════════════════════════════

/// Legacy receive descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct E1000RxDescriptor {
    pub addr: u64,
    pub length: u16,
    pub checksum: u16,
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

const_assert_eq!(core::mem::size_of::<E1000RxDescriptor>(), 16);

// SAFETY: repr(C), integer fields only, no padding.
unsafe impl Descriptor for E1000RxDescriptor {}

impl RxDescriptor for E1000RxDescriptor {
    fn armed(buffer_phys: u64) -> Self {
        Self {
            addr: buffer_phys,
            ..Self::default()
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.status & RXD_STAT_DD != 0
    }

    #[inline]
    fn byte_count(&self) -> u16 {
        self.length
    }

    fn flags(&self) -> RxFlags {
        let mut flags = RxFlags::empty();
        if self.status & RXD_STAT_IXSM == 0 {
            if self.status & RXD_STAT_IPCS != 0 {
                flags |= RxFlags::IP4_CHECKSUMMED;
            }
            if self.errors & RXD_ERR_IPE != 0 {
                flags |= RxFlags::IP4_INVALID_CHECKSUM;
            }
            if self.status & RXD_STAT_TCPCS != 0 {
                flags |= RxFlags::L4_CHECKSUMMED;
            }
            if self.errors & RXD_ERR_TCPE != 0 {
                flags |= RxFlags::L4_INVALID_CHECKSUM;
            }
        }
        if self.status & RXD_STAT_VP != 0 {
            flags |= RxFlags::VLAN;
        }
        if self.errors & RXD_ERR_FRAME != 0 {
            flags |= RxFlags::FRAME_ERROR;
        }
        flags
    }

    #[inline]
    fn is_end_of_packet(&self) -> bool {
        self.status & RXD_STAT_EOP != 0
    }

    fn is_consistent(&self) -> bool {
        // Written-back descriptors always carry DD with EOP.
        self.status & RXD_STAT_EOP == 0 || self.status & RXD_STAT_DD != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TX
// ═══════════════════════════════════════════════════════════════════════════

/// Legacy transmit descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct E1000TxDescriptor {
    pub addr: u64,
    pub length: u16,
    pub cso: u8,
    pub cmd: u8,
    pub status: u8,
    pub css: u8,
    pub special: u16,
}

const_assert_eq!(core::mem::size_of::<E1000TxDescriptor>(), 16);

// SAFETY: repr(C), integer fields only, no padding.
unsafe impl Descriptor for E1000TxDescriptor {}

impl TxDescriptor for E1000TxDescriptor {
    fn transmit(buffer_phys: u64, len: u16, end_of_packet: bool) -> Self {
        let mut cmd = TXD_CMD_IFCS;
        if end_of_packet {
            cmd |= TXD_CMD_EOP;
        }
        Self {
            addr: buffer_phys,
            length: len,
            cmd,
            ..Self::default()
        }
    }

    #[inline]
    fn request_status(&mut self) {
        self.cmd |= TXD_CMD_RS;
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.status & TXD_STAT_DD != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_flags_decode() {
        let desc = E1000RxDescriptor {
            length: 64,
            status: RXD_STAT_DD | RXD_STAT_EOP | RXD_STAT_IPCS | RXD_STAT_VP,
            ..Default::default()
        };
        assert!(desc.is_done());
        assert!(desc.is_end_of_packet());
        assert_eq!(desc.flags(), RxFlags::IP4_CHECKSUMMED | RxFlags::VLAN);

        let ignored = E1000RxDescriptor {
            status: RXD_STAT_DD | RXD_STAT_IXSM | RXD_STAT_IPCS,
            errors: RXD_ERR_IPE | RXD_ERR_CE,
            ..Default::default()
        };
        assert_eq!(ignored.flags(), RxFlags::FRAME_ERROR);
    }

    #[test]
    fn test_rx_armed_clears_status() {
        let desc = E1000RxDescriptor::armed(0x1234_0000);
        assert_eq!(desc.addr, 0x1234_0000);
        assert!(!desc.is_done());
        assert!(desc.is_consistent());
    }

    #[test]
    fn test_tx_command_bits() {
        let mut desc = E1000TxDescriptor::transmit(0x8000, 60, true);
        assert_eq!(desc.cmd, TXD_CMD_IFCS | TXD_CMD_EOP);
        desc.request_status();
        assert_eq!(desc.cmd & TXD_CMD_RS, TXD_CMD_RS);
        assert!(!desc.is_done());

        let middle = E1000TxDescriptor::transmit(0x9000, 1500, false);
        assert_eq!(middle.cmd & TXD_CMD_EOP, 0);
    }
}
