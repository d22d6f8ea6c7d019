//! Receive classification.
//!
//! Maps hardware status to the next processing stage, the header bytes to
//! skip and an error code. Runs once per packet, or once per run of
//! packets with identical flags.

use crate::descriptor::{RxFlags, LAYER2_TYPES};

/// Ethernet header bytes.
pub const ETHERNET_HEADER_BYTES: i32 = 14;
/// 802.1Q tag bytes.
pub const VLAN_TAG_BYTES: i32 = 4;

/// Packet is good.
pub const RX_ERROR_NONE: u32 = 0;
/// Hardware reported a bad IPv4 header checksum.
pub const RX_ERROR_IP4_CHECKSUM: u32 = 1;
/// Frame-level receive error.
pub const RX_ERROR_FRAME: u32 = 2;

/// Where a received packet goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextStage {
    /// Drop and count.
    Error,
    /// Hand to the slow path.
    Punt,
    /// Full ethernet header parsing.
    EthernetInput,
    /// IPv4, header checksum already verified.
    Ip4InputValidChecksum,
    Ip6Input,
}

/// Classifier verdict for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    pub next: NextStage,
    /// Bytes to advance the data window (headers already handled).
    pub advance: i32,
    pub error: u32,
}

/// Receive flag classifier.
pub trait Classifier {
    fn classify(&self, flags: RxFlags) -> Disposition;
}

impl<F: Fn(RxFlags) -> Disposition> Classifier for F {
    fn classify(&self, flags: RxFlags) -> Disposition {
        self(flags)
    }
}

/// Checksum- and VLAN-aware classifier.
///
/// Packets routed past ethernet input have their L2 header (and VLAN tags)
/// advanced over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultClassifier {
    /// Next stage per layer 2 filter index.
    pub layer2_next: [NextStage; LAYER2_TYPES],
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self {
            layer2_next: [NextStage::EthernetInput; LAYER2_TYPES],
        }
    }
}

impl Classifier for DefaultClassifier {
    fn classify(&self, flags: RxFlags) -> Disposition {
        let mut next = if flags.contains(RxFlags::LAYER2) {
            self.layer2_next[flags.layer2_type()]
        } else if flags.contains(RxFlags::IP4_CHECKSUMMED) {
            NextStage::Ip4InputValidChecksum
        } else if flags.contains(RxFlags::IP6) {
            NextStage::Ip6Input
        } else {
            NextStage::EthernetInput
        };

        let mut error = RX_ERROR_NONE;
        if flags.contains(RxFlags::IP4_INVALID_CHECKSUM) {
            error = RX_ERROR_IP4_CHECKSUM;
        }
        if flags.contains(RxFlags::FRAME_ERROR) {
            error = RX_ERROR_FRAME;
        }
        if error != RX_ERROR_NONE {
            next = NextStage::Error;
        }

        let mut advance = 0;
        if next != NextStage::EthernetInput {
            advance = ETHERNET_HEADER_BYTES;
            if flags.contains(RxFlags::VLAN) {
                advance += VLAN_TAG_BYTES;
            }
            if flags.contains(RxFlags::DOUBLE_VLAN) {
                advance += VLAN_TAG_BYTES;
            }
        }

        Disposition {
            next,
            advance,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip4_checksummed() {
        let d = DefaultClassifier::default().classify(RxFlags::IP4_CHECKSUMMED);
        assert_eq!(
            d,
            Disposition {
                next: NextStage::Ip4InputValidChecksum,
                advance: 14,
                error: RX_ERROR_NONE,
            }
        );
    }

    #[test]
    fn test_vlan_advance() {
        let c = DefaultClassifier::default();
        assert_eq!(c.classify(RxFlags::IP6 | RxFlags::VLAN).advance, 18);
        assert_eq!(
            c.classify(RxFlags::IP6 | RxFlags::VLAN | RxFlags::DOUBLE_VLAN)
                .advance,
            22
        );
    }

    #[test]
    fn test_unknown_goes_to_ethernet_input() {
        let d = DefaultClassifier::default().classify(RxFlags::VLAN);
        assert_eq!(d.next, NextStage::EthernetInput);
        assert_eq!(d.advance, 0);
    }

    #[test]
    fn test_errors() {
        let c = DefaultClassifier::default();
        let bad_csum = c.classify(RxFlags::IP4_CHECKSUMMED | RxFlags::IP4_INVALID_CHECKSUM);
        assert_eq!(bad_csum.next, NextStage::Error);
        assert_eq!(bad_csum.error, RX_ERROR_IP4_CHECKSUM);

        let frame = c.classify(RxFlags::FRAME_ERROR);
        assert_eq!(frame.next, NextStage::Error);
        assert_eq!(frame.error, RX_ERROR_FRAME);
    }

    #[test]
    fn test_layer2_table() {
        let mut c = DefaultClassifier::default();
        c.layer2_next[3] = NextStage::Punt;
        let d = c.classify(RxFlags::with_layer2_type(3));
        assert_eq!(d.next, NextStage::Punt);
        assert_eq!(d.advance, 14);
        assert_eq!(
            c.classify(RxFlags::with_layer2_type(2)).next,
            NextStage::EthernetInput
        );
    }

    #[test]
    fn test_closure_classifier() {
        let punt_all = |_: RxFlags| Disposition {
            next: NextStage::Punt,
            advance: 0,
            error: 0,
        };
        assert_eq!(punt_all.classify(RxFlags::IP6).next, NextStage::Punt);
    }
}
