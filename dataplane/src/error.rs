//! Dataplane error types

use core::fmt;

use dma_pool::DmaError;

pub type Result<T> = core::result::Result<T, DataplaneError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataplaneError {
    /// Pool cannot grow (heap exhausted or buffer limit reached).
    OutOfMemory,
    /// Transmit ring took only the first `accepted` packets.
    RingFull {
        /// Packets now owned by the ring.
        accepted: usize,
    },
    /// Hardware did not reach the requested state in time.
    HardwareTimeout {
        /// Transition being waited on ("arm", "stop").
        transition: &'static str,
        /// Time spent polling.
        waited_us: u32,
    },
    /// Descriptor contents contradict the ring bookkeeping.
    CorruptDescriptor {
        /// Offending slot.
        slot: u16,
    },
    /// Buffer chain links are inconsistent.
    CorruptChain,
    /// Data does not fit in the buffer's data window.
    BufferTooSmall {
        /// Required size.
        needed: usize,
        /// Available size.
        available: usize,
    },
    /// Configuration rejected at construction.
    InvalidConfig(&'static str),
    /// Operation not allowed in the current ring state.
    InvalidState,
    /// Underlying DMA heap failure.
    Dma(DmaError),
}

impl From<DmaError> for DataplaneError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::OutOfMemory => Self::OutOfMemory,
            other => Self::Dma(other),
        }
    }
}

impl fmt::Display for DataplaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of buffer memory"),
            Self::RingFull { accepted } => {
                write!(f, "Descriptor ring full after {} packets", accepted)
            }
            Self::HardwareTimeout {
                transition,
                waited_us,
            } => write!(f, "Hardware {} timed out after {}us", transition, waited_us),
            Self::CorruptDescriptor { slot } => write!(f, "Corrupt descriptor in slot {}", slot),
            Self::CorruptChain => write!(f, "Corrupt buffer chain"),
            Self::BufferTooSmall { needed, available } => write!(
                f,
                "Buffer too small: need {} bytes, {} available",
                needed, available
            ),
            Self::InvalidConfig(what) => write!(f, "Invalid configuration: {}", what),
            Self::InvalidState => write!(f, "Invalid ring state for operation"),
            Self::Dma(err) => write!(f, "DMA error: {}", err),
        }
    }
}
