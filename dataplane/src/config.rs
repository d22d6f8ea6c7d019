//! Pool, ring and queue configuration.
//!
//! Plain structs with public fields. Start from `Default` (or `new`), tweak
//! fields, and let the constructor that consumes them validate.

use alloc::string::String;
use alloc::vec::Vec;

use crate::buffer::RefOpaque;
use crate::error::{DataplaneError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════

/// Default payload bytes per buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default minimum number of buffers added per pool growth.
pub const DEFAULT_GROWTH_MIN: usize = 32;

/// Default number of descriptors per ring.
pub const DEFAULT_RING_LEN: u16 = 512;

/// Default descriptors inspected per drain call.
pub const DEFAULT_BATCH_LIMIT: usize = 256;

/// Default time allowed for a queue to start or stop.
pub const DEFAULT_STOP_TIMEOUT_US: u32 = 10_000;

/// Default poll interval while waiting on the hardware.
pub const DEFAULT_POLL_INTERVAL_US: u32 = 10;

/// Largest ring the index arithmetic supports.
pub const MAX_RING_LEN: u16 = 32768;

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Buffer pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Name used in logs and stats.
    pub name: String,
    /// Requested payload bytes per buffer (rounded up by the pool).
    pub buffer_size: usize,
    /// Bytes copied into every new or recycled buffer.
    pub template_data: Vec<u8>,
    /// Opaque words stamped into every allocated ref.
    pub opaque: RefOpaque,
    /// Minimum buffers per growth step.
    pub growth_min: usize,
    /// Hard cap on buffers owned by the pool.
    pub max_buffers: Option<usize>,
    /// Zero the data area when a buffer is freed.
    pub scrub_on_free: bool,
}

impl PoolConfig {
    /// Configuration with default values and the given payload size.
    pub fn new(name: &str, buffer_size: usize) -> Self {
        Self {
            name: String::from(name),
            buffer_size,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(DataplaneError::InvalidConfig("buffer size is zero"));
        }
        if self.growth_min == 0 {
            return Err(DataplaneError::InvalidConfig("growth_min is zero"));
        }
        if self.template_data.len() > self.buffer_size {
            return Err(DataplaneError::InvalidConfig(
                "template data larger than buffer",
            ));
        }
        if self.max_buffers == Some(0) {
            return Err(DataplaneError::InvalidConfig("max_buffers is zero"));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            template_data: Vec::new(),
            opaque: RefOpaque::default(),
            growth_min: DEFAULT_GROWTH_MIN,
            max_buffers: None,
            scrub_on_free: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RING
// ═══════════════════════════════════════════════════════════════════════════

/// What a drain does on reaching the last slot of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapPolicy {
    /// Keep going from slot 0 in the same call.
    Continue,
    /// Return; the next call resumes from slot 0.
    Defer,
}

/// Descriptor ring configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of descriptor slots (N).
    pub len: u16,
    /// Most descriptors inspected per drain.
    pub batch_limit: usize,
    /// End-of-ring behaviour.
    pub wrap: WrapPolicy,
    /// Allocate an extra reload descriptor jumping back to slot 0.
    pub reload_slot: bool,
    /// Time allowed for the hardware to start or stop.
    pub stop_timeout_us: u32,
    /// Delay between hardware state polls.
    pub poll_interval_us: u32,
}

impl RingConfig {
    /// Configuration with default values and `len` slots.
    pub fn new(len: u16) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.len < 2 || self.len > MAX_RING_LEN {
            return Err(DataplaneError::InvalidConfig("ring length out of range"));
        }
        if self.batch_limit == 0 {
            return Err(DataplaneError::InvalidConfig("batch limit is zero"));
        }
        if self.poll_interval_us == 0 {
            return Err(DataplaneError::InvalidConfig("poll interval is zero"));
        }
        Ok(())
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            len: DEFAULT_RING_LEN,
            batch_limit: DEFAULT_BATCH_LIMIT,
            wrap: WrapPolicy::Continue,
            reload_slot: false,
            stop_timeout_us: DEFAULT_STOP_TIMEOUT_US,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUES
// ═══════════════════════════════════════════════════════════════════════════

/// Receive queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxConfig {
    pub ring: RingConfig,
    /// Interface index stamped into every received packet.
    pub interface: u32,
}

impl RxConfig {
    pub fn new(len: u16) -> Self {
        Self {
            ring: RingConfig::new(len),
            interface: 0,
        }
    }
}

/// How transmit completions are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Device DMAs its head index into a word in host memory.
    HeadWriteback,
    /// Poll the done bit of descriptors that requested status.
    DescriptorDone,
    /// Read the head index register.
    HeadRegister,
}

/// Transmit queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfig {
    pub ring: RingConfig,
    pub reclaim: ReclaimMode,
}

impl TxConfig {
    pub fn new(len: u16) -> Self {
        Self {
            ring: RingConfig::new(len),
            reclaim: ReclaimMode::DescriptorDone,
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            reclaim: ReclaimMode::DescriptorDone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_config_validation() {
        assert!(RingConfig::new(8).validate().is_ok());
        assert_eq!(
            RingConfig::new(1).validate(),
            Err(DataplaneError::InvalidConfig("ring length out of range"))
        );
        let mut config = RingConfig::new(8);
        config.batch_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new("rx", 1536).validate().is_ok());
        assert!(PoolConfig::new("rx", 0).validate().is_err());

        let mut config = PoolConfig::new("rx", 16);
        config.template_data = alloc::vec![0u8; 32];
        assert!(config.validate().is_err());
    }
}
