//! Memory barriers for descriptor hand-off.
//!
//! Descriptor memory is shared with a bus master, so the order in which the
//! CPU publishes and observes it matters:
//!
//! - [`sfence`] after writing descriptors, before the tail register write
//! - [`lfence`] after seeing a done bit, before reading the rest of the
//!   descriptor or the buffer it points at

use core::sync::atomic::{fence, Ordering};

/// Order all prior stores before any later store (tail publish).
#[inline(always)]
pub fn sfence() {
    fence(Ordering::Release);
}

/// Order a done-bit load before any later load (descriptor body, payload).
#[inline(always)]
pub fn lfence() {
    fence(Ordering::Acquire);
}

/// Full barrier.
#[inline(always)]
pub fn mfence() {
    fence(Ordering::SeqCst);
}
