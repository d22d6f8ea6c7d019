//! Buffer state tracking for debugging.
//!
//! With the `validate-state` feature every allocate and free records the
//! buffer's state in a process-wide table keyed by `(heap id, offset)`, and
//! any mismatch (double free, freeing a buffer that was never allocated,
//! handing out a buffer twice) panics on the spot. Without the feature all
//! of this compiles to nothing.

use super::Ref;

/// Life-cycle state of a buffer as seen by the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Never seen (or torn down).
    Unknown,
    /// Handed out to a caller.
    Allocated,
    /// On a pool free list.
    Free,
}

#[cfg(feature = "validate-state")]
mod table {
    use hashbrown::HashMap;
    use spin::Mutex;

    use super::{BufferState, Ref};

    static STATES: Mutex<Option<HashMap<(u32, u32), BufferState>>> = Mutex::new(None);

    fn check(heap_id: u32, offset: u32, found: BufferState, expected: BufferState) {
        if found != expected {
            panic!(
                "buffer {:#x} in heap {}: state {:?}, expected {:?}",
                offset, heap_id, found, expected
            );
        }
    }

    pub(super) fn validate(heap_id: u32, refs: &[Ref], expected: BufferState) {
        let guard = STATES.lock();
        for r in refs {
            let found = guard
                .as_ref()
                .and_then(|map| map.get(&(heap_id, r.offset())).copied())
                .unwrap_or(BufferState::Unknown);
            check(heap_id, r.offset(), found, expected);
        }
    }

    pub(super) fn transition(heap_id: u32, refs: &[Ref], from: BufferState, to: BufferState) {
        let mut guard = STATES.lock();
        let map = guard.get_or_insert_with(HashMap::new);
        for r in refs {
            let key = (heap_id, r.offset());
            let found = map.get(&key).copied().unwrap_or(BufferState::Unknown);
            check(heap_id, r.offset(), found, from);
            if to == BufferState::Unknown {
                map.remove(&key);
            } else {
                map.insert(key, to);
            }
        }
    }
}

/// Panic unless every ref is in `expected` state.
#[cfg(feature = "validate-state")]
#[inline]
pub(crate) fn validate(heap_id: u32, refs: &[Ref], expected: BufferState) {
    table::validate(heap_id, refs, expected);
}

/// Move every ref from `from` to `to`, panicking on mismatch.
#[cfg(feature = "validate-state")]
#[inline]
pub(crate) fn transition(heap_id: u32, refs: &[Ref], from: BufferState, to: BufferState) {
    table::transition(heap_id, refs, from, to);
}

#[cfg(not(feature = "validate-state"))]
#[inline(always)]
pub(crate) fn validate(_heap_id: u32, _refs: &[Ref], _expected: BufferState) {}

#[cfg(not(feature = "validate-state"))]
#[inline(always)]
pub(crate) fn transition(_heap_id: u32, _refs: &[Ref], _from: BufferState, _to: BufferState) {}
