//! Scatter/gather chains of buffers.

use dma_pool::PhysicalHeap;

use super::{Header, Ref, RefFlags};
use crate::error::{DataplaneError, Result};

/// Multi-buffer packet under construction.
///
/// The head ref lives here; every later link is stored in the header of
/// its predecessor. The chain remembers where its tail link is stored so
/// that append never walks the existing links.
#[derive(Debug, Clone, Default)]
pub struct RefChain {
    head: Option<Ref>,
    tail: Option<Ref>,
    /// Buffer whose header holds `tail`; `None` when the tail is the head.
    tail_home: Option<u32>,
    len: usize,
    count: usize,
}

impl RefChain {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            tail_home: None,
            len: 0,
            count: 0,
        }
    }

    /// Total data bytes over all links.
    #[inline]
    pub fn total_length(&self) -> usize {
        self.len
    }

    /// Number of links.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn head(&self) -> Option<&Ref> {
        self.head.as_ref()
    }

    /// Append `r` (and any links already chained behind it).
    pub fn append(&mut self, heap: &PhysicalHeap, r: Ref) -> Result<()> {
        match self.tail {
            None => self.head = Some(r),
            Some(mut tail) => {
                Header::link(heap, tail.offset(), &r)?;
                tail.set_flags(tail.flags() | RefFlags::CHAINED);
                self.store_tail(heap, tail)?;
            }
        }

        // Walk what `r` brings with it.
        let mut home = self.tail.map(|tail| tail.offset());
        let mut link = r;
        loop {
            self.len += link.data_len() as usize;
            self.count += 1;
            match link.next(heap)? {
                Some(next) => {
                    home = Some(link.offset());
                    link = next;
                }
                None => break,
            }
        }
        self.tail = Some(link);
        self.tail_home = home;
        Ok(())
    }

    /// Rewrite the tail ref wherever it is stored.
    fn store_tail(&mut self, heap: &PhysicalHeap, tail: Ref) -> Result<()> {
        match self.tail_home {
            Some(home) => Header::link(heap, home, &tail)?,
            None => self.head = Some(tail),
        }
        self.tail = Some(tail);
        Ok(())
    }

    /// Hand the head upward and reset the chain.
    pub fn done(&mut self) -> Option<Ref> {
        let head = self.head.take();
        *self = Self::new();
        head
    }

    /// Iterate all links, head first.
    pub fn links<'h>(&self, heap: &'h PhysicalHeap) -> Links<'h> {
        match self.head {
            Some(head) => Links::new(heap, head),
            None => Links::empty(heap),
        }
    }

    /// Check the links against the running totals.
    ///
    /// Only walks the chain in debug builds; release builds return `Ok`.
    pub fn validate(&self, heap: &PhysicalHeap) -> Result<()> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }
        let mut len = 0;
        let mut count = 0;
        let mut last = None;
        for link in self.links(heap) {
            let link = link.map_err(|_| DataplaneError::CorruptChain)?;
            if !heap.pointer_valid(link.offset() as usize) {
                return Err(DataplaneError::CorruptChain);
            }
            len += link.data_len() as usize;
            count += 1;
            if count > self.count {
                return Err(DataplaneError::CorruptChain);
            }
            last = Some(link);
        }
        let last = last.map(|l| l.offset());
        if len != self.len || count != self.count || last != self.tail.map(|t| t.offset()) {
            return Err(DataplaneError::CorruptChain);
        }
        Ok(())
    }
}

/// Iterator over a ref and its chained successors.
pub struct Links<'h> {
    heap: &'h PhysicalHeap,
    next: Option<Ref>,
}

impl<'h> Links<'h> {
    pub(crate) fn new(heap: &'h PhysicalHeap, first: Ref) -> Self {
        Self {
            heap,
            next: Some(first),
        }
    }

    fn empty(heap: &'h PhysicalHeap) -> Self {
        Self { heap, next: None }
    }
}

impl Iterator for Links<'_> {
    type Item = Result<Ref>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        match current.next(self.heap) {
            Ok(next) => {
                self.next = next;
                Some(Ok(current))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{RefOpaque, BUFFER_HEADER_BYTES};
    use dma_pool::PhysMapping;

    fn heap() -> PhysicalHeap {
        PhysicalHeap::builder()
            .owned_region(64 * 1024, PhysMapping::Identity)
            .build()
            .unwrap()
    }

    fn buf(offset: u32, len: u16) -> Ref {
        Ref::new(offset, 64, len, RefOpaque::default())
    }

    #[test]
    fn test_append_links_headers() {
        let heap = heap();
        let mut chain = RefChain::new();
        chain.append(&heap, buf(0x000, 100)).unwrap();
        chain.append(&heap, buf(0x400, 200)).unwrap();
        chain.append(&heap, buf(0x800, 300)).unwrap();

        assert_eq!(chain.total_length(), 600);
        assert_eq!(chain.count(), 3);
        chain.validate(&heap).unwrap();

        let head = *chain.head().unwrap();
        assert!(head.is_chained());
        let second = head.next(&heap).unwrap().unwrap();
        assert_eq!(second.offset(), 0x400);
        assert!(second.is_chained());
        let third = second.next(&heap).unwrap().unwrap();
        assert_eq!(third.offset(), 0x800);
        assert!(!third.is_chained());
        assert_eq!(third.next(&heap).unwrap(), None);
    }

    #[test]
    fn test_append_chain_contributes_all_links() {
        let heap = heap();
        let mut inner = RefChain::new();
        inner.append(&heap, buf(0x400, 10)).unwrap();
        inner.append(&heap, buf(0x800, 20)).unwrap();
        let inner_head = inner.done().unwrap();

        let mut chain = RefChain::new();
        chain.append(&heap, buf(0x000, 5)).unwrap();
        chain.append(&heap, inner_head).unwrap();
        assert_eq!(chain.count(), 3);
        assert_eq!(chain.total_length(), 35);
        chain.validate(&heap).unwrap();

        // Appending after a multi-link append must update the right header.
        chain.append(&heap, buf(0xC00, 40)).unwrap();
        assert_eq!(chain.count(), 4);
        chain.validate(&heap).unwrap();
        let offsets: alloc::vec::Vec<u32> = chain
            .links(&heap)
            .map(|l| l.unwrap().offset())
            .collect();
        assert_eq!(offsets, [0x000, 0x400, 0x800, 0xC00]);
    }

    #[test]
    fn test_done_resets() {
        let heap = heap();
        let mut chain = RefChain::new();
        assert_eq!(chain.done(), None);
        chain.append(&heap, buf(0, 42)).unwrap();
        let head = chain.done().unwrap();
        assert_eq!(head.data_len(), 42);
        assert!(!head.is_chained());
        assert!(chain.is_empty());
        assert_eq!(chain.total_length(), 0);
    }

    #[test]
    fn test_validate_detects_corruption() {
        if !cfg!(debug_assertions) {
            return;
        }
        let heap = heap();
        let mut chain = RefChain::new();
        chain.append(&heap, buf(0x000, 1)).unwrap();
        chain.append(&heap, buf(0x400, 1)).unwrap();

        // Cut the link behind the chain's back.
        heap.fill(0, BUFFER_HEADER_BYTES, 0).unwrap();
        assert_eq!(chain.validate(&heap), Err(DataplaneError::CorruptChain));
    }
}
