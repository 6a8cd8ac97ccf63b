//! # Host Memory Heap
//!
//! Word-granular allocator over the main memory window the queue owns.
//! Ring buffers, overlay images, block bodies and the boot block all come
//! from here. First fit over an address-ordered free list; neighbours are
//! merged on free.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::types::HostAddr;

// =============================================================================
// HOST REGION
// =============================================================================

/// A word-aligned span of main memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRegion {
    /// Start address
    pub addr: HostAddr,
    /// Size in words
    pub words: u32,
}

impl HostRegion {
    /// Create a region
    pub const fn new(addr: HostAddr, words: u32) -> Self {
        Self { addr, words }
    }

    /// One past the last byte
    pub const fn end(&self) -> HostAddr {
        self.addr.offset_words(self.words)
    }

    /// Address of a word inside the region
    pub const fn word(&self, index: u32) -> HostAddr {
        self.addr.offset_words(index)
    }

    /// Check whether an address falls inside the region
    pub const fn contains(&self, addr: HostAddr) -> bool {
        addr.raw() >= self.addr.raw() && addr.raw() < self.end().raw()
    }
}

// =============================================================================
// HOST HEAP
// =============================================================================

/// First-fit heap over one main memory window
#[derive(Debug)]
pub struct HostHeap {
    /// Whole window
    window: HostRegion,
    /// Free spans, sorted by address, never adjacent
    free: Vec<HostRegion>,
    /// Words handed out
    used: u32,
}

impl HostHeap {
    /// Create a heap covering `window`
    pub fn new(window: HostRegion) -> Self {
        let mut free = Vec::new();
        if window.words > 0 {
            free.push(window);
        }
        Self {
            window,
            free,
            used: 0,
        }
    }

    /// Whole window
    pub fn window(&self) -> HostRegion {
        self.window
    }

    /// Words currently allocated
    pub fn used_words(&self) -> u32 {
        self.used
    }

    /// Words still free (possibly fragmented)
    pub fn free_words(&self) -> u32 {
        self.free.iter().map(|r| r.words).sum()
    }

    /// Allocate `words` words; zero-sized requests get one word
    pub fn alloc(&mut self, words: u32) -> Result<HostRegion> {
        let words = words.max(1);
        let index = self
            .free
            .iter()
            .position(|r| r.words >= words)
            .ok_or(Error::OutOfHostMemory { words })?;

        let span = self.free[index];
        let region = HostRegion::new(span.addr, words);
        if span.words == words {
            self.free.remove(index);
        } else {
            self.free[index] = HostRegion::new(span.addr.offset_words(words), span.words - words);
        }
        self.used += words;
        Ok(region)
    }

    /// Return a region to the heap
    pub fn free(&mut self, region: HostRegion) {
        debug_assert!(self.window.contains(region.addr));

        let index = self
            .free
            .iter()
            .position(|r| r.addr > region.addr)
            .unwrap_or(self.free.len());
        self.free.insert(index, region);
        self.used -= region.words;

        // Merge with the following span
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].addr {
            self.free[index].words += self.free[index + 1].words;
            self.free.remove(index + 1);
        }
        // Merge with the preceding span
        if index > 0 && self.free[index - 1].end() == self.free[index].addr {
            self.free[index - 1].words += self.free[index].words;
            self.free.remove(index);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> HostHeap {
        HostHeap::new(HostRegion::new(HostAddr::new(0x1000), 64))
    }

    #[test]
    fn test_first_fit() {
        let mut heap = heap();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(8).unwrap();
        assert_eq!(a.addr.raw(), 0x1000);
        assert_eq!(b.addr.raw(), 0x1040);
        assert_eq!(heap.used_words(), 24);
        assert_eq!(heap.free_words(), 40);
    }

    #[test]
    fn test_exhaustion() {
        let mut heap = heap();
        heap.alloc(60).unwrap();
        assert_eq!(heap.alloc(8), Err(Error::OutOfHostMemory { words: 8 }));
    }

    #[test]
    fn test_free_coalesces() {
        let mut heap = heap();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        let c = heap.alloc(16).unwrap();
        heap.free(a);
        heap.free(c);
        heap.free(b);
        assert_eq!(heap.used_words(), 0);
        // One span again: a full-size request fits
        assert_eq!(heap.alloc(64).unwrap().addr.raw(), 0x1000);
    }

    #[test]
    fn test_reuse_hole() {
        let mut heap = heap();
        let a = heap.alloc(8).unwrap();
        let _b = heap.alloc(8).unwrap();
        heap.free(a);
        assert_eq!(heap.alloc(4).unwrap().addr, a.addr);
    }
}
