//! # Block Recorder
//!
//! A block is a closed, immutable run of encoded records living in main
//! memory, invoked from a stream with a call record and left through a
//! trailing return record. Blocks may call other blocks; every call level
//! uses its own slot of the coprocessor's return-address stack.
//!
//! ```text
//!  region
//! ┌────────────────┬──────────────────────────────┬──────────────┐
//! │ header (level, │  body: recorded records ...  │ ret(level)   │
//! │ body words)    │                              │              │
//! └────────────────┴──────────────────────────────┴──────────────┘
//!                  ▲
//!                  └── call target
//! ```

use alloc::vec::Vec;

use hashbrown::HashMap;
use heapless::Vec as BoundedVec;

use copq_core::config::MAX_OVERLAY_SLOTS;
use copq_core::layout::BlockHeader;
use copq_core::wire::{self, Builtin};
use copq_core::{BlockHandle, Error, HostAddr, HostRegion, OverlayId, Result};

use crate::syncpoint::UseMarks;

// =============================================================================
// RECORDER
// =============================================================================

/// Block under construction
#[derive(Debug, Default)]
pub struct BlockRecorder {
    /// Encoded body so far
    words: Vec<u32>,
    /// Return-stack slot the block will return through
    level: usize,
    /// Blocks called from the body, one entry per call
    children: Vec<BlockHandle>,
    /// Overlays the body uses
    overlays: BoundedVec<OverlayId, MAX_OVERLAY_SLOTS>,
}

impl BlockRecorder {
    /// Start an empty recording
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encoded record
    pub fn push(&mut self, record: &[u32]) {
        self.words.extend_from_slice(record);
    }

    /// Note a call to `child`, which sits at `child_level`
    ///
    /// Fails when the nesting would need a stack slot at or past `max`.
    pub fn call(&mut self, child: BlockHandle, body: HostAddr, child_level: usize, max: usize) -> Result<()> {
        let level = child_level + 1;
        if level >= max {
            return Err(Error::NestingTooDeep { level, max });
        }
        self.push(&wire::call(body, child_level as u32));
        self.level = self.level.max(level);
        self.children.push(child);
        Ok(())
    }

    /// Note an overlay used by the body
    pub fn use_overlay(&mut self, id: OverlayId) {
        if !self.overlays.contains(&id) {
            // At most one entry per slot
            let _ = self.overlays.push(id);
        }
    }

    /// Check whether the body references an overlay
    pub fn uses_overlay(&self, id: OverlayId) -> bool {
        self.overlays.contains(&id)
    }

    /// Check whether the body calls a block
    pub fn calls(&self, handle: BlockHandle) -> bool {
        self.children.contains(&handle)
    }

    /// Blocks called so far
    pub fn children(&self) -> &[BlockHandle] {
        &self.children
    }

    /// Overlays used so far
    pub fn overlays(&self) -> &[OverlayId] {
        &self.overlays
    }

    /// Nesting level so far
    pub fn level(&self) -> usize {
        self.level
    }

    /// Header plus body plus return, ready to publish
    pub fn image(&self) -> Vec<u32> {
        let ret = wire::ret(self.level as u32);
        let header = BlockHeader {
            level: self.level as u16,
            body_words: (self.words.len() + ret.len()) as u32,
        };
        let mut image = Vec::with_capacity(BlockHeader::WORDS + self.words.len() + ret.len());
        image.extend_from_slice(&header.to_words());
        image.extend_from_slice(&self.words);
        image.extend_from_slice(&ret);
        image
    }

    /// Split into the parts a closed block keeps
    pub fn into_parts(self) -> (usize, Vec<BlockHandle>, BoundedVec<OverlayId, MAX_OVERLAY_SLOTS>) {
        (self.level, self.children, self.overlays)
    }
}

// =============================================================================
// BLOCK
// =============================================================================

/// A closed block
#[derive(Debug)]
pub struct Block {
    /// Backing allocation, header included
    pub region: HostRegion,
    /// Return-stack slot of its return record
    pub level: usize,
    /// Body size including the return
    pub body_words: u32,
    /// Live blocks calling this one
    pub refcount: u32,
    /// Blocks this one calls
    pub children: Vec<BlockHandle>,
    /// Overlays this one uses
    pub overlays: BoundedVec<OverlayId, MAX_OVERLAY_SLOTS>,
    /// Runs not yet known to be consumed
    pub last_run: UseMarks,
}

impl Block {
    /// Call target
    pub fn body(&self) -> HostAddr {
        self.region.word(BlockHeader::WORDS as u32)
    }

    /// Words to write over the region when it is freed
    pub fn poison(&self) -> Vec<u32> {
        alloc::vec![wire::header(Builtin::Invalid as u8); self.region.words as usize]
    }
}

// =============================================================================
// ARENA
// =============================================================================

/// Live blocks by handle
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: HashMap<BlockHandle, Block>,
    next_id: u64,
}

impl BlockArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block
    pub fn insert(&mut self, block: Block) -> BlockHandle {
        self.next_id += 1;
        let handle = BlockHandle::new(self.next_id);
        self.blocks.insert(handle, block);
        handle
    }

    /// Look up a block
    pub fn get(&self, handle: BlockHandle) -> Result<&Block> {
        self.blocks.get(&handle).ok_or(Error::UnknownBlock)
    }

    /// Look up a block mutably
    pub fn get_mut(&mut self, handle: BlockHandle) -> Result<&mut Block> {
        self.blocks.get_mut(&handle).ok_or(Error::UnknownBlock)
    }

    /// Remove a block
    pub fn remove(&mut self, handle: BlockHandle) -> Result<Block> {
        self.blocks.remove(&handle).ok_or(Error::UnknownBlock)
    }

    /// Live blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// No live blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOOP: u32 = 0x0100_0000;

    #[test]
    fn test_image_layout() {
        let mut rec = BlockRecorder::new();
        rec.push(&[NOOP]);
        rec.push(&[NOOP]);
        let image = rec.image();
        assert_eq!(
            BlockHeader::from_words(&image),
            Some(BlockHeader { level: 0, body_words: 4 })
        );
        assert_eq!(&image[2..], &[NOOP, NOOP, 0x0400_0000, 0]);
    }

    #[test]
    fn test_nesting_levels() {
        let mut rec = BlockRecorder::new();
        let inner = BlockHandle::new(1);
        rec.call(inner, HostAddr::new(0x4000), 0, 8).unwrap();
        assert_eq!(rec.level(), 1);
        rec.call(BlockHandle::new(2), HostAddr::new(0x5000), 3, 8).unwrap();
        assert_eq!(rec.level(), 4);
        assert_eq!(
            rec.call(inner, HostAddr::new(0x4000), 7, 8),
            Err(Error::NestingTooDeep { level: 8, max: 8 })
        );
        assert!(rec.calls(inner));
        assert_eq!(rec.children().len(), 2);

        // Return goes through the block's own slot
        let image = rec.image();
        assert_eq!(&image[image.len() - 2..], &wire::ret(4));
    }

    #[test]
    fn test_overlay_set() {
        let mut rec = BlockRecorder::new();
        let id = OverlayId::new(2).unwrap();
        rec.use_overlay(id);
        rec.use_overlay(id);
        assert_eq!(rec.overlays(), &[id]);
        assert!(rec.uses_overlay(id));
    }

    #[test]
    fn test_arena() {
        let mut arena = BlockArena::new();
        let block = Block {
            region: HostRegion::new(HostAddr::new(0x4000), 5),
            level: 0,
            body_words: 3,
            refcount: 0,
            children: Vec::new(),
            overlays: BoundedVec::new(),
            last_run: UseMarks::default(),
        };
        assert_eq!(block.body(), HostAddr::new(0x4008));
        assert_eq!(block.poison().len(), 5);

        let handle = arena.insert(block);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(handle).is_ok());
        arena.remove(handle).unwrap();
        assert!(matches!(arena.get(handle), Err(Error::UnknownBlock)));
        assert!(arena.is_empty());
    }
}
