//! # COPQ Core Types
//!
//! Fundamental type definitions used across the queue stack.
//!
//! These types provide:
//! - Strong typing for main memory addresses (word granular)
//! - Overlay identifiers restricted to the opcode domain nibble
//! - Priority-tagged syncpoint identifiers
//! - Type-safe handles

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

// =============================================================================
// HOST ADDRESS
// =============================================================================

/// Main memory address as seen by the coprocessor's DMA engine
///
/// Byte address, always word aligned for command stream content.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct HostAddr(u32);

impl HostAddr {
    /// Size of one word in bytes
    pub const WORD_BYTES: u32 = 4;

    /// Create a new host address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Create a null host address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check word alignment
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 % Self::WORD_BYTES == 0
    }

    /// Offset by a number of words
    #[inline]
    pub const fn offset_words(self, words: u32) -> Self {
        Self(self.0.wrapping_add(words * Self::WORD_BYTES))
    }

    /// Word index of this address (byte address / 4)
    #[inline]
    pub const fn word_index(self) -> usize {
        (self.0 / Self::WORD_BYTES) as usize
    }
}

impl fmt::Debug for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// =============================================================================
// OVERLAY ID
// =============================================================================

/// Overlay identifier, the high nibble of an overlay opcode
///
/// Valid ids are `1..=15`; domain 0 belongs to the builtins.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OverlayId(u8);

impl OverlayId {
    /// Lowest valid id
    pub const MIN: u8 = 1;
    /// Highest valid id
    pub const MAX: u8 = 15;

    /// Create an overlay id, `None` outside `1..=15`
    #[inline]
    pub const fn new(id: u8) -> Option<Self> {
        if id >= Self::MIN && id <= Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Overlay id owning a dispatch table slot
    #[inline]
    pub const fn from_slot(slot: usize) -> Self {
        Self(slot as u8 + 1)
    }

    /// Get the raw id
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Dispatch table slot index
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Debug for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayId({})", self.0)
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Command stream priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Default stream
    Low  = 0,
    /// Pre-empting stream
    High = 1,
}

impl Priority {
    /// Both priorities, low first
    pub const ALL: [Priority; 2] = [Priority::Low, Priority::High];

    /// Index into per-priority arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// SYNCPOINT ID
// =============================================================================

/// Syncpoint identifier
///
/// Bit 31 tags the issuing stream, the low 31 bits hold the sequence
/// number. Sequence numbers come from one global counter starting at 1,
/// so ids never repeat across streams.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SyncpointId(u32);

impl SyncpointId {
    const HIGH_BIT: u32 = 1 << 31;

    /// Largest sequence number
    pub const MAX_SEQ: u32 = Self::HIGH_BIT - 1;

    /// Create a syncpoint id
    #[inline]
    pub const fn new(priority: Priority, seq: u32) -> Self {
        let tag = match priority {
            Priority::Low => 0,
            Priority::High => Self::HIGH_BIT,
        };
        Self(tag | (seq & Self::MAX_SEQ))
    }

    /// Rebuild from the raw wire value
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Sequence number
    #[inline]
    pub const fn seq(self) -> u32 {
        self.0 & Self::MAX_SEQ
    }

    /// Issuing stream
    #[inline]
    pub const fn priority(self) -> Priority {
        if self.0 & Self::HIGH_BIT != 0 {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

impl fmt::Debug for SyncpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncpointId({:?}:{})", self.priority(), self.seq())
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Generic resource handle
///
/// Handles are type-safe wrappers that prevent mixing different resource types.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>(0x{:x})",
            core::any::type_name::<T>(),
            self.id
        )
    }
}

/// Marker for block handle
#[derive(Debug)]
pub struct BlockMarker;

/// Handle to a recorded block
pub type BlockHandle = Handle<BlockMarker>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addr_words() {
        let addr = HostAddr::new(0x1000);
        assert!(addr.is_aligned());
        assert_eq!(addr.offset_words(3).raw(), 0x100C);
        assert_eq!(addr.word_index(), 0x400);
        assert!(!HostAddr::new(0x1002).is_aligned());
    }

    #[test]
    fn test_overlay_id_range() {
        assert!(OverlayId::new(0).is_none());
        assert!(OverlayId::new(16).is_none());
        let id = OverlayId::new(15).unwrap();
        assert_eq!(id.slot(), 14);
        assert_eq!(OverlayId::from_slot(0).raw(), 1);
    }

    #[test]
    fn test_syncpoint_tagging() {
        let low = SyncpointId::new(Priority::Low, 7);
        let high = SyncpointId::new(Priority::High, 8);
        assert_eq!(low.priority(), Priority::Low);
        assert_eq!(high.priority(), Priority::High);
        assert_eq!(high.seq(), 8);
        assert_eq!(SyncpointId::from_raw(high.raw()), high);
        assert_ne!(low.raw() & (1 << 31), high.raw() & (1 << 31));
    }

    #[test]
    fn test_handle_identity() {
        let a = BlockHandle::new(4);
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, BlockHandle::new(5));
    }
}
