//! # Shared Memory Layout
//!
//! Structures the CPU writes into main memory and the coprocessor reads
//! back: the boot block, overlay dispatch table entries, per-overlay
//! arity tables and block headers. All are flat word arrays.

use heapless::Vec;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::config::{MAX_ARGS, MAX_OVERLAY_COMMANDS, MAX_OVERLAY_SLOTS};
use crate::types::HostAddr;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Magic word at the start of the boot block ("COPQ")
pub const BOOT_MAGIC: u32 = 0x434F_5051;

/// Block header tag, nesting level in the low 16 bits
pub const BLOCK_MAGIC: u32 = 0xB10C_0000;

/// One counter word per priority
pub const SYNC_COUNTER_WORDS: usize = 2;

/// Arities packed four per word
pub const ARITY_TABLE_WORDS: usize = MAX_OVERLAY_COMMANDS / 4;

const_assert_eq!(ARITY_TABLE_WORDS * 4, MAX_OVERLAY_COMMANDS);
const_assert!(MAX_ARGS <= u8::MAX as usize);
const_assert!(MAX_OVERLAY_SLOTS <= 15);

// =============================================================================
// BOOT INFO
// =============================================================================

/// Boot block DMA'd to DMEM offset 0 before the first wake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Start of the first low-priority buffer
    pub low_stream: HostAddr,
    /// Start of the first high-priority buffer
    pub high_stream: HostAddr,
    /// Overlay dispatch table
    pub overlay_table: HostAddr,
    /// Dispatch table entries
    pub overlay_slots: u32,
    /// Syncpoint counter words, low then high
    pub sync_counters: HostAddr,
    /// Return-address stack depth per priority
    pub max_nesting: u32,
    /// DMEM word offset of overlay data
    pub state_offset: u32,
}

impl BootInfo {
    /// Encoded size in words
    pub const WORDS: usize = 8;

    /// Encode, magic first
    pub const fn to_words(&self) -> [u32; Self::WORDS] {
        [
            BOOT_MAGIC,
            self.low_stream.raw(),
            self.high_stream.raw(),
            self.overlay_table.raw(),
            self.overlay_slots,
            self.sync_counters.raw(),
            self.max_nesting,
            self.state_offset,
        ]
    }

    /// Decode, `None` when the magic does not match
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() < Self::WORDS || words[0] != BOOT_MAGIC {
            return None;
        }
        Some(Self {
            low_stream: HostAddr::new(words[1]),
            high_stream: HostAddr::new(words[2]),
            overlay_table: HostAddr::new(words[3]),
            overlay_slots: words[4],
            sync_counters: HostAddr::new(words[5]),
            max_nesting: words[6],
            state_offset: words[7],
        })
    }

    /// Address of a stream's counter word
    pub const fn counter(&self, priority: crate::types::Priority) -> HostAddr {
        self.sync_counters.offset_words(priority.index() as u32)
    }
}

// =============================================================================
// OVERLAY TABLE ENTRY
// =============================================================================

/// Dispatch table entry for one overlay slot
///
/// An all-zero entry is vacant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayEntry {
    /// Code image
    pub code_addr: HostAddr,
    /// Code image size
    pub code_words: u32,
    /// Data image; state lives in its first `state_words`
    pub data_addr: HostAddr,
    /// Data image size
    pub data_words: u32,
    /// Persistent state size
    pub state_words: u32,
    /// Declared commands
    pub command_count: u32,
    /// Packed arity table
    pub arity_table: HostAddr,
    /// Registration generation, never 0 for a live entry
    pub generation: u32,
}

impl OverlayEntry {
    /// Encoded size in words
    pub const WORDS: usize = 8;

    /// Encode
    pub const fn to_words(&self) -> [u32; Self::WORDS] {
        [
            self.code_addr.raw(),
            self.code_words,
            self.data_addr.raw(),
            self.data_words,
            self.state_words,
            self.command_count,
            self.arity_table.raw(),
            self.generation,
        ]
    }

    /// Decode
    pub fn from_words(words: &[u32; Self::WORDS]) -> Self {
        Self {
            code_addr: HostAddr::new(words[0]),
            code_words: words[1],
            data_addr: HostAddr::new(words[2]),
            data_words: words[3],
            state_words: words[4],
            command_count: words[5],
            arity_table: HostAddr::new(words[6]),
            generation: words[7],
        }
    }

    /// Vacant entries carry generation 0
    pub const fn is_vacant(&self) -> bool {
        self.generation == 0
    }
}

// =============================================================================
// ARITY TABLE
// =============================================================================

/// Pack per-command arities, four bytes per word, little end first
pub fn pack_arities(arities: &[u8]) -> Vec<u32, ARITY_TABLE_WORDS> {
    let mut words = Vec::new();
    for chunk in arities.chunks(4).take(ARITY_TABLE_WORDS) {
        let mut word = 0u32;
        for (i, &a) in chunk.iter().enumerate() {
            word |= (a as u32) << (i * 8);
        }
        let _ = words.push(word);
    }
    words
}

/// Read one arity back out of a packed table
pub fn unpack_arity(words: &[u32], command: u8) -> Option<u8> {
    let index = command as usize;
    words
        .get(index / 4)
        .map(|w| (w >> ((index % 4) * 8)) as u8)
}

// =============================================================================
// BLOCK HEADER
// =============================================================================

/// Header in front of every block body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Return-stack slot the block's own return uses
    pub level: u16,
    /// Body size including the trailing return
    pub body_words: u32,
}

impl BlockHeader {
    /// Encoded size in words
    pub const WORDS: usize = 2;

    /// Encode
    pub const fn to_words(&self) -> [u32; Self::WORDS] {
        [BLOCK_MAGIC | self.level as u32, self.body_words]
    }

    /// Decode, `None` without the block tag
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() < Self::WORDS || words[0] & 0xFFFF_0000 != BLOCK_MAGIC {
            return None;
        }
        Some(Self {
            level: words[0] as u16,
            body_words: words[1],
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn test_boot_info_words() {
        let boot = BootInfo {
            low_stream: HostAddr::new(0x1_0000),
            high_stream: HostAddr::new(0x1_2000),
            overlay_table: HostAddr::new(0x1_3000),
            overlay_slots: 15,
            sync_counters: HostAddr::new(0x1_3200),
            max_nesting: 8,
            state_offset: 256,
        };
        let words = boot.to_words();
        assert_eq!(words[0], BOOT_MAGIC);
        assert_eq!(BootInfo::from_words(&words), Some(boot));
        assert_eq!(boot.counter(Priority::High).raw(), 0x1_3204);

        let mut bad = words;
        bad[0] = 0;
        assert_eq!(BootInfo::from_words(&bad), None);
    }

    #[test]
    fn test_vacant_entry() {
        assert!(OverlayEntry::default().is_vacant());
        let entry = OverlayEntry {
            generation: 3,
            ..OverlayEntry::default()
        };
        assert!(!entry.is_vacant());
        assert_eq!(OverlayEntry::from_words(&entry.to_words()), entry);
    }

    #[test]
    fn test_arity_packing() {
        let arities = [0u8, 2, 5, 1, 63];
        let words = pack_arities(&arities);
        assert_eq!(words.len(), 2);
        for (i, &a) in arities.iter().enumerate() {
            assert_eq!(unpack_arity(&words, i as u8), Some(a));
        }
        assert_eq!(unpack_arity(&words, 5), Some(0));
        assert_eq!(unpack_arity(&words, 12), None);
    }

    #[test]
    fn test_block_header_tag() {
        let header = BlockHeader { level: 2, body_words: 6 };
        let words = header.to_words();
        assert_eq!(BlockHeader::from_words(&words), Some(header));
        assert_eq!(BlockHeader::from_words(&[0x0F00_0000, 0]), None);
    }
}
