//! # Queue Configuration
//!
//! Sizing of the command streams, overlay table and coprocessor memories.
//! Checked once by [`QueueConfig::validate`] when a queue is created.

use crate::error::{Error, Result};
use crate::layout::{BootInfo, OverlayEntry, SYNC_COUNTER_WORDS};
use crate::types::HostAddr;
use crate::wire::SENTINEL_RESERVE;

// =============================================================================
// HARDWARE LIMITS
// =============================================================================

/// Dispatch table capacity (opcode domains 1..=15)
pub const MAX_OVERLAY_SLOTS: usize = 15;

/// Commands per overlay (low opcode nibble)
pub const MAX_OVERLAY_COMMANDS: usize = 16;

/// Deepest return-address stack the coprocessor can bank
pub const MAX_NESTING_LIMIT: usize = 16;

/// Largest argument count of any opcode
pub const MAX_ARGS: usize = 63;

/// Largest encoded record, header included
pub const MAX_RECORD_WORDS: usize = MAX_ARGS + 1;

/// Smallest ring buffer accepted
pub const MIN_BUFFER_WORDS: usize = 16;

// =============================================================================
// QUEUE CONFIGURATION
// =============================================================================

/// Command queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Words per low-priority ring buffer (two are allocated)
    pub low_buffer_words: usize,
    /// Words per high-priority ring buffer (two are allocated)
    pub high_buffer_words: usize,
    /// Overlay slots exposed to callers
    pub overlay_slots: usize,
    /// Return-address stack depth per priority
    pub max_nesting: usize,
    /// Start of the main memory window the queue allocates from
    pub heap_base: HostAddr,
    /// Size of that window in words
    pub heap_words: u32,
    /// Coprocessor instruction memory size in words
    pub imem_words: usize,
    /// Coprocessor data memory size in words
    pub dmem_words: usize,
    /// DMEM word offset where overlay data (state first) is loaded
    pub state_offset: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            low_buffer_words: 1024,
            high_buffer_words: 128,
            overlay_slots: MAX_OVERLAY_SLOTS,
            max_nesting: 8,
            heap_base: HostAddr::new(0x0001_0000),
            heap_words: 64 * 1024,
            imem_words: 1024,
            dmem_words: 1024,
            state_offset: 256,
        }
    }
}

impl QueueConfig {
    /// Largest record either stream can hold in one buffer
    pub fn max_record_words(&self) -> usize {
        self.low_buffer_words.min(self.high_buffer_words) - SENTINEL_RESERVE
    }

    /// Words of overlay data DMEM can hold
    pub fn overlay_data_words(&self) -> usize {
        self.dmem_words - self.state_offset
    }

    /// Check every field against the hardware limits
    pub fn validate(&self) -> Result<()> {
        if self.low_buffer_words < MIN_BUFFER_WORDS || self.high_buffer_words < MIN_BUFFER_WORDS {
            return Err(Error::InvalidConfig("ring buffer too small"));
        }
        if self.overlay_slots == 0 || self.overlay_slots > MAX_OVERLAY_SLOTS {
            return Err(Error::InvalidConfig("overlay slot count out of range"));
        }
        if self.max_nesting == 0 || self.max_nesting > MAX_NESTING_LIMIT {
            return Err(Error::InvalidConfig("nesting depth out of range"));
        }
        if self.heap_base.is_null() || !self.heap_base.is_aligned() {
            return Err(Error::InvalidConfig("heap base must be non-null and word aligned"));
        }
        if self.imem_words == 0 {
            return Err(Error::InvalidConfig("instruction memory is empty"));
        }
        if self.state_offset < BootInfo::WORDS || self.state_offset >= self.dmem_words {
            return Err(Error::InvalidConfig("state offset outside data memory"));
        }

        let fixed = 2 * (self.low_buffer_words + self.high_buffer_words)
            + self.overlay_slots * OverlayEntry::WORDS
            + SYNC_COUNTER_WORDS
            + BootInfo::WORDS;
        if fixed > self.heap_words as usize {
            return Err(Error::InvalidConfig("heap cannot hold the queue's fixed structures"));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_record_words(), 128 - SENTINEL_RESERVE);
    }

    #[test]
    fn test_rejects_bad_limits() {
        let mut config = QueueConfig::default();
        config.overlay_slots = 16;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = QueueConfig::default();
        config.max_nesting = 0;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.high_buffer_words = 8;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.state_offset = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_small_heap() {
        let config = QueueConfig {
            heap_words: 256,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
