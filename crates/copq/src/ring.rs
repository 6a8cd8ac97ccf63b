//! # Ring Buffer Writer
//!
//! Producer side of one command stream. Two equally sized buffers are used
//! in turn; when a record does not fit before the sentinel the writer
//! closes the active buffer with a jump to the other one and opens that one
//! with a fence syncpoint. Reaching the fence proves the coprocessor has
//! left the previous buffer, which gates its reuse.
//!
//! ```text
//!   buffer 0                          buffer 1
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │ fence(1) | records ...   │      │ fence(0) | records ...   │
//! │          ...      | jump ├─────▶│          ...      | jump ├──┐
//! └──────────────────────────┘      └──────────────────────────┘  │
//!        ▲                                                        │
//!        └────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are staged in a CPU-side copy of the active buffer and reach
//! main memory on [`RingWriter::commit`].

use alloc::vec;
use alloc::vec::Vec;

use copq_core::wire::{self, SyncFlags, JUMP_RECORD_WORDS, SENTINEL_RESERVE};
use copq_core::{Error, HostAddr, HostRegion, Priority, Result, Signals, SyncpointId};
use copq_hal::Coprocessor;

use crate::syncpoint::SyncpointManager;

// =============================================================================
// STATISTICS
// =============================================================================

/// Ring statistics
#[derive(Debug, Clone, Default)]
pub struct RingStats {
    /// Records appended by callers
    pub records: u64,
    /// Words written, switch records included
    pub words: u64,
    /// Buffer switches
    pub switches: u64,
    /// Waits for the coprocessor to vacate a buffer
    pub stalls: u64,
    /// Commits that published new words
    pub commits: u64,
}

// =============================================================================
// RING WRITER
// =============================================================================

/// Producer cursor over a pair of ping-ponged buffers
#[derive(Debug)]
pub struct RingWriter {
    /// Stream fed by this writer
    priority: Priority,
    /// Both buffers, equal size
    buffers: [HostRegion; 2],
    /// CPU copy of the active buffer
    shadow: Vec<u32>,
    /// Active buffer index
    active: usize,
    /// Next free word in the active buffer
    cursor: usize,
    /// Words of the active buffer already in main memory
    committed: usize,
    /// Fence whose arrival proves buffer `i` was vacated
    fences: [Option<SyncpointId>; 2],
    /// Statistics
    stats: RingStats,
}

impl RingWriter {
    /// Create a writer and publish both buffers zeroed
    pub fn new<C: Coprocessor>(priority: Priority, buffers: [HostRegion; 2], hw: &mut C) -> Self {
        debug_assert_eq!(buffers[0].words, buffers[1].words);
        let shadow = vec![0; buffers[0].words as usize];
        for buffer in &buffers {
            hw.commit(buffer.addr, &shadow);
        }
        Self {
            priority,
            buffers,
            shadow,
            active: 0,
            cursor: 0,
            committed: 0,
            fences: [None; 2],
            stats: RingStats::default(),
        }
    }

    /// Stream fed by this writer
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Where the coprocessor starts reading
    pub fn start(&self) -> HostAddr {
        self.buffers[0].addr
    }

    /// Address of the next record
    pub fn cursor_addr(&self) -> HostAddr {
        self.buffers[self.active].word(self.cursor as u32)
    }

    /// Last position a record may end at; the jump goes after it
    pub fn sentinel(&self) -> usize {
        self.shadow.len() - JUMP_RECORD_WORDS
    }

    /// Largest record this writer accepts
    pub fn max_record_words(&self) -> usize {
        self.shadow.len() - SENTINEL_RESERVE
    }

    /// Statistics
    pub fn stats(&self) -> &RingStats {
        &self.stats
    }

    /// Words staged but not yet committed
    pub fn has_pending(&self) -> bool {
        self.committed < self.cursor
    }

    /// Check whether `words` fit before the sentinel
    pub fn fits(&self, words: usize) -> bool {
        self.cursor + words <= self.sentinel()
    }

    /// Make room for a record of `words`, switching buffers if needed
    pub fn reserve<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        sync: &mut SyncpointManager,
        words: usize,
    ) -> Result<()> {
        if words > self.max_record_words() {
            return Err(Error::RecordTooLarge {
                words,
                max: self.max_record_words(),
            });
        }
        if !self.fits(words) {
            self.switch(hw, sync)?;
        }
        Ok(())
    }

    /// Append one encoded record
    pub fn append<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        sync: &mut SyncpointManager,
        record: &[u32],
    ) -> Result<()> {
        self.reserve(hw, sync, record.len())?;
        self.write(record);
        self.stats.records += 1;
        Ok(())
    }

    /// Publish staged words; false when there was nothing to publish
    pub fn commit<C: Coprocessor>(&mut self, hw: &mut C) -> bool {
        if !self.has_pending() {
            return false;
        }
        let addr = self.buffers[self.active].word(self.committed as u32);
        hw.commit(addr, &self.shadow[self.committed..self.cursor]);
        self.committed = self.cursor;
        self.stats.commits += 1;
        true
    }

    fn write(&mut self, words: &[u32]) {
        let end = self.cursor + words.len();
        self.shadow[self.cursor..end].copy_from_slice(words);
        self.cursor = end;
        self.stats.words += words.len() as u64;
    }

    fn switch<C: Coprocessor>(&mut self, hw: &mut C, sync: &mut SyncpointManager) -> Result<()> {
        let next = self.active ^ 1;

        if let Some(fence) = self.fences[next] {
            if !sync.check(hw, fence) {
                // The coprocessor is still inside the buffer we want back
                self.stats.stalls += 1;
                log::debug!(
                    "{:?} stream stalled on buffer {} (fence {:?})",
                    self.priority,
                    next,
                    fence
                );
                self.commit(hw);
                if self.priority == Priority::High {
                    hw.write_signals(Signals::HIGHPRI, Signals::empty());
                }
                hw.wake();
                sync.wait(hw, fence)?;
            }
            let zeros = vec![0u32; self.shadow.len()];
            hw.commit(self.buffers[next].addr, &zeros);
        }

        let fence = sync.allocate(self.priority)?;
        self.write(&wire::jump(self.buffers[next].addr));
        self.commit(hw);

        let left = self.active;
        self.active = next;
        self.cursor = 0;
        self.committed = 0;
        self.shadow.fill(0);

        self.write(&wire::syncpoint(fence, SyncFlags::SIGNAL));
        self.fences[left] = Some(fence);

        self.stats.switches += 1;
        log::trace!(
            "{:?} stream switched to buffer {} at {}",
            self.priority,
            next,
            self.buffers[next].addr
        );
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use copq_core::wire::{header, Builtin};
    use copq_hal::sim::SimCoprocessor;

    const NOOP: u32 = header(Builtin::Noop as u8);

    fn writer(hw: &mut SimCoprocessor) -> RingWriter {
        let buffers = [
            HostRegion::new(HostAddr::new(0x1000), 16),
            HostRegion::new(HostAddr::new(0x2000), 16),
        ];
        RingWriter::new(Priority::Low, buffers, hw)
    }

    #[test]
    fn test_append_and_commit() {
        let mut hw = SimCoprocessor::default();
        let mut sync = SyncpointManager::new(HostAddr::new(0x3000));
        let mut ring = writer(&mut hw);

        ring.append(&mut hw, &mut sync, &[NOOP]).unwrap();
        ring.append(&mut hw, &mut sync, &[0x0700_0000, 1, 0]).unwrap();
        assert!(ring.has_pending());
        assert_eq!(hw.read_ram(HostAddr::new(0x1000), 1).unwrap(), [0]);

        assert!(ring.commit(&mut hw));
        assert!(!ring.commit(&mut hw));
        assert_eq!(
            hw.read_ram(HostAddr::new(0x1000), 4).unwrap(),
            [NOOP, 0x0700_0000, 1, 0]
        );
        assert_eq!(ring.stats().records, 2);
    }

    #[test]
    fn test_switch_writes_jump_then_fence() {
        let mut hw = SimCoprocessor::default();
        let mut sync = SyncpointManager::new(HostAddr::new(0x3000));
        let mut ring = writer(&mut hw);

        // 14 words fit before the sentinel of a 16-word buffer
        for _ in 0..14 {
            ring.append(&mut hw, &mut sync, &[NOOP]).unwrap();
        }
        assert_eq!(ring.stats().switches, 0);
        ring.append(&mut hw, &mut sync, &[NOOP]).unwrap();
        assert_eq!(ring.stats().switches, 1);

        let tail = hw.read_ram(HostAddr::new(0x1000).offset_words(14), 2).unwrap();
        assert_eq!(tail, wire::jump(HostAddr::new(0x2000)));

        ring.commit(&mut hw);
        let head = hw.read_ram(HostAddr::new(0x2000), 4).unwrap();
        assert_eq!(head[0], header(Builtin::Syncpoint as u8));
        assert_eq!(SyncpointId::from_raw(head[1]).seq(), 1);
        assert_eq!(head[3], NOOP);
        assert_eq!(ring.cursor_addr(), HostAddr::new(0x2000).offset_words(4));
    }

    #[test]
    fn test_record_too_large() {
        let mut hw = SimCoprocessor::default();
        let mut sync = SyncpointManager::new(HostAddr::new(0x3000));
        let mut ring = writer(&mut hw);
        let record = [NOOP; 12];
        assert_eq!(
            ring.append(&mut hw, &mut sync, &record),
            Err(Error::RecordTooLarge { words: 12, max: 11 })
        );
        assert!(ring.append(&mut hw, &mut sync, &record[..11]).is_ok());
    }
}
