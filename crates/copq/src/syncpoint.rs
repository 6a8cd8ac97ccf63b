//! # Syncpoint Manager
//!
//! Completion tokens the coprocessor advances past. Sequence numbers come
//! from one counter shared by both streams; each stream has its own counter
//! word in main memory that the coprocessor overwrites with the sequence
//! number of every syncpoint record it executes. Within one stream those
//! records appear in issue order, so the counter never decreases.

use copq_core::{Error, HostAddr, Priority, Result, SyncpointId};
use copq_hal::Coprocessor;

// =============================================================================
// USE MARKS
// =============================================================================

/// Per-stream point after which a resource is no longer referenced
///
/// A mark holds the first sequence number allocated after the last use on
/// that stream. The use is consumed once the stream's counter reaches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UseMarks([Option<u32>; 2]);

impl UseMarks {
    /// Record a use on `priority` followed by sequence `threshold`
    pub fn mark(&mut self, priority: Priority, threshold: u32) {
        let slot = &mut self.0[priority.index()];
        *slot = Some(slot.map_or(threshold, |t| t.max(threshold)));
    }

    /// Threshold for one stream
    pub fn threshold(&self, priority: Priority) -> Option<u32> {
        self.0[priority.index()]
    }

    /// Never used
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

// =============================================================================
// SYNCPOINT MANAGER
// =============================================================================

/// Issues syncpoint ids and observes the stream counters
#[derive(Debug)]
pub struct SyncpointManager {
    /// Counter words, low then high
    counters: HostAddr,
    /// Next sequence number
    next_seq: u32,
    /// Last counter value read per stream
    reached: [u32; 2],
    /// Ids handed out
    issued: u64,
}

impl SyncpointManager {
    /// Create a manager over the counter block
    pub fn new(counters: HostAddr) -> Self {
        Self {
            counters,
            next_seq: 1,
            reached: [0; 2],
            issued: 0,
        }
    }

    /// Counter block address
    pub fn counters(&self) -> HostAddr {
        self.counters
    }

    /// Sequence number the next syncpoint will get
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Ids handed out so far
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Take the next id for a stream
    ///
    /// The caller must append the matching record before any other
    /// syncpoint record goes into the same stream. Sequence numbers are
    /// never reused; once they run out every allocation fails.
    pub fn allocate(&mut self, priority: Priority) -> Result<SyncpointId> {
        if self.next_seq > SyncpointId::MAX_SEQ {
            log::error!("syncpoint sequence space exhausted after {} ids", self.issued);
            return Err(Error::SyncpointsExhausted);
        }
        let id = SyncpointId::new(priority, self.next_seq);
        self.next_seq += 1;
        self.issued += 1;
        Ok(id)
    }

    /// Read a stream's counter
    pub fn counter<C: Coprocessor>(&mut self, hw: &mut C, priority: Priority) -> u32 {
        let mut word = [0u32; 1];
        hw.fetch(self.counters.offset_words(priority.index() as u32), &mut word);
        let reached = &mut self.reached[priority.index()];
        *reached = (*reached).max(word[0]);
        *reached
    }

    /// Non-blocking completion check
    pub fn check<C: Coprocessor>(&mut self, hw: &mut C, id: SyncpointId) -> bool {
        let p = id.priority();
        id.seq() <= self.reached[p.index()] || id.seq() <= self.counter(hw, p)
    }

    /// Sleep on the completion interrupt until `id` is reached
    ///
    /// The stream holding the record must already be flushed.
    pub fn wait<C: Coprocessor>(&mut self, hw: &mut C, id: SyncpointId) -> Result<()> {
        if id.seq() >= self.next_seq {
            log::warn!("waiting on syncpoint {:?} that was never issued", id);
        }
        while !self.check(hw, id) {
            hw.wait_interrupt()?;
        }
        Ok(())
    }

    /// Check that every marked use has been consumed
    pub fn consumed<C: Coprocessor>(&mut self, hw: &mut C, marks: &UseMarks) -> bool {
        Priority::ALL.iter().all(|&p| match marks.threshold(p) {
            Some(t) => t <= self.reached[p.index()] || t <= self.counter(hw, p),
            None => true,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use copq_hal::sim::SimCoprocessor;

    const COUNTERS: HostAddr = HostAddr::new(0x8000);

    #[test]
    fn test_ids_increase_across_streams() {
        let mut sync = SyncpointManager::new(COUNTERS);
        let a = sync.allocate(Priority::Low).unwrap();
        let b = sync.allocate(Priority::High).unwrap();
        let c = sync.allocate(Priority::Low).unwrap();
        assert!(a.seq() < b.seq() && b.seq() < c.seq());
        assert_eq!(b.priority(), Priority::High);
        assert_eq!(sync.issued(), 3);
    }

    #[test]
    fn test_sequence_exhaustion_is_fatal() {
        let mut sync = SyncpointManager::new(COUNTERS);
        sync.next_seq = SyncpointId::MAX_SEQ;
        let last = sync.allocate(Priority::High).unwrap();
        assert_eq!(last.seq(), SyncpointId::MAX_SEQ);
        assert_eq!(last.priority(), Priority::High);

        let err = sync.allocate(Priority::Low).unwrap_err();
        assert_eq!(err, Error::SyncpointsExhausted);
        assert!(err.is_fatal());
        // No wrap back to low sequence numbers
        assert_eq!(sync.allocate(Priority::High), Err(Error::SyncpointsExhausted));
        assert_eq!(sync.issued(), 1);
    }

    #[test]
    fn test_check_reads_stream_counter() {
        let mut hw = SimCoprocessor::default();
        let mut sync = SyncpointManager::new(COUNTERS);
        let low = sync.allocate(Priority::Low).unwrap();
        let high = sync.allocate(Priority::High).unwrap();
        assert!(!sync.check(&mut hw, low));

        hw.commit(COUNTERS, &[low.seq(), 0]);
        assert!(sync.check(&mut hw, low));
        assert!(!sync.check(&mut hw, high));

        // Cached value keeps the answer monotonic
        hw.commit(COUNTERS, &[0, 0]);
        assert!(sync.check(&mut hw, low));
    }

    #[test]
    fn test_use_marks() {
        let mut hw = SimCoprocessor::default();
        let mut sync = SyncpointManager::new(COUNTERS);
        let mut marks = UseMarks::default();
        assert!(marks.is_empty());
        assert!(sync.consumed(&mut hw, &marks));

        marks.mark(Priority::High, 3);
        marks.mark(Priority::High, 2);
        assert_eq!(marks.threshold(Priority::High), Some(3));
        assert!(!sync.consumed(&mut hw, &marks));

        hw.commit(COUNTERS, &[0, 3]);
        assert!(sync.consumed(&mut hw, &marks));
    }
}
