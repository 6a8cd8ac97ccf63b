//! # High-Priority Sub-Queue
//!
//! Bracket state for the pre-empting stream. While a bracket is open every
//! append goes to the high-priority writer. Closing a non-empty bracket
//! appends a drain syncpoint and a buffer swap, then raises
//! `Signals::HIGHPRI`; the coprocessor notices the signal at its next
//! low-stream record boundary, drains the high stream and returns to the
//! low stream where it stopped.

use copq_core::{Error, Result, SyncpointId};

/// High-priority bracket tracking
#[derive(Debug, Default)]
pub struct HighPriority {
    /// Bracket open
    open: bool,
    /// High-writer record count when the bracket opened
    records_at_begin: u64,
    /// Drain syncpoint of the last non-empty bracket
    last_drain: Option<SyncpointId>,
    /// Non-empty brackets closed
    brackets: u64,
}

impl HighPriority {
    /// Create closed
    pub fn new() -> Self {
        Self::default()
    }

    /// Bracket open
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open a bracket; `records` is the high writer's current record count
    pub fn begin(&mut self, records: u64) -> Result<()> {
        if self.open {
            return Err(Error::HighPriorityOpen);
        }
        self.open = true;
        self.records_at_begin = records;
        Ok(())
    }

    /// Close the bracket; true when it holds records that must be drained
    pub fn end(&mut self, records: u64) -> Result<bool> {
        if !self.open {
            return Err(Error::HighPriorityClosed);
        }
        self.open = false;
        Ok(records > self.records_at_begin)
    }

    /// Remember the drain syncpoint of a closed bracket
    pub fn drained_by(&mut self, drain: SyncpointId) {
        self.last_drain = Some(drain);
        self.brackets += 1;
    }

    /// Drain syncpoint of the last non-empty bracket
    pub fn last_drain(&self) -> Option<SyncpointId> {
        self.last_drain
    }

    /// Non-empty brackets closed so far
    pub fn brackets(&self) -> u64 {
        self.brackets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copq_core::Priority;

    #[test]
    fn test_bracket_pairing() {
        let mut hp = HighPriority::new();
        assert_eq!(hp.end(0), Err(Error::HighPriorityClosed));
        hp.begin(4).unwrap();
        assert_eq!(hp.begin(4), Err(Error::HighPriorityOpen));
        assert!(hp.is_open());
        assert_eq!(hp.end(4), Ok(false));
        assert!(!hp.is_open());
    }

    #[test]
    fn test_drain_tracking() {
        let mut hp = HighPriority::new();
        hp.begin(0).unwrap();
        assert_eq!(hp.end(2), Ok(true));
        let drain = SyncpointId::new(Priority::High, 9);
        hp.drained_by(drain);
        assert_eq!(hp.last_drain(), Some(drain));
        assert_eq!(hp.brackets(), 1);
    }
}
