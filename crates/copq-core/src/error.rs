//! # COPQ Error Handling
//!
//! One error type for the whole queue stack, grouped in four categories:
//!
//! - **Configuration**: bad setup or bad use of the opcode space; surfaces
//!   synchronously at the call site.
//! - **Capacity**: a limit that can never be met (nesting, record size,
//!   host memory, syncpoint sequence space). Fatal to the current coprocessor session.
//! - **State**: an operation sequenced before its prerequisite syncpoint.
//!   Rejected, never deferred.
//! - **Hardware**: the coprocessor faulted. Fatal; the queue must be
//!   closed and recreated.
//!
//! Nothing is retried automatically.

use core::fmt;

use crate::types::HostAddr;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// COPQ Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR CATEGORY
// =============================================================================

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid configuration or opcode usage
    Configuration,
    /// A fixed limit was exceeded
    Capacity,
    /// Operation issued in the wrong state
    State,
    /// Coprocessor fault
    Hardware,
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// COPQ unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Queue configuration rejected
    InvalidConfig(&'static str),
    /// Every overlay slot is taken
    OverlayTableFull,
    /// Static registration asked for an id already in use
    OverlayIdTaken(u8),
    /// Overlay id outside the table
    InvalidOverlayId(u8),
    /// Opcode names an overlay that is not registered
    OverlayNotRegistered(u8),
    /// Opcode names a command the overlay does not declare
    UnknownCommand {
        /// Overlay id
        overlay: u8,
        /// Local command index
        command: u8,
    },
    /// Overlay declares more commands than the opcode space allows
    TooManyCommands,
    /// Argument count does not match the opcode's arity
    ArityMismatch {
        /// Opcode byte
        opcode: u8,
        /// Declared arity
        expected: usize,
        /// Supplied argument count
        found: usize,
    },
    /// Flow-control builtin that callers may not append
    ReservedOpcode(u8),
    /// Overlay image does not fit coprocessor memory
    InvalidImage(&'static str),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Block nesting exceeds the return-address stack
    NestingTooDeep {
        /// Level the block would need
        level: usize,
        /// Stack capacity
        max: usize,
    },
    /// Record can never fit in one ring buffer
    RecordTooLarge {
        /// Record size in words
        words: usize,
        /// Largest record a buffer holds
        max: usize,
    },
    /// Host memory heap exhausted
    OutOfHostMemory {
        /// Requested size in words
        words: u32,
    },
    /// Syncpoint sequence numbers used up
    SyncpointsExhausted,

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Overlay still referenced by live or in-flight content
    OverlayInUse(u8),
    /// Block still referenced by another block
    BlockReferenced,
    /// Block may still be reachable from in-flight stream content
    BlockInFlight,
    /// Handle does not name a live block
    UnknownBlock,
    /// A block is already being recorded
    BlockRecording,
    /// No block is being recorded
    NotRecording,
    /// A high-priority bracket is already open
    HighPriorityOpen,
    /// No high-priority bracket is open
    HighPriorityClosed,
    /// Syncpoints cannot be recorded into blocks
    SyncpointInBlock,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// Coprocessor met an unknown or invalid opcode
    InvalidOpcode {
        /// Opcode byte
        opcode: u8,
        /// Address of the record
        addr: HostAddr,
    },
    /// Return from an empty stack slot or call into a slot past capacity
    StackFault {
        /// Stack slot
        slot: u32,
        /// Address of the record
        addr: HostAddr,
    },
    /// DMA outside main or coprocessor memory
    DmaFault {
        /// Faulting main memory address
        addr: HostAddr,
    },
    /// Coprocessor is idle and no completion signal can arrive
    Stalled,
}

impl Error {
    /// Get the error category
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig(_)
            | Self::OverlayTableFull
            | Self::OverlayIdTaken(_)
            | Self::InvalidOverlayId(_)
            | Self::OverlayNotRegistered(_)
            | Self::UnknownCommand { .. }
            | Self::TooManyCommands
            | Self::ArityMismatch { .. }
            | Self::ReservedOpcode(_)
            | Self::InvalidImage(_) => ErrorCategory::Configuration,

            Self::NestingTooDeep { .. }
            | Self::RecordTooLarge { .. }
            | Self::OutOfHostMemory { .. }
            | Self::SyncpointsExhausted => ErrorCategory::Capacity,

            Self::OverlayInUse(_)
            | Self::BlockReferenced
            | Self::BlockInFlight
            | Self::UnknownBlock
            | Self::BlockRecording
            | Self::NotRecording
            | Self::HighPriorityOpen
            | Self::HighPriorityClosed
            | Self::SyncpointInBlock => ErrorCategory::State,

            Self::InvalidOpcode { .. } | Self::StackFault { .. } | Self::DmaFault { .. } | Self::Stalled => {
                ErrorCategory::Hardware
            },
        }
    }

    /// Fatal errors end the coprocessor session
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Capacity | ErrorCategory::Hardware
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Configuration
            Self::InvalidConfig(what) => write!(f, "invalid queue configuration: {}", what),
            Self::OverlayTableFull => write!(f, "overlay table full"),
            Self::OverlayIdTaken(id) => write!(f, "overlay id {} already registered", id),
            Self::InvalidOverlayId(id) => write!(f, "overlay id {} out of range", id),
            Self::OverlayNotRegistered(id) => write!(f, "overlay {} not registered", id),
            Self::UnknownCommand { overlay, command } => {
                write!(f, "overlay {} has no command {}", overlay, command)
            },
            Self::TooManyCommands => write!(f, "too many overlay commands"),
            Self::ArityMismatch {
                opcode,
                expected,
                found,
            } => write!(
                f,
                "opcode {:#04x} takes {} argument words, got {}",
                opcode, expected, found
            ),
            Self::ReservedOpcode(op) => write!(f, "opcode {:#04x} is reserved", op),
            Self::InvalidImage(what) => write!(f, "invalid overlay image: {}", what),

            // Capacity
            Self::NestingTooDeep { level, max } => {
                write!(f, "block nesting level {} exceeds stack of {}", level, max)
            },
            Self::RecordTooLarge { words, max } => {
                write!(f, "record of {} words exceeds buffer limit of {}", words, max)
            },
            Self::OutOfHostMemory { words } => write!(f, "out of host memory ({} words)", words),
            Self::SyncpointsExhausted => write!(f, "syncpoint sequence space exhausted"),

            // State
            Self::OverlayInUse(id) => write!(f, "overlay {} still in use", id),
            Self::BlockReferenced => write!(f, "block referenced by another block"),
            Self::BlockInFlight => write!(f, "block may still be executing"),
            Self::UnknownBlock => write!(f, "unknown block"),
            Self::BlockRecording => write!(f, "block recording in progress"),
            Self::NotRecording => write!(f, "no block recording in progress"),
            Self::HighPriorityOpen => write!(f, "high-priority bracket already open"),
            Self::HighPriorityClosed => write!(f, "no high-priority bracket open"),
            Self::SyncpointInBlock => write!(f, "syncpoints cannot be recorded in blocks"),

            // Hardware
            Self::InvalidOpcode { opcode, addr } => {
                write!(f, "coprocessor fault: invalid opcode {:#04x} at {}", opcode, addr)
            },
            Self::StackFault { slot, addr } => {
                write!(f, "coprocessor fault: return stack slot {} at {}", slot, addr)
            },
            Self::DmaFault { addr } => write!(f, "coprocessor fault: DMA at {}", addr),
            Self::Stalled => write!(f, "coprocessor stalled"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_categories() {
        assert_eq!(Error::OverlayTableFull.category(), ErrorCategory::Configuration);
        assert_eq!(
            Error::NestingTooDeep { level: 9, max: 8 }.category(),
            ErrorCategory::Capacity
        );
        assert_eq!(Error::BlockInFlight.category(), ErrorCategory::State);
        assert_eq!(Error::Stalled.category(), ErrorCategory::Hardware);
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::OverlayInUse(3).is_fatal());
        assert!(!Error::ArityMismatch { opcode: 0x11, expected: 2, found: 1 }.is_fatal());
        assert!(Error::RecordTooLarge { words: 4096, max: 1019 }.is_fatal());
        assert!(Error::SyncpointsExhausted.is_fatal());
        assert!(Error::InvalidOpcode { opcode: 0x0C, addr: HostAddr::new(0x1000) }.is_fatal());
    }

    #[test]
    fn test_display() {
        let msg = Error::ArityMismatch { opcode: 0x21, expected: 2, found: 3 }.to_string();
        assert_eq!(msg, "opcode 0x21 takes 2 argument words, got 3");
    }
}
