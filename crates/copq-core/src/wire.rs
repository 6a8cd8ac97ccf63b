//! # Command Stream Wire Format
//!
//! A record is a header word carrying the opcode in its top byte, followed
//! by `arity` 32-bit argument words. The opcode's high nibble selects the
//! domain (0 = builtin, 1..=15 = overlay id), the low nibble the command.
//!
//! ```text
//!  31      24 23                    0
//! ┌──────────┬───────────────────────┐
//! │  opcode  │        (zero)         │  header
//! ├──────────┴───────────────────────┤
//! │            argument 0            │
//! ├──────────────────────────────────┤
//! │               ...                │
//! └──────────────────────────────────┘
//! ```
//!
//! A zero word decodes as `WaitInput`, so unwritten buffer space halts the
//! coprocessor until it is woken.

use bitflags::bitflags;
use heapless::Vec;

use crate::config::{MAX_ARGS, MAX_RECORD_WORDS};
use crate::error::{Error, Result};
use crate::types::{HostAddr, OverlayId, SyncpointId};

// =============================================================================
// BUILTINS
// =============================================================================

/// Builtin opcodes (domain 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Builtin {
    /// Halt until woken
    WaitInput       = 0x00,
    /// No operation
    Noop            = 0x01,
    /// Continue at target
    Jump            = 0x02,
    /// Push return address into a stack slot and jump
    Call            = 0x03,
    /// Return through a stack slot
    Ret             = 0x04,
    /// Main memory to DMEM
    DmaIn           = 0x05,
    /// DMEM to main memory
    DmaOut          = 0x06,
    /// Set and clear signal bits
    WriteStatus     = 0x07,
    /// Wait until masked signals clear, then set signals
    TestWriteStatus = 0x08,
    /// Return from the high-priority stream when it is drained
    SwapBuffers     = 0x09,
    /// Store a syncpoint id in its stream counter
    Syncpoint       = 0x0A,
    /// Poison marker, always faults
    Invalid         = 0x0F,
}

impl Builtin {
    /// Decode a domain-0 opcode byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::WaitInput,
            0x01 => Self::Noop,
            0x02 => Self::Jump,
            0x03 => Self::Call,
            0x04 => Self::Ret,
            0x05 => Self::DmaIn,
            0x06 => Self::DmaOut,
            0x07 => Self::WriteStatus,
            0x08 => Self::TestWriteStatus,
            0x09 => Self::SwapBuffers,
            0x0A => Self::Syncpoint,
            0x0F => Self::Invalid,
            _ => return None,
        })
    }

    /// Argument words following the header
    pub const fn arity(self) -> usize {
        match self {
            Self::WaitInput | Self::Noop | Self::SwapBuffers | Self::Invalid => 0,
            Self::Jump | Self::Ret => 1,
            Self::Call | Self::WriteStatus | Self::TestWriteStatus | Self::Syncpoint => 2,
            Self::DmaIn | Self::DmaOut => 3,
        }
    }

    /// Builtins callers may append; the rest drive stream flow
    pub const fn is_user_appendable(self) -> bool {
        matches!(
            self,
            Self::Noop | Self::DmaIn | Self::DmaOut | Self::WriteStatus | Self::TestWriteStatus
        )
    }
}

// =============================================================================
// OPCODE
// =============================================================================

/// Decoded opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Domain 0
    Builtin(Builtin),
    /// Overlay command
    Overlay {
        /// Owning overlay
        id: OverlayId,
        /// Command index inside the overlay
        command: u8,
    },
}

impl Opcode {
    /// Opcode for an overlay command
    pub const fn overlay(id: OverlayId, command: u8) -> Self {
        Self::Overlay {
            id,
            command: command & 0x0F,
        }
    }

    /// Decode an opcode byte, `None` for undefined builtins
    pub const fn decode(byte: u8) -> Option<Self> {
        match OverlayId::new(byte >> 4) {
            Some(id) => Some(Self::Overlay {
                id,
                command: byte & 0x0F,
            }),
            None => match Builtin::from_byte(byte) {
                Some(b) => Some(Self::Builtin(b)),
                None => None,
            },
        }
    }

    /// Encode to the opcode byte
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Builtin(b) => b as u8,
            Self::Overlay { id, command } => (id.raw() << 4) | (command & 0x0F),
        }
    }

    /// Header word for this opcode
    pub const fn header(self) -> u32 {
        header(self.to_byte())
    }
}

impl From<Builtin> for Opcode {
    fn from(b: Builtin) -> Self {
        Self::Builtin(b)
    }
}

/// Header word for an opcode byte
#[inline]
pub const fn header(opcode: u8) -> u32 {
    (opcode as u32) << 24
}

/// Opcode byte carried by a header word
#[inline]
pub const fn opcode_of(word: u32) -> u8 {
    (word >> 24) as u8
}

// =============================================================================
// SIGNALS
// =============================================================================

bitflags! {
    /// Coprocessor signal bits shared with the CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u32 {
        /// High-priority stream has pending work
        const HIGHPRI   = 1 << 0;
        /// Raises the CPU interrupt instead of being stored
        const INTERRUPT = 1 << 1;
        /// Free for collaborators
        const USER0     = 1 << 4;
        /// Free for collaborators
        const USER1     = 1 << 5;
        /// Free for collaborators
        const USER2     = 1 << 6;
        /// Free for collaborators
        const USER3     = 1 << 7;
    }
}

bitflags! {
    /// Syncpoint record flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        /// Raise the completion interrupt after storing the counter
        const SIGNAL = 1 << 0;
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// One encoded record
pub type Record = Vec<u32, MAX_RECORD_WORDS>;

/// Words of a syncpoint record
pub const SYNCPOINT_RECORD_WORDS: usize = 1 + Builtin::Syncpoint.arity();

/// Words of a jump record
pub const JUMP_RECORD_WORDS: usize = 1 + Builtin::Jump.arity();

/// Space kept free at the end of every ring buffer for the switch records
pub const SENTINEL_RESERVE: usize = SYNCPOINT_RECORD_WORDS + JUMP_RECORD_WORDS;

/// Encode a record from an opcode byte and its arguments
pub fn encode(opcode: u8, args: &[u32]) -> Result<Record> {
    if args.len() > MAX_ARGS {
        return Err(Error::RecordTooLarge {
            words: args.len() + 1,
            max: MAX_RECORD_WORDS,
        });
    }
    let mut record = Record::new();
    // Capacity checked above
    let _ = record.push(header(opcode));
    let _ = record.extend_from_slice(args);
    Ok(record)
}

/// Jump record
pub const fn jump(target: HostAddr) -> [u32; JUMP_RECORD_WORDS] {
    [header(Builtin::Jump as u8), target.raw()]
}

/// Call record
pub const fn call(target: HostAddr, slot: u32) -> [u32; 3] {
    [header(Builtin::Call as u8), target.raw(), slot]
}

/// Return record
pub const fn ret(slot: u32) -> [u32; 2] {
    [header(Builtin::Ret as u8), slot]
}

/// Syncpoint record
pub const fn syncpoint(id: SyncpointId, flags: SyncFlags) -> [u32; SYNCPOINT_RECORD_WORDS] {
    [header(Builtin::Syncpoint as u8), id.raw(), flags.bits()]
}

/// Buffer swap record
pub const fn swap_buffers() -> [u32; 1] {
    [header(Builtin::SwapBuffers as u8)]
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn test_zero_word_is_wait_input() {
        assert_eq!(
            Opcode::decode(opcode_of(0)),
            Some(Opcode::Builtin(Builtin::WaitInput))
        );
    }

    #[test]
    fn test_overlay_opcode_nibbles() {
        let id = OverlayId::new(3).unwrap();
        let op = Opcode::overlay(id, 5);
        assert_eq!(op.to_byte(), 0x35);
        assert_eq!(op.header(), 0x3500_0000);
        assert_eq!(Opcode::decode(0x35), Some(op));
    }

    #[test]
    fn test_undefined_builtins() {
        for byte in [0x0B, 0x0C, 0x0D, 0x0E] {
            assert_eq!(Opcode::decode(byte), None);
        }
        assert_eq!(Opcode::decode(0x0F), Some(Opcode::Builtin(Builtin::Invalid)));
    }

    #[test]
    fn test_reserved_builtins() {
        assert!(Builtin::Noop.is_user_appendable());
        assert!(Builtin::DmaOut.is_user_appendable());
        for b in [
            Builtin::WaitInput,
            Builtin::Jump,
            Builtin::Call,
            Builtin::Ret,
            Builtin::SwapBuffers,
            Builtin::Syncpoint,
            Builtin::Invalid,
        ] {
            assert!(!b.is_user_appendable());
        }
    }

    #[test]
    fn test_encode_record() {
        let record = encode(0x05, &[0x1000, 16, 8]).unwrap();
        assert_eq!(record.as_slice(), &[0x0500_0000, 0x1000, 16, 8]);

        let too_many = [0u32; MAX_ARGS + 1];
        assert!(matches!(
            encode(0x11, &too_many),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_sentinel_reserve_covers_switch() {
        assert_eq!(SENTINEL_RESERVE, 5);
        let id = SyncpointId::new(Priority::High, 2);
        let words = syncpoint(id, SyncFlags::SIGNAL);
        assert_eq!(words[1], id.raw());
        assert_eq!(words[2], 1);
    }
}
