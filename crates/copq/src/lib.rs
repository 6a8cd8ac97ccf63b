//! # COPQ - Coprocessor Command Queue
//!
//! Host-side dispatch layer for a small coprocessor with private
//! instruction and data memories. Callers append encoded records to a
//! command stream in main memory; the coprocessor fetches and executes
//! them asynchronously.
//!
//! ## Components
//!
//! - [`ring`]: double-buffered stream writer with fence-gated reuse
//! - [`overlay`]: dispatch table of swappable microcode overlays
//! - [`block`]: recorded, replayable record sequences
//! - [`syncpoint`]: completion tokens
//! - [`highpri`]: pre-empting high-priority stream
//! - [`queue`]: the context object tying them together
//!
//! ```text
//!  caller ──append──▶ Queue ──▶ RingWriter (low | high) ──commit──▶ main memory
//!                       │                                             │
//!                       ├──▶ BlockRecorder ──block_end──▶ block image │
//!                       │                                             ▼
//!                       └──wake──────────────────────────────▶ coprocessor
//!                                                                     │
//!            syncpoint_check / wait ◀── counters + interrupt ─────────┘
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod block;
pub mod highpri;
pub mod overlay;
pub mod queue;
pub mod ring;
pub mod syncpoint;

pub use overlay::{OverlayDescriptor, StateRegion};
pub use queue::{Queue, QueueStats};
pub use ring::RingStats;
pub use syncpoint::UseMarks;

pub use copq_core::{
    BlockHandle, Builtin, Error, ErrorCategory, HostAddr, Opcode, OverlayId, Priority, QueueConfig,
    Result, Signals, SyncpointId,
};
pub use copq_hal::{Coprocessor, Status};
