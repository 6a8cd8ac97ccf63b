//! # COPQ Hardware Access
//!
//! The capability the command queue consumes to reach the coprocessor:
//! cache maintenance on main memory, DMA into the coprocessor's private
//! memories, status and signal registers, wake and interrupt wait.
//!
//! ## Components
//!
//! - [`Coprocessor`]: the capability trait
//! - [`Status`]: status register bits
//! - [`DmaRequest`]: one DMA transfer
//! - `sim` (feature `sim`): software coprocessor that executes the
//!   command stream, used by the queue's tests

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod dma;
pub mod status;

#[cfg(feature = "sim")]
pub mod sim;

pub use dma::{CoprocMemory, DmaDirection, DmaMode, DmaRequest};
pub use status::Status;

use copq_core::{HostAddr, Result, Signals};

// =============================================================================
// COPROCESSOR CAPABILITY
// =============================================================================

/// Access to one coprocessor
///
/// Implemented by the platform layer; the queue owns exactly one.
pub trait Coprocessor {
    /// Write CPU words back to main memory so the coprocessor sees them
    fn commit(&mut self, addr: HostAddr, words: &[u32]);

    /// Invalidate and read main memory words the coprocessor wrote
    fn fetch(&mut self, addr: HostAddr, words: &mut [u32]);

    /// Start a DMA transfer; `DmaMode::Sync` returns once it completed
    fn dma(&mut self, request: &DmaRequest) -> Result<()>;

    /// Read the status register
    fn status(&mut self) -> Status;

    /// Set then clear signal bits
    fn write_signals(&mut self, set: Signals, clear: Signals);

    /// Resume a coprocessor halted on `WaitInput`
    ///
    /// Execution resumes only after any outstanding DMA has landed.
    fn wake(&mut self);

    /// Suspend until the coprocessor raises its completion interrupt
    ///
    /// Fails with a hardware error if the coprocessor faulted.
    fn wait_interrupt(&mut self) -> Result<()>;

    /// Halt the coprocessor and drop its internal state
    fn reset(&mut self);
}
