//! # COPQ Core
//!
//! Foundational types shared by the coprocessor command queue and the
//! hardware access layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        copq-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │    Wire     │  │   Layout    │  │      Error          │  │
//! │  │  (opcodes,  │  │ (boot info, │  │    Handling         │  │
//! │  │   records)  │  │  overlays)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Config    │  │   Host Memory       │  │
//! │  │ (HostAddr,  │  │ (sizes and  │  │   (region heap)     │  │
//! │  │  ids)       │  │  limits)    │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is plain data: nothing touches hardware.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod layout;
pub mod memory;
pub mod types;
pub mod wire;

// Re-exports for convenience
pub use config::QueueConfig;
pub use error::{Error, ErrorCategory, Result};
pub use memory::{HostHeap, HostRegion};
pub use types::*;
pub use wire::{Builtin, Opcode, Signals, SyncFlags};
