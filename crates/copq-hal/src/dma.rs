//! # DMA Requests
//!
//! Transfers between main memory and the coprocessor's instruction (IMEM)
//! and data (DMEM) memories. Offsets and lengths are in words.

use copq_core::HostAddr;

/// Coprocessor-private memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoprocMemory {
    /// Instruction memory
    Imem,
    /// Data memory
    Dmem,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Main memory into the coprocessor
    ToCoprocessor,
    /// Coprocessor back to main memory
    ToHost,
}

/// Completion behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaMode {
    /// Return once the transfer finished
    Sync,
    /// Return immediately; `Status::DMA_BUSY` clears on completion
    Async,
}

/// One DMA transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    /// Main memory address
    pub host: HostAddr,
    /// Coprocessor memory
    pub memory: CoprocMemory,
    /// Word offset in coprocessor memory
    pub offset: usize,
    /// Length in words
    pub words: usize,
    /// Direction
    pub direction: DmaDirection,
    /// Completion behaviour
    pub mode: DmaMode,
}

impl DmaRequest {
    /// Synchronous upload into DMEM
    pub const fn to_dmem(host: HostAddr, offset: usize, words: usize) -> Self {
        Self {
            host,
            memory: CoprocMemory::Dmem,
            offset,
            words,
            direction: DmaDirection::ToCoprocessor,
            mode: DmaMode::Sync,
        }
    }

    /// Same transfer, asynchronous
    pub const fn asynchronous(mut self) -> Self {
        self.mode = DmaMode::Async;
        self
    }
}
