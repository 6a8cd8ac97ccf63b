//! # Status Register

use bitflags::bitflags;

bitflags! {
    /// Coprocessor status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Status: u32 {
        /// Halted, waiting to be woken
        const HALTED    = 1 << 0;
        /// Stopped on a fault
        const BROKE     = 1 << 1;
        /// Executing the command stream
        const BUSY      = 1 << 2;
        /// DMA engine busy
        const DMA_BUSY  = 1 << 3;
        /// DMA request queue full
        const DMA_FULL  = 1 << 4;
        /// Completion interrupt pending
        const INTERRUPT = 1 << 5;
    }
}

impl Status {
    /// Neither executing nor moving data
    pub const fn is_idle(self) -> bool {
        !self.intersects(Self::BUSY.union(Self::DMA_BUSY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle() {
        assert!(Status::HALTED.is_idle());
        assert!(!(Status::HALTED | Status::DMA_BUSY).is_idle());
        assert!(!Status::BUSY.is_idle());
    }
}
