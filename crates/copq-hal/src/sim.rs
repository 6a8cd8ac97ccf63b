//! # Software Coprocessor
//!
//! An instruction-level model of the coprocessor that executes the command
//! stream out of a simulated main memory. It follows the same contract as
//! the hardware: it boots from the block at DMEM offset 0, halts on a zero
//! word, swaps overlays on demand, banks its return stack per priority and
//! drains the high-priority stream when `Signals::HIGHPRI` is raised.
//!
//! The model runs only when asked to: inside [`Coprocessor::wait_interrupt`],
//! through [`SimCoprocessor::run`], or on every wake in eager mode. Where
//! real hardware would hang forever it reports [`Error::Stalled`].
//!
//! Asynchronous DMA stays outstanding, with `Status::DMA_BUSY` set, until
//! the next wake, step or DMA request. The engine queues one transfer.
//!
//! Overlay commands have no microcode to run; tests attach handlers that
//! receive the arguments and the overlay's persistent state.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use spin::Mutex;

use copq_core::config::MAX_NESTING_LIMIT;
use copq_core::layout::{unpack_arity, BootInfo, OverlayEntry, ARITY_TABLE_WORDS};
use copq_core::wire::{opcode_of, Builtin, Opcode, Signals, SyncFlags};
use copq_core::{Error, HostAddr, OverlayId, Priority, Result, SyncpointId};

use crate::dma::{CoprocMemory, DmaDirection, DmaMode, DmaRequest};
use crate::status::Status;
use crate::Coprocessor;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Software model configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Simulated main memory in words, starting at address 0
    pub ram_words: usize,
    /// Instruction memory in words
    pub imem_words: usize,
    /// Data memory in words
    pub dmem_words: usize,
    /// Records executed per run before declaring a stall
    pub step_budget: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ram_words: 128 * 1024,
            imem_words: 1024,
            dmem_words: 1024,
            step_budget: 1_000_000,
        }
    }
}

// =============================================================================
// EXECUTION LOG
// =============================================================================

/// Overlay command handler: arguments, persistent state
pub type CommandHandler = Box<dyn FnMut(&[u32], &mut [u32]) + Send>;

/// One executed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    /// Opcode byte
    pub opcode: u8,
    /// Argument words
    pub args: Vec<u32>,
    /// Stream it was fetched from
    pub priority: Priority,
    /// Address of the header word
    pub addr: HostAddr,
}

impl Executed {
    /// Builtin opcode, if any
    pub fn builtin(&self) -> Option<Builtin> {
        match Opcode::decode(self.opcode) {
            Some(Opcode::Builtin(b)) => Some(b),
            _ => None,
        }
    }

    /// Records that only steer the stream
    pub fn is_flow_control(&self) -> bool {
        matches!(
            self.builtin(),
            Some(Builtin::Jump | Builtin::Call | Builtin::Ret | Builtin::SwapBuffers)
        )
    }
}

/// Model statistics
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Records executed
    pub steps: u64,
    /// Commit calls
    pub commits: u64,
    /// Wake calls
    pub wakes: u64,
    /// Overlay loads
    pub overlay_loads: u64,
    /// CPU-initiated DMA requests
    pub dma_requests: u64,
    /// Interrupts delivered
    pub interrupts: u64,
}

// =============================================================================
// MODEL STATE
// =============================================================================

type ReturnStack = ArrayVec<Option<HostAddr>, MAX_NESTING_LIMIT>;

struct SimState {
    config: SimConfig,
    ram: Vec<u32>,
    imem: Vec<u32>,
    dmem: Vec<u32>,
    boot: Option<BootInfo>,
    halted: bool,
    fault: Option<Error>,
    signals: Signals,
    interrupt: bool,
    eager: bool,
    pc: [HostAddr; 2],
    current: Priority,
    stacks: [ReturnStack; 2],
    loaded: Option<(OverlayId, u32)>,
    pending_dma: Option<DmaRequest>,
    log: Vec<Executed>,
    handlers: HashMap<u8, CommandHandler>,
    stats: SimStats,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            ram: vec![0; config.ram_words],
            imem: vec![0; config.imem_words],
            dmem: vec![0; config.dmem_words],
            config,
            boot: None,
            halted: true,
            fault: None,
            signals: Signals::empty(),
            interrupt: false,
            eager: false,
            pc: [HostAddr::null(); 2],
            current: Priority::Low,
            stacks: [ArrayVec::new(), ArrayVec::new()],
            loaded: None,
            pending_dma: None,
            log: Vec::new(),
            handlers: HashMap::new(),
            stats: SimStats::default(),
        }
    }

    fn reset(&mut self) {
        self.imem.fill(0);
        self.dmem.fill(0);
        self.boot = None;
        self.halted = true;
        self.fault = None;
        self.signals = Signals::empty();
        self.interrupt = false;
        self.pc = [HostAddr::null(); 2];
        self.current = Priority::Low;
        self.stacks = [ArrayVec::new(), ArrayVec::new()];
        self.loaded = None;
        self.pending_dma = None;
        self.log.clear();
    }

    fn status(&self) -> Status {
        let mut status = Status::empty();
        if self.fault.is_some() {
            status |= Status::BROKE;
        } else if self.halted {
            status |= Status::HALTED;
        } else {
            status |= Status::BUSY;
        }
        if self.pending_dma.is_some() {
            status |= Status::DMA_BUSY | Status::DMA_FULL;
        }
        if self.interrupt {
            status |= Status::INTERRUPT;
        }
        status
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn ram_index(&self, addr: HostAddr, words: usize) -> Option<usize> {
        let start = addr.word_index();
        (addr.is_aligned() && start + words <= self.ram.len()).then_some(start)
    }

    fn read_word(&self, addr: HostAddr) -> Result<u32> {
        self.ram_index(addr, 1)
            .map(|i| self.ram[i])
            .ok_or(Error::DmaFault { addr })
    }

    fn read_words(&self, addr: HostAddr, words: usize) -> Result<Vec<u32>> {
        let start = self.ram_index(addr, words).ok_or(Error::DmaFault { addr })?;
        Ok(self.ram[start..start + words].to_vec())
    }

    fn dma_words(
        &mut self,
        host: HostAddr,
        memory: CoprocMemory,
        offset: usize,
        words: usize,
        direction: DmaDirection,
    ) -> Result<()> {
        let start = self
            .ram_index(host, words)
            .ok_or(Error::DmaFault { addr: host })?;
        let target = match memory {
            CoprocMemory::Imem => &mut self.imem,
            CoprocMemory::Dmem => &mut self.dmem,
        };
        if offset + words > target.len() {
            return Err(Error::DmaFault { addr: host });
        }
        match direction {
            DmaDirection::ToCoprocessor => {
                target[offset..offset + words].copy_from_slice(&self.ram[start..start + words]);
            },
            DmaDirection::ToHost => {
                self.ram[start..start + words].copy_from_slice(&target[offset..offset + words]);
            },
        }
        Ok(())
    }

    fn transfer(&mut self, request: &DmaRequest) -> Result<()> {
        self.dma_words(
            request.host,
            request.memory,
            request.offset,
            request.words,
            request.direction,
        )
    }

    /// Complete the outstanding asynchronous transfer, if any
    fn drain_dma(&mut self) -> Result<()> {
        match self.pending_dma.take() {
            Some(request) => self.transfer(&request).map_err(|err| {
                log::error!("sim: asynchronous DMA fault: {}", err);
                self.fault = Some(err);
                err
            }),
            None => Ok(()),
        }
    }

    fn apply_signals(&mut self, set: Signals, clear: Signals) {
        self.signals = self.signals.difference(clear).union(set);
        if self.signals.contains(Signals::INTERRUPT) {
            self.signals.remove(Signals::INTERRUPT);
            self.interrupt = true;
        }
    }

    // =========================================================================
    // Boot
    // =========================================================================

    fn try_boot(&mut self) -> bool {
        let Some(boot) = BootInfo::from_words(&self.dmem) else {
            log::error!("sim: wake without a boot block in DMEM");
            return false;
        };
        let depth = (boot.max_nesting as usize).min(MAX_NESTING_LIMIT);
        for stack in &mut self.stacks {
            stack.clear();
            stack.extend(core::iter::repeat(None).take(depth));
        }
        self.pc = [boot.low_stream, boot.high_stream];
        self.current = Priority::Low;
        self.boot = Some(boot);
        log::info!(
            "sim: booted, low stream at {}, high stream at {}",
            boot.low_stream,
            boot.high_stream
        );
        true
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute one record; false when halted or faulted
    fn step(&mut self) -> bool {
        if self.halted || self.fault.is_some() || self.drain_dma().is_err() {
            return false;
        }
        let Some(boot) = self.boot else {
            self.halted = true;
            return false;
        };
        match self.execute(&boot) {
            Ok(progress) => progress,
            Err(err) => {
                log::error!("sim: coprocessor fault: {}", err);
                self.fault = Some(err);
                false
            },
        }
    }

    fn run_to_halt(&mut self) -> Result<()> {
        for _ in 0..self.config.step_budget {
            if !self.step() {
                return match self.fault {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
        }
        Err(Error::Stalled)
    }

    fn execute(&mut self, boot: &BootInfo) -> Result<bool> {
        // High-priority work is picked up at low-stream record boundaries
        if self.current == Priority::Low && self.signals.contains(Signals::HIGHPRI) {
            self.signals.remove(Signals::HIGHPRI);
            let head = self.read_word(self.pc[Priority::High.index()])?;
            if opcode_of(head) != Builtin::WaitInput as u8 {
                self.current = Priority::High;
            }
        }

        let addr = self.pc[self.current.index()];
        let byte = opcode_of(self.read_word(addr)?);
        match Opcode::decode(byte) {
            Some(Opcode::Builtin(Builtin::WaitInput)) => {
                self.halted = true;
                Ok(false)
            },
            Some(Opcode::Builtin(b)) => {
                self.builtin(boot, b, addr)?;
                self.stats.steps += 1;
                Ok(true)
            },
            Some(Opcode::Overlay { id, command }) => {
                self.overlay(boot, id, command, byte, addr)?;
                self.stats.steps += 1;
                Ok(true)
            },
            None => Err(Error::InvalidOpcode { opcode: byte, addr }),
        }
    }

    fn record(&mut self, opcode: u8, args: &[u32], addr: HostAddr) {
        self.log.push(Executed {
            opcode,
            args: args.to_vec(),
            priority: self.current,
            addr,
        });
    }

    fn stack_slot(&self, raw: u32, addr: HostAddr) -> Result<usize> {
        let slot = raw as usize;
        if slot < self.stacks[self.current.index()].len() {
            Ok(slot)
        } else {
            Err(Error::StackFault { slot: raw, addr })
        }
    }

    fn builtin(&mut self, boot: &BootInfo, b: Builtin, addr: HostAddr) -> Result<()> {
        let args = self.read_words(addr.offset_words(1), b.arity())?;
        let next = addr.offset_words(1 + b.arity() as u32);
        let p = self.current.index();

        if b == Builtin::TestWriteStatus
            && self.signals.intersects(Signals::from_bits_retain(args[0]))
        {
            // Stall until the CPU clears the masked signals
            self.halted = true;
            return Ok(());
        }

        self.record(b as u8, &args, addr);

        match b {
            Builtin::Noop => self.pc[p] = next,
            Builtin::Jump => self.pc[p] = HostAddr::new(args[0]),
            Builtin::Call => {
                let slot = self.stack_slot(args[1], addr)?;
                self.stacks[p][slot] = Some(next);
                self.pc[p] = HostAddr::new(args[0]);
            },
            Builtin::Ret => {
                let slot = self.stack_slot(args[0], addr)?;
                let target = self.stacks[p][slot]
                    .take()
                    .ok_or(Error::StackFault { slot: args[0], addr })?;
                self.pc[p] = target;
            },
            Builtin::DmaIn | Builtin::DmaOut => {
                let direction = if b == Builtin::DmaIn {
                    DmaDirection::ToCoprocessor
                } else {
                    DmaDirection::ToHost
                };
                self.dma_words(
                    HostAddr::new(args[0]),
                    CoprocMemory::Dmem,
                    args[1] as usize,
                    args[2] as usize,
                    direction,
                )?;
                self.pc[p] = next;
            },
            Builtin::WriteStatus => {
                self.apply_signals(
                    Signals::from_bits_retain(args[0]),
                    Signals::from_bits_retain(args[1]),
                );
                self.pc[p] = next;
            },
            Builtin::TestWriteStatus => {
                self.apply_signals(Signals::from_bits_retain(args[1]), Signals::empty());
                self.pc[p] = next;
            },
            Builtin::SwapBuffers => {
                if self.current != Priority::High {
                    return Err(Error::InvalidOpcode {
                        opcode: b as u8,
                        addr,
                    });
                }
                self.pc[p] = next;
                if opcode_of(self.read_word(next)?) == Builtin::WaitInput as u8 {
                    self.current = Priority::Low;
                }
            },
            Builtin::Syncpoint => {
                let id = SyncpointId::from_raw(args[0]);
                let counter = boot.counter(id.priority());
                let index = self
                    .ram_index(counter, 1)
                    .ok_or(Error::DmaFault { addr: counter })?;
                self.ram[index] = id.seq();
                if SyncFlags::from_bits_retain(args[1]).contains(SyncFlags::SIGNAL) {
                    self.interrupt = true;
                }
                self.pc[p] = next;
            },
            Builtin::WaitInput | Builtin::Invalid => {
                return Err(Error::InvalidOpcode {
                    opcode: b as u8,
                    addr,
                });
            },
        }
        Ok(())
    }

    fn table_entry(&self, boot: &BootInfo, id: OverlayId) -> Result<OverlayEntry> {
        let addr = boot
            .overlay_table
            .offset_words((id.slot() * OverlayEntry::WORDS) as u32);
        let words = self.read_words(addr, OverlayEntry::WORDS)?;
        let mut raw = [0u32; OverlayEntry::WORDS];
        raw.copy_from_slice(&words);
        Ok(OverlayEntry::from_words(&raw))
    }

    fn overlay(
        &mut self,
        boot: &BootInfo,
        id: OverlayId,
        command: u8,
        byte: u8,
        addr: HostAddr,
    ) -> Result<()> {
        let fault = Error::InvalidOpcode { opcode: byte, addr };
        if id.raw() as u32 > boot.overlay_slots {
            return Err(fault);
        }
        let entry = self.table_entry(boot, id)?;
        if entry.is_vacant() || command as u32 >= entry.command_count {
            return Err(fault);
        }

        let arities = self.read_words(entry.arity_table, ARITY_TABLE_WORDS)?;
        let arity = unpack_arity(&arities, command).unwrap_or(0) as usize;
        let args = self.read_words(addr.offset_words(1), arity)?;

        self.ensure_loaded(boot, id, &entry)?;
        self.record(byte, &args, addr);

        let end = (boot.state_offset as usize + entry.state_words as usize).min(self.dmem.len());
        let start = (boot.state_offset as usize).min(end);
        if let Some(handler) = self.handlers.get_mut(&byte) {
            handler(&args, &mut self.dmem[start..end]);
        }

        let p = self.current.index();
        self.pc[p] = addr.offset_words(1 + arity as u32);
        Ok(())
    }

    fn ensure_loaded(&mut self, boot: &BootInfo, id: OverlayId, entry: &OverlayEntry) -> Result<()> {
        if self.loaded == Some((id, entry.generation)) {
            return Ok(());
        }
        let state_offset = boot.state_offset as usize;

        // Write back the outgoing overlay's state if its entry is still live
        if let Some((old, generation)) = self.loaded.take() {
            let live = self.table_entry(boot, old)?;
            if !live.is_vacant() && live.generation == generation {
                self.dma_words(
                    live.data_addr,
                    CoprocMemory::Dmem,
                    state_offset,
                    live.state_words as usize,
                    DmaDirection::ToHost,
                )?;
            }
        }

        self.dma_words(
            entry.code_addr,
            CoprocMemory::Imem,
            0,
            entry.code_words as usize,
            DmaDirection::ToCoprocessor,
        )?;
        self.dma_words(
            entry.data_addr,
            CoprocMemory::Dmem,
            state_offset,
            entry.data_words as usize,
            DmaDirection::ToCoprocessor,
        )?;
        self.loaded = Some((id, entry.generation));
        self.stats.overlay_loads += 1;
        log::debug!("sim: loaded overlay {} (generation {})", id, entry.generation);
        Ok(())
    }
}

// =============================================================================
// SIM COPROCESSOR
// =============================================================================

/// Software coprocessor
///
/// Clones share the same model, so a test can keep a handle after moving
/// one into a queue.
#[derive(Clone)]
pub struct SimCoprocessor {
    state: Arc<Mutex<SimState>>,
}

impl SimCoprocessor {
    /// Create a model
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Attach a handler to an overlay command
    pub fn on_command<F>(&self, opcode: Opcode, handler: F)
    where
        F: FnMut(&[u32], &mut [u32]) + Send + 'static,
    {
        self.state
            .lock()
            .handlers
            .insert(opcode.to_byte(), Box::new(handler));
    }

    /// Run every wake to completion
    pub fn set_eager(&self, eager: bool) {
        self.state.lock().eager = eager;
    }

    /// Execute until the stream halts
    pub fn run(&self) -> Result<()> {
        self.state.lock().run_to_halt()
    }

    /// Execute a single record
    pub fn step(&self) -> bool {
        self.state.lock().step()
    }

    /// Records executed so far
    pub fn executed(&self) -> Vec<Executed> {
        self.state.lock().log.clone()
    }

    /// Forget the execution log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Model statistics
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Read simulated main memory
    pub fn read_ram(&self, addr: HostAddr, words: usize) -> Result<Vec<u32>> {
        self.state.lock().read_words(addr, words)
    }

    /// Read data memory
    pub fn read_dmem(&self, offset: usize, words: usize) -> Vec<u32> {
        let state = self.state.lock();
        let end = (offset + words).min(state.dmem.len());
        state.dmem[offset.min(end)..end].to_vec()
    }

    /// Current signal bits
    pub fn signals(&self) -> Signals {
        self.state.lock().signals
    }

    /// Overlay resident in IMEM/DMEM
    pub fn loaded_overlay(&self) -> Option<OverlayId> {
        self.state.lock().loaded.map(|(id, _)| id)
    }

    /// Stream being executed
    pub fn current_priority(&self) -> Priority {
        self.state.lock().current
    }
}

impl Default for SimCoprocessor {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl fmt::Debug for SimCoprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCoprocessor").finish_non_exhaustive()
    }
}

impl Coprocessor for SimCoprocessor {
    fn commit(&mut self, addr: HostAddr, words: &[u32]) {
        let mut state = self.state.lock();
        state.stats.commits += 1;
        match state.ram_index(addr, words.len()) {
            Some(start) => state.ram[start..start + words.len()].copy_from_slice(words),
            None => log::error!("sim: commit outside main memory at {}", addr),
        }
    }

    fn fetch(&mut self, addr: HostAddr, words: &mut [u32]) {
        let state = self.state.lock();
        match state.ram_index(addr, words.len()) {
            Some(start) => words.copy_from_slice(&state.ram[start..start + words.len()]),
            None => log::error!("sim: fetch outside main memory at {}", addr),
        }
    }

    fn dma(&mut self, request: &DmaRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.dma_requests += 1;
        // One queue entry: an earlier transfer finishes first
        state.drain_dma()?;
        match request.mode {
            DmaMode::Sync => state.transfer(request),
            DmaMode::Async => {
                state.pending_dma = Some(*request);
                Ok(())
            },
        }
    }

    fn status(&mut self) -> Status {
        self.state.lock().status()
    }

    fn write_signals(&mut self, set: Signals, clear: Signals) {
        self.state.lock().apply_signals(set, clear);
    }

    fn wake(&mut self) {
        let mut state = self.state.lock();
        state.stats.wakes += 1;
        if state.fault.is_some() || state.drain_dma().is_err() {
            return;
        }
        if state.boot.is_none() && !state.try_boot() {
            return;
        }
        state.halted = false;
        if state.eager {
            let _ = state.run_to_halt();
        }
    }

    fn wait_interrupt(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        let mut budget = state.config.step_budget;
        loop {
            if state.interrupt {
                state.interrupt = false;
                state.stats.interrupts += 1;
                return Ok(());
            }
            if let Some(err) = state.fault {
                return Err(err);
            }
            if budget == 0 || state.halted {
                return Err(Error::Stalled);
            }
            budget -= 1;
            state.step();
        }
    }

    fn reset(&mut self) {
        self.state.lock().reset();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use copq_core::layout::pack_arities;
    use copq_core::wire::{self, header};

    const LOW: u32 = 0x1000;
    const HIGH: u32 = 0x2000;
    const TABLE: u32 = 0x3000;
    const COUNTERS: u32 = 0x3800;
    const BOOT: u32 = 0x3900;

    fn boot(sim: &mut SimCoprocessor) {
        let info = BootInfo {
            low_stream: HostAddr::new(LOW),
            high_stream: HostAddr::new(HIGH),
            overlay_table: HostAddr::new(TABLE),
            overlay_slots: 15,
            sync_counters: HostAddr::new(COUNTERS),
            max_nesting: 4,
            state_offset: 256,
        };
        sim.commit(HostAddr::new(BOOT), &info.to_words());
        sim.dma(&DmaRequest::to_dmem(HostAddr::new(BOOT), 0, BootInfo::WORDS))
            .unwrap();
        sim.wake();
    }

    fn counter(sim: &SimCoprocessor, priority: Priority) -> u32 {
        sim.read_ram(HostAddr::new(COUNTERS).offset_words(priority.index() as u32), 1)
            .unwrap()[0]
    }

    #[test]
    fn test_async_dma_busy_until_wake() {
        let mut sim = SimCoprocessor::default();
        sim.commit(HostAddr::new(0x4000), &[7, 8, 9]);
        sim.dma(&DmaRequest::to_dmem(HostAddr::new(0x4000), 600, 3).asynchronous())
            .unwrap();

        let status = sim.status();
        assert!(status.contains(Status::DMA_BUSY | Status::DMA_FULL));
        assert!(!status.is_idle());
        assert_eq!(sim.read_dmem(600, 3), [0, 0, 0]);

        sim.wake();
        assert_eq!(sim.read_dmem(600, 3), [7, 8, 9]);
        assert!(!sim.status().contains(Status::DMA_BUSY));
    }

    #[test]
    fn test_async_dma_queue_holds_one_transfer() {
        let mut sim = SimCoprocessor::default();
        sim.commit(HostAddr::new(0x4000), &[1, 2]);
        sim.dma(&DmaRequest::to_dmem(HostAddr::new(0x4000), 600, 2).asynchronous())
            .unwrap();
        // The next request retires the queued one before it starts
        sim.dma(&DmaRequest::to_dmem(HostAddr::new(0x4000), 700, 1))
            .unwrap();
        assert_eq!(sim.read_dmem(600, 2), [1, 2]);
        assert_eq!(sim.read_dmem(700, 1), [1]);
        assert!(!sim.status().contains(Status::DMA_BUSY));
        assert_eq!(sim.stats().dma_requests, 2);
    }

    #[test]
    fn test_async_dma_fault_surfaces_on_wake() {
        let mut sim = SimCoprocessor::default();
        sim.dma(&DmaRequest::to_dmem(HostAddr::new(0x4000), 5000, 4).asynchronous())
            .unwrap();
        sim.wake();
        assert!(sim.status().contains(Status::BROKE));
        assert_eq!(sim.run(), Err(Error::DmaFault { addr: HostAddr::new(0x4000) }));
    }

    #[test]
    fn test_halts_on_zero_word() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        let noop = header(Builtin::Noop as u8);
        sim.commit(HostAddr::new(LOW), &[noop, noop]);
        sim.run().unwrap();
        assert_eq!(sim.executed().len(), 2);
        assert!(sim.status().contains(Status::HALTED));

        // Appending at the halt point and waking continues there
        sim.commit(HostAddr::new(LOW).offset_words(2), &[noop]);
        sim.wake();
        sim.run().unwrap();
        assert_eq!(sim.executed().len(), 3);
    }

    #[test]
    fn test_syncpoint_counter_and_interrupt() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        let id = SyncpointId::new(Priority::Low, 4);
        sim.commit(HostAddr::new(LOW), &wire::syncpoint(id, SyncFlags::SIGNAL));
        sim.wake();
        sim.wait_interrupt().unwrap();
        assert_eq!(counter(&sim, Priority::Low), 4);
        assert_eq!(counter(&sim, Priority::High), 0);
    }

    #[test]
    fn test_wait_without_work_stalls() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        assert_eq!(sim.wait_interrupt(), Err(Error::Stalled));
    }

    #[test]
    fn test_call_and_return() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        let body = HostAddr::new(0x5000);
        let noop = header(Builtin::Noop as u8);
        sim.commit(body, &[noop, wire::ret(1)[0], 1]);

        let call = wire::call(body, 1);
        sim.commit(HostAddr::new(LOW), &call);
        sim.commit(HostAddr::new(LOW).offset_words(3), &[noop]);
        sim.run().unwrap();

        let ops: Vec<u8> = sim.executed().iter().map(|e| e.opcode).collect();
        assert_eq!(ops, [0x03, 0x01, 0x04, 0x01]);
    }

    #[test]
    fn test_return_from_empty_slot_faults() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        sim.commit(HostAddr::new(LOW), &wire::ret(0));
        assert!(matches!(sim.run(), Err(Error::StackFault { slot: 0, .. })));
        assert!(sim.status().contains(Status::BROKE));
        assert!(matches!(sim.wait_interrupt(), Err(Error::StackFault { .. })));
    }

    #[test]
    fn test_invalid_marker_faults() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        sim.commit(HostAddr::new(LOW), &[header(Builtin::Invalid as u8)]);
        assert_eq!(
            sim.run(),
            Err(Error::InvalidOpcode {
                opcode: 0x0F,
                addr: HostAddr::new(LOW)
            })
        );
    }

    #[test]
    fn test_high_priority_preempts_and_returns() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        let noop = header(Builtin::Noop as u8);
        sim.commit(HostAddr::new(LOW), &[noop, noop]);
        sim.commit(HostAddr::new(HIGH), &[noop, wire::swap_buffers()[0]]);

        assert!(sim.step());
        sim.write_signals(Signals::HIGHPRI, Signals::empty());
        sim.run().unwrap();

        let order: Vec<(Priority, u8)> = sim
            .executed()
            .iter()
            .map(|e| (e.priority, e.opcode))
            .collect();
        assert_eq!(
            order,
            [
                (Priority::Low, 0x01),
                (Priority::High, 0x01),
                (Priority::High, 0x09),
                (Priority::Low, 0x01),
            ]
        );
        assert_eq!(sim.current_priority(), Priority::Low);
    }

    #[test]
    fn test_overlay_state_written_back_on_switch() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);

        let arities = HostAddr::new(0x6000);
        sim.commit(arities, &pack_arities(&[1]));
        let data_a = HostAddr::new(0x7000);
        let data_b = HostAddr::new(0x7100);
        for (slot, data) in [(0u32, data_a), (1, data_b)] {
            let entry = OverlayEntry {
                code_addr: HostAddr::new(0x6800),
                code_words: 4,
                data_addr: data,
                data_words: 2,
                state_words: 1,
                command_count: 1,
                arity_table: arities,
                generation: slot + 1,
            };
            sim.commit(
                HostAddr::new(TABLE).offset_words(slot * OverlayEntry::WORDS as u32),
                &entry.to_words(),
            );
        }

        let a = Opcode::overlay(OverlayId::new(1).unwrap(), 0);
        let b = Opcode::overlay(OverlayId::new(2).unwrap(), 0);
        sim.on_command(a, |args, state| state[0] += args[0]);
        sim.commit(
            HostAddr::new(LOW),
            &[a.header(), 5, b.header(), 0, a.header(), 2, b.header(), 0],
        );
        sim.run().unwrap();

        assert_eq!(sim.read_ram(data_a, 1).unwrap(), [7]);
        assert_eq!(sim.stats().overlay_loads, 4);
        assert_eq!(sim.loaded_overlay(), OverlayId::new(2));
    }

    #[test]
    fn test_unregistered_overlay_faults() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        let op = Opcode::overlay(OverlayId::new(3).unwrap(), 0);
        sim.commit(HostAddr::new(LOW), &[op.header()]);
        assert!(matches!(
            sim.run(),
            Err(Error::InvalidOpcode { opcode: 0x30, .. })
        ));
    }

    #[test]
    fn test_test_write_status_stalls_until_cleared() {
        let mut sim = SimCoprocessor::default();
        boot(&mut sim);
        sim.write_signals(Signals::USER0, Signals::empty());
        sim.commit(
            HostAddr::new(LOW),
            &[header(Builtin::TestWriteStatus as u8), Signals::USER0.bits(), Signals::USER1.bits()],
        );
        sim.run().unwrap();
        assert!(sim.executed().is_empty());

        sim.write_signals(Signals::empty(), Signals::USER0);
        sim.wake();
        sim.run().unwrap();
        assert_eq!(sim.signals(), Signals::USER1);
    }
}
