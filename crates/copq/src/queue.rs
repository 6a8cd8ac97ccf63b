//! # Command Queue
//!
//! The context object that owns the coprocessor capability and every
//! component of the dispatch layer. All operations go through it; there is
//! no global state.
//!
//! Records are routed to the block being recorded if there is one, else to
//! the high-priority writer inside a bracket, else to the low-priority
//! writer. `write + flush` sends, a reached syncpoint acknowledges.

use alloc::vec;
use alloc::vec::Vec;

use copq_core::layout::{BlockHeader, BootInfo, OverlayEntry, SYNC_COUNTER_WORDS};
use copq_core::wire::{self, Builtin, Opcode, SyncFlags, SYNCPOINT_RECORD_WORDS};
use copq_core::{
    BlockHandle, Error, HostAddr, HostHeap, HostRegion, OverlayId, Priority, QueueConfig, Result,
    Signals, SyncpointId,
};
use copq_hal::{Coprocessor, DmaRequest, Status};

use crate::block::{Block, BlockArena, BlockRecorder};
use crate::highpri::HighPriority;
use crate::overlay::{OverlayDescriptor, OverlayManager, StateRegion};
use crate::ring::{RingStats, RingWriter};
use crate::syncpoint::{SyncpointManager, UseMarks};

// =============================================================================
// STATISTICS
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Low-priority stream
    pub low: RingStats,
    /// High-priority stream
    pub high: RingStats,
    /// Flushes that published new records
    pub flushes: u64,
    /// Syncpoints issued, buffer fences included
    pub syncpoints: u64,
    /// Non-empty high-priority brackets
    pub brackets: u64,
    /// Registered overlays
    pub overlays: usize,
    /// Live blocks
    pub blocks: usize,
    /// Main memory in use, words
    pub heap_used_words: u32,
}

// =============================================================================
// QUEUE
// =============================================================================

/// Command queue bound to one coprocessor
#[derive(Debug)]
pub struct Queue<C: Coprocessor> {
    /// Hardware capability
    hw: C,
    /// Validated configuration
    config: QueueConfig,
    /// Main memory window
    heap: HostHeap,
    /// Writers, indexed by `Priority`
    writers: [RingWriter; 2],
    /// Dispatch table
    overlays: OverlayManager,
    /// Closed blocks
    blocks: BlockArena,
    /// Block being recorded
    recorder: Option<BlockRecorder>,
    /// Completion tokens
    sync: SyncpointManager,
    /// Bracket state
    highpri: HighPriority,
    /// Boot block
    boot: HostRegion,
    /// Flushes that published new records
    flushes: u64,
}

impl<C: Coprocessor> Queue<C> {
    /// Reset the coprocessor, lay out the queue in main memory and boot it
    pub fn new(mut hw: C, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let mut heap = HostHeap::new(HostRegion::new(config.heap_base, config.heap_words));
        hw.reset();

        let low = [
            heap.alloc(config.low_buffer_words as u32)?,
            heap.alloc(config.low_buffer_words as u32)?,
        ];
        let high = [
            heap.alloc(config.high_buffer_words as u32)?,
            heap.alloc(config.high_buffer_words as u32)?,
        ];
        let table = heap.alloc((config.overlay_slots * OverlayEntry::WORDS) as u32)?;
        let counters = heap.alloc(SYNC_COUNTER_WORDS as u32)?;
        let boot = heap.alloc(BootInfo::WORDS as u32)?;

        hw.commit(counters.addr, &[0; SYNC_COUNTER_WORDS]);
        let writers = [
            RingWriter::new(Priority::Low, low, &mut hw),
            RingWriter::new(Priority::High, high, &mut hw),
        ];
        let overlays = OverlayManager::new(table, config.overlay_slots, &mut hw);

        let info = BootInfo {
            low_stream: writers[Priority::Low.index()].start(),
            high_stream: writers[Priority::High.index()].start(),
            overlay_table: table.addr,
            overlay_slots: config.overlay_slots as u32,
            sync_counters: counters.addr,
            max_nesting: config.max_nesting as u32,
            state_offset: config.state_offset as u32,
        };
        hw.commit(boot.addr, &info.to_words());
        // The wake below orders boot behind the upload
        hw.dma(&DmaRequest::to_dmem(boot.addr, 0, BootInfo::WORDS).asynchronous())?;
        hw.wake();

        log::info!(
            "command queue up: low stream {} ({} words x2), high stream {} ({} words x2), {} overlay slots",
            info.low_stream,
            config.low_buffer_words,
            info.high_stream,
            config.high_buffer_words,
            config.overlay_slots
        );

        Ok(Self {
            hw,
            config,
            heap,
            writers,
            overlays,
            blocks: BlockArena::new(),
            recorder: None,
            sync: SyncpointManager::new(counters.addr),
            highpri: HighPriority::new(),
            boot,
            flushes: 0,
        })
    }

    /// Tear down and hand the capability back
    ///
    /// Required after any fatal error; a new queue resets the coprocessor.
    pub fn close(self) -> C {
        log::info!(
            "command queue closed after {} syncpoints, {} flushes",
            self.sync.issued(),
            self.flushes
        );
        self.hw
    }

    /// Configuration in use
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Where the boot block lives in main memory
    pub fn boot_block(&self) -> HostAddr {
        self.boot.addr
    }

    /// Coprocessor status register
    pub fn status(&mut self) -> Status {
        self.hw.status()
    }

    /// Snapshot of the queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            low: self.writers[Priority::Low.index()].stats().clone(),
            high: self.writers[Priority::High.index()].stats().clone(),
            flushes: self.flushes,
            syncpoints: self.sync.issued(),
            brackets: self.highpri.brackets(),
            overlays: self.overlays.registered(),
            blocks: self.blocks.len(),
            heap_used_words: self.heap.used_words(),
        }
    }

    // =========================================================================
    // Ring Buffer Writer
    // =========================================================================

    /// Stream appends currently go to
    fn target(&self) -> Priority {
        if self.highpri.is_open() {
            Priority::High
        } else {
            Priority::Low
        }
    }

    fn emit(&mut self, record: &[u32]) -> Result<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.push(record);
            return Ok(());
        }
        let p = self.target().index();
        self.writers[p].append(&mut self.hw, &mut self.sync, record)
    }

    /// Append one record
    ///
    /// The argument count must match the opcode's arity. Flow-control
    /// builtins are reserved for the queue itself.
    pub fn append(&mut self, opcode: Opcode, args: &[u32]) -> Result<()> {
        let byte = opcode.to_byte();
        let arity = match opcode {
            Opcode::Builtin(b) if !b.is_user_appendable() => return Err(Error::ReservedOpcode(byte)),
            Opcode::Builtin(b) => b.arity(),
            Opcode::Overlay { id, command } => self.overlays.arity(id, command)?,
        };
        if args.len() != arity {
            return Err(Error::ArityMismatch {
                opcode: byte,
                expected: arity,
                found: args.len(),
            });
        }

        let record = wire::encode(byte, args)?;
        self.emit(&record)?;

        if let Opcode::Overlay { id, .. } = opcode {
            match self.recorder.as_mut() {
                Some(recorder) => recorder.use_overlay(id),
                None => {
                    // Any syncpoint issued from here on follows the use
                    let threshold = self.sync.next_seq();
                    self.overlays.mark_used(id, self.target(), threshold);
                },
            }
        }
        Ok(())
    }

    /// No operation
    pub fn noop(&mut self) -> Result<()> {
        self.append(Builtin::Noop.into(), &[])
    }

    /// Copy `words` words from main memory into DMEM
    pub fn dma_to_dmem(&mut self, host: HostAddr, dmem_offset: u32, words: u32) -> Result<()> {
        self.append(Builtin::DmaIn.into(), &[host.raw(), dmem_offset, words])
    }

    /// Copy `words` words from DMEM back to main memory
    pub fn dma_to_host(&mut self, host: HostAddr, dmem_offset: u32, words: u32) -> Result<()> {
        self.append(Builtin::DmaOut.into(), &[host.raw(), dmem_offset, words])
    }

    /// Set and clear signal bits from inside the stream
    pub fn write_signals(&mut self, set: Signals, clear: Signals) -> Result<()> {
        self.append(Builtin::WriteStatus.into(), &[set.bits(), clear.bits()])
    }

    /// Wait until every `mask` signal is clear, then set `set`
    pub fn test_write_signals(&mut self, mask: Signals, set: Signals) -> Result<()> {
        self.append(Builtin::TestWriteStatus.into(), &[mask.bits(), set.bits()])
    }

    /// Publish both streams and wake the coprocessor
    ///
    /// Returns false, touching nothing, when no record was appended since
    /// the last flush.
    pub fn flush(&mut self) -> bool {
        let mut published = false;
        for writer in &mut self.writers {
            published |= writer.commit(&mut self.hw);
        }
        if published {
            self.hw.wake();
            self.flushes += 1;
            log::trace!("flush #{}", self.flushes);
        }
        published
    }

    // =========================================================================
    // Overlay Manager
    // =========================================================================

    /// Register an overlay in the lowest free slot
    pub fn register_overlay(&mut self, desc: &OverlayDescriptor) -> Result<OverlayId> {
        self.overlays
            .register(&mut self.hw, &mut self.heap, &self.config, desc)
    }

    /// Register an overlay under a fixed id
    pub fn register_overlay_static(&mut self, id: u8, desc: &OverlayDescriptor) -> Result<OverlayId> {
        self.overlays
            .register_static(&mut self.hw, &mut self.heap, &self.config, id, desc)
    }

    /// Release an overlay nothing can reach any more
    pub fn unregister_overlay(&mut self, id: OverlayId) -> Result<()> {
        let recording = self
            .recorder
            .as_ref()
            .is_some_and(|r| r.uses_overlay(id));
        self.overlays
            .unregister(&mut self.hw, &mut self.heap, &mut self.sync, id, recording)
    }

    /// Main memory mirror of an overlay's persistent state
    pub fn overlay_state(&self, id: OverlayId) -> Result<StateRegion> {
        self.overlays.state(id)
    }

    /// Read the state mirror
    ///
    /// Current as of the last time the coprocessor swapped the overlay out.
    pub fn read_overlay_state(&mut self, id: OverlayId) -> Result<Vec<u32>> {
        let region = self.overlays.state(id)?;
        let mut words = vec![0; region.words];
        self.hw.fetch(region.addr, &mut words);
        Ok(words)
    }

    /// Overwrite the start of the state mirror; seen on the next load
    pub fn write_overlay_state(&mut self, id: OverlayId, words: &[u32]) -> Result<()> {
        let region = self.overlays.state(id)?;
        if words.len() > region.words {
            return Err(Error::InvalidImage("state write larger than state region"));
        }
        self.hw.commit(region.addr, words);
        Ok(())
    }

    // =========================================================================
    // Block Recorder
    // =========================================================================

    /// Start recording a block
    pub fn block_begin(&mut self) -> Result<()> {
        if self.recorder.is_some() {
            return Err(Error::BlockRecording);
        }
        if self.highpri.is_open() {
            return Err(Error::HighPriorityOpen);
        }
        self.recorder = Some(BlockRecorder::new());
        log::debug!("block recording started");
        Ok(())
    }

    /// Close the recording and publish the block
    pub fn block_end(&mut self) -> Result<BlockHandle> {
        let recorder = self.recorder.take().ok_or(Error::NotRecording)?;
        let image = recorder.image();
        let region = match self.heap.alloc(image.len() as u32) {
            Ok(region) => region,
            Err(err) => {
                self.release_children(recorder.children());
                return Err(err);
            },
        };
        self.hw.commit(region.addr, &image);

        let (level, children, overlays) = recorder.into_parts();
        for &id in &overlays {
            self.overlays.add_block_ref(id);
        }
        let handle = self.blocks.insert(Block {
            region,
            level,
            body_words: (image.len() - BlockHeader::WORDS) as u32,
            refcount: 0,
            children,
            overlays,
            last_run: UseMarks::default(),
        });
        log::debug!(
            "block {:?} recorded: {} words at {}, level {}",
            handle,
            image.len(),
            region.addr,
            level
        );
        Ok(handle)
    }

    /// Call a block from the current stream or from the block being recorded
    pub fn block_run(&mut self, handle: BlockHandle) -> Result<()> {
        let block = self.blocks.get(handle)?;
        let (body, level) = (block.body(), block.level);

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.call(handle, body, level, self.config.max_nesting)?;
            self.blocks.get_mut(handle)?.refcount += 1;
            return Ok(());
        }

        let p = self.target();
        self.writers[p.index()].append(&mut self.hw, &mut self.sync, &wire::call(body, level as u32))?;
        let threshold = self.sync.next_seq();
        self.blocks.get_mut(handle)?.last_run.mark(p, threshold);
        Ok(())
    }

    /// Release a block once nothing can still execute it
    pub fn block_free(&mut self, handle: BlockHandle) -> Result<()> {
        let block = self.blocks.get(handle)?;
        let referenced = block.refcount > 0
            || self
                .recorder
                .as_ref()
                .is_some_and(|r| r.calls(handle));
        if referenced {
            return Err(Error::BlockReferenced);
        }
        let last_run = block.last_run;
        if !self.sync.consumed(&mut self.hw, &last_run) {
            return Err(Error::BlockInFlight);
        }

        let block = self.blocks.remove(handle)?;
        self.release_children(&block.children);
        for &id in &block.overlays {
            self.overlays.release_block_ref(id);
        }
        self.hw.commit(block.region.addr, &block.poison());
        self.heap.free(block.region);
        log::debug!("block {:?} freed ({} words)", handle, block.region.words);
        Ok(())
    }

    fn release_children(&mut self, children: &[BlockHandle]) {
        for &child in children {
            if let Ok(block) = self.blocks.get_mut(child) {
                block.refcount = block.refcount.saturating_sub(1);
            }
        }
    }

    // =========================================================================
    // Syncpoint Manager
    // =========================================================================

    fn issue_syncpoint(&mut self, priority: Priority) -> Result<SyncpointId> {
        let writer = &mut self.writers[priority.index()];
        // Switch first so no fence lands between id allocation and record
        writer.reserve(&mut self.hw, &mut self.sync, SYNCPOINT_RECORD_WORDS)?;
        let id = self.sync.allocate(priority)?;
        writer.append(&mut self.hw, &mut self.sync, &wire::syncpoint(id, SyncFlags::SIGNAL))?;
        Ok(id)
    }

    /// Append a syncpoint to the current stream
    pub fn syncpoint_new(&mut self) -> Result<SyncpointId> {
        if self.recorder.is_some() {
            return Err(Error::SyncpointInBlock);
        }
        self.issue_syncpoint(self.target())
    }

    /// Check whether the coprocessor has passed `id`
    pub fn syncpoint_check(&mut self, id: SyncpointId) -> bool {
        self.sync.check(&mut self.hw, id)
    }

    /// Block until the coprocessor has passed `id`
    ///
    /// Rejected inside a high-priority bracket: once the high writer has
    /// stalled, the coprocessor sits in the unfinished high stream and
    /// reaches nothing else until the bracket ends.
    pub fn syncpoint_wait(&mut self, id: SyncpointId) -> Result<()> {
        if self.highpri.is_open() {
            return Err(Error::HighPriorityOpen);
        }
        let p = id.priority();
        if self.sync.check(&mut self.hw, id) {
            return Ok(());
        }
        if self.writers[p.index()].commit(&mut self.hw) {
            self.hw.wake();
            self.flushes += 1;
        }
        self.sync.wait(&mut self.hw, id)
    }

    /// Block until everything appended to the low stream so far has run
    pub fn wait_idle(&mut self) -> Result<()> {
        if self.recorder.is_some() {
            return Err(Error::SyncpointInBlock);
        }
        if self.highpri.is_open() {
            return Err(Error::HighPriorityOpen);
        }
        let id = self.issue_syncpoint(Priority::Low)?;
        self.syncpoint_wait(id)
    }

    // =========================================================================
    // High-Priority Sub-Queue
    // =========================================================================

    /// Route appends to the high-priority stream
    pub fn highpri_begin(&mut self) -> Result<()> {
        if self.recorder.is_some() {
            return Err(Error::BlockRecording);
        }
        let records = self.writers[Priority::High.index()].stats().records;
        self.highpri.begin(records)?;
        log::debug!("high-priority bracket opened");
        Ok(())
    }

    /// Close the bracket and let the coprocessor pre-empt the low stream
    pub fn highpri_end(&mut self) -> Result<()> {
        let high = Priority::High.index();
        let records = self.writers[high].stats().records;
        if !self.highpri.end(records)? {
            log::debug!("high-priority bracket closed empty");
            return Ok(());
        }

        let drain = self.issue_syncpoint(Priority::High)?;
        self.writers[high].append(&mut self.hw, &mut self.sync, &wire::swap_buffers())?;
        self.writers[high].commit(&mut self.hw);
        self.hw.write_signals(Signals::HIGHPRI, Signals::empty());
        self.hw.wake();
        self.highpri.drained_by(drain);
        log::debug!("high-priority bracket closed, drains at {:?}", drain);
        Ok(())
    }

    /// Block until the last closed bracket has drained
    pub fn highpri_sync(&mut self) -> Result<()> {
        if self.highpri.is_open() {
            return Err(Error::HighPriorityOpen);
        }
        match self.highpri.last_drain() {
            Some(drain) => self.sync.wait(&mut self.hw, drain),
            None => Ok(()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
