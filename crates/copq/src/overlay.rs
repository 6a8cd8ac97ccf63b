//! # Overlay Manager
//!
//! Coprocessor microcode modules. Each registered overlay owns one slot of
//! the dispatch table the coprocessor reads when it meets an opcode outside
//! the overlay it has loaded. The manager keeps the code image, the data
//! image (persistent state first) and the packed arity table in main memory
//! and publishes the table entry last.
//!
//! An overlay stays registered while anything that may still execute
//! references it: a block that calls it, a block being recorded, or stream
//! content not yet known to be consumed.

use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use heapless::Vec as BoundedVec;

use copq_core::config::{MAX_ARGS, MAX_OVERLAY_COMMANDS, MAX_OVERLAY_SLOTS};
use copq_core::layout::{pack_arities, OverlayEntry, ARITY_TABLE_WORDS};
use copq_core::{Error, HostAddr, HostHeap, HostRegion, OverlayId, Priority, QueueConfig, Result};
use copq_hal::Coprocessor;

use crate::syncpoint::{SyncpointManager, UseMarks};

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// An overlay as handed to [`OverlayManager::register`]
#[derive(Debug, Clone)]
pub struct OverlayDescriptor {
    /// Name for logs
    name: &'static str,
    /// IMEM image
    code: Vec<u32>,
    /// DMEM image, persistent state first
    data: Vec<u32>,
    /// Persistent state size, a prefix of `data`
    state_words: usize,
    /// Argument count per command
    arities: BoundedVec<u8, MAX_OVERLAY_COMMANDS>,
}

impl OverlayDescriptor {
    /// Create a descriptor with a code image and no commands
    pub fn new(name: &'static str, code: &[u32]) -> Self {
        Self {
            name,
            code: code.to_vec(),
            data: Vec::new(),
            state_words: 0,
            arities: BoundedVec::new(),
        }
    }

    /// Attach a data image whose first `state_words` persist across swaps
    pub fn with_data(mut self, data: &[u32], state_words: usize) -> Self {
        self.data = data.to_vec();
        self.state_words = state_words;
        self
    }

    /// Zero-initialized data image that is all persistent state
    pub fn with_state(self, state_words: usize) -> Self {
        self.with_data(&vec![0; state_words], state_words)
    }

    /// Declare the next command with its argument count
    pub fn with_command(mut self, arity: u8) -> Result<Self> {
        self.arities.push(arity).map_err(|_| Error::TooManyCommands)?;
        Ok(self)
    }

    /// Name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Persistent state size
    pub fn state_words(&self) -> usize {
        self.state_words
    }

    /// Declared commands
    pub fn command_count(&self) -> usize {
        self.arities.len()
    }

    fn validate(&self, config: &QueueConfig) -> Result<()> {
        if self.code.is_empty() {
            return Err(Error::InvalidImage("empty code image"));
        }
        if self.code.len() > config.imem_words {
            return Err(Error::InvalidImage("code image larger than IMEM"));
        }
        if self.data.len() > config.overlay_data_words() {
            return Err(Error::InvalidImage("data image larger than DMEM"));
        }
        if self.state_words > self.data.len() {
            return Err(Error::InvalidImage("state larger than data image"));
        }
        if self.arities.is_empty() {
            return Err(Error::InvalidImage("no commands"));
        }
        let max = config.max_record_words().min(MAX_ARGS + 1);
        if self.arities.iter().any(|&a| a as usize + 1 > max) {
            return Err(Error::InvalidImage("command does not fit a ring buffer"));
        }
        Ok(())
    }
}

// =============================================================================
// STATE REGION
// =============================================================================

/// Main memory mirror of an overlay's persistent state
///
/// Updated by the coprocessor each time it swaps the overlay out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRegion {
    /// Start address
    pub addr: HostAddr,
    /// Size in words
    pub words: usize,
}

// =============================================================================
// SLOT
// =============================================================================

#[derive(Debug)]
struct OverlaySlot {
    name: &'static str,
    code: HostRegion,
    data: HostRegion,
    arity_table: HostRegion,
    state_words: usize,
    arities: BoundedVec<u8, MAX_OVERLAY_COMMANDS>,
    generation: u32,
    last_use: UseMarks,
    block_refs: u32,
}

impl OverlaySlot {
    fn regions(&self) -> [HostRegion; 3] {
        [self.code, self.data, self.arity_table]
    }
}

// =============================================================================
// OVERLAY MANAGER
// =============================================================================

/// Dispatch table owner
#[derive(Debug)]
pub struct OverlayManager {
    /// Dispatch table in main memory
    table: HostRegion,
    /// One entry per usable slot
    slots: ArrayVec<Option<OverlaySlot>, MAX_OVERLAY_SLOTS>,
    /// Generation for the next registration
    next_generation: u32,
}

impl OverlayManager {
    /// Create a manager and publish an empty table
    pub fn new<C: Coprocessor>(table: HostRegion, slot_count: usize, hw: &mut C) -> Self {
        let mut slots = ArrayVec::new();
        for _ in 0..slot_count.min(MAX_OVERLAY_SLOTS) {
            slots.push(None);
        }
        hw.commit(table.addr, &vec![0; slots.len() * OverlayEntry::WORDS]);
        Self {
            table,
            slots,
            next_generation: 1,
        }
    }

    /// Dispatch table address
    pub fn table(&self) -> HostAddr {
        self.table.addr
    }

    /// Usable slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Registered overlays
    pub fn registered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Register into the lowest free slot
    pub fn register<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        heap: &mut HostHeap,
        config: &QueueConfig,
        desc: &OverlayDescriptor,
    ) -> Result<OverlayId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::OverlayTableFull)?;
        let id = OverlayId::from_slot(slot);
        self.install(hw, heap, config, id, desc)?;
        Ok(id)
    }

    /// Register under a caller-chosen id
    pub fn register_static<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        heap: &mut HostHeap,
        config: &QueueConfig,
        id: u8,
        desc: &OverlayDescriptor,
    ) -> Result<OverlayId> {
        let overlay = self.lookup_id(id)?;
        if self.slots[overlay.slot()].is_some() {
            return Err(Error::OverlayIdTaken(id));
        }
        self.install(hw, heap, config, overlay, desc)?;
        Ok(overlay)
    }

    fn install<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        heap: &mut HostHeap,
        config: &QueueConfig,
        id: OverlayId,
        desc: &OverlayDescriptor,
    ) -> Result<()> {
        desc.validate(config)?;

        let mut regions: ArrayVec<HostRegion, 3> = ArrayVec::new();
        for words in [desc.code.len(), desc.data.len(), ARITY_TABLE_WORDS] {
            match heap.alloc(words as u32) {
                Ok(region) => regions.push(region),
                Err(err) => {
                    for region in regions {
                        heap.free(region);
                    }
                    return Err(err);
                },
            }
        }
        let (code, data, arity_table) = (regions[0], regions[1], regions[2]);

        hw.commit(code.addr, &desc.code);
        hw.commit(data.addr, &desc.data);
        let mut packed = [0u32; ARITY_TABLE_WORDS];
        for (dst, word) in packed.iter_mut().zip(pack_arities(&desc.arities)) {
            *dst = word;
        }
        hw.commit(arity_table.addr, &packed);

        let generation = self.next_generation;
        self.next_generation += 1;

        let entry = OverlayEntry {
            code_addr: code.addr,
            code_words: desc.code.len() as u32,
            data_addr: data.addr,
            data_words: desc.data.len() as u32,
            state_words: desc.state_words as u32,
            command_count: desc.arities.len() as u32,
            arity_table: arity_table.addr,
            generation,
        };
        self.write_entry(hw, id, &entry);

        self.slots[id.slot()] = Some(OverlaySlot {
            name: desc.name,
            code,
            data,
            arity_table,
            state_words: desc.state_words,
            arities: desc.arities.clone(),
            generation,
            last_use: UseMarks::default(),
            block_refs: 0,
        });

        log::info!(
            "overlay '{}' registered as {} (generation {}, {} commands)",
            desc.name,
            id,
            generation,
            desc.arities.len()
        );
        Ok(())
    }

    /// Release a slot once nothing can still reach it
    ///
    /// `recording` is true while the block being recorded references it.
    pub fn unregister<C: Coprocessor>(
        &mut self,
        hw: &mut C,
        heap: &mut HostHeap,
        sync: &mut SyncpointManager,
        id: OverlayId,
        recording: bool,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        if recording || slot.block_refs > 0 || !sync.consumed(hw, &slot.last_use) {
            return Err(Error::OverlayInUse(id.raw()));
        }

        self.write_entry(hw, id, &OverlayEntry::default());
        if let Some(slot) = self.slots[id.slot()].take() {
            for region in slot.regions() {
                heap.free(region);
            }
            log::info!(
                "overlay '{}' ({}) unregistered, generation {} retired",
                slot.name,
                id,
                slot.generation
            );
        }
        Ok(())
    }

    /// Argument count of an overlay command
    pub fn arity(&self, id: OverlayId, command: u8) -> Result<usize> {
        let slot = self.slot(id)?;
        slot.arities
            .get(command as usize)
            .map(|&a| a as usize)
            .ok_or(Error::UnknownCommand {
                overlay: id.raw(),
                command,
            })
    }

    /// Persistent state mirror
    pub fn state(&self, id: OverlayId) -> Result<StateRegion> {
        let slot = self.slot(id)?;
        Ok(StateRegion {
            addr: slot.data.addr,
            words: slot.state_words,
        })
    }

    /// Note a direct use on a stream
    pub fn mark_used(&mut self, id: OverlayId, priority: Priority, threshold: u32) {
        if let Some(Some(slot)) = self.slots.get_mut(id.slot()) {
            slot.last_use.mark(priority, threshold);
        }
    }

    /// A block now calls into this overlay
    pub fn add_block_ref(&mut self, id: OverlayId) {
        if let Some(Some(slot)) = self.slots.get_mut(id.slot()) {
            slot.block_refs += 1;
        }
    }

    /// A block calling into this overlay went away
    pub fn release_block_ref(&mut self, id: OverlayId) {
        if let Some(Some(slot)) = self.slots.get_mut(id.slot()) {
            slot.block_refs = slot.block_refs.saturating_sub(1);
        }
    }

    /// Validate a raw id against the table
    pub fn lookup_id(&self, id: u8) -> Result<OverlayId> {
        OverlayId::new(id)
            .filter(|o| o.slot() < self.slots.len())
            .ok_or(Error::InvalidOverlayId(id))
    }

    fn slot(&self, id: OverlayId) -> Result<&OverlaySlot> {
        self.slots
            .get(id.slot())
            .and_then(Option::as_ref)
            .ok_or(Error::OverlayNotRegistered(id.raw()))
    }

    fn write_entry<C: Coprocessor>(&self, hw: &mut C, id: OverlayId, entry: &OverlayEntry) {
        let addr = self
            .table
            .word((id.slot() * OverlayEntry::WORDS) as u32);
        hw.commit(addr, &entry.to_words());
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use copq_hal::sim::SimCoprocessor;

    struct Fixture {
        hw: SimCoprocessor,
        heap: HostHeap,
        sync: SyncpointManager,
        config: QueueConfig,
        overlays: OverlayManager,
    }

    fn fixture(slots: usize) -> Fixture {
        let mut hw = SimCoprocessor::default();
        let config = QueueConfig::default();
        let mut heap = HostHeap::new(HostRegion::new(config.heap_base, config.heap_words));
        let table = heap.alloc((slots * OverlayEntry::WORDS) as u32).unwrap();
        let overlays = OverlayManager::new(table, slots, &mut hw);
        Fixture {
            hw,
            heap,
            sync: SyncpointManager::new(HostAddr::new(0x100)),
            config,
            overlays,
        }
    }

    fn mixer() -> OverlayDescriptor {
        OverlayDescriptor::new("mixer", &[0xC0DE; 8])
            .with_state(4)
            .with_command(2)
            .unwrap()
            .with_command(0)
            .unwrap()
    }

    #[test]
    fn test_register_lowest_free_slot() {
        let mut f = fixture(4);
        let a = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        let b = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        assert_eq!((a.raw(), b.raw()), (1, 2));
        assert_eq!(f.overlays.arity(a, 0), Ok(2));
        assert_eq!(
            f.overlays.arity(a, 2),
            Err(Error::UnknownCommand { overlay: 1, command: 2 })
        );

        let words = f.hw.read_ram(f.overlays.table(), OverlayEntry::WORDS).unwrap();
        let mut raw = [0u32; OverlayEntry::WORDS];
        raw.copy_from_slice(&words);
        let entry = OverlayEntry::from_words(&raw);
        assert_eq!(entry.code_words, 8);
        assert_eq!(entry.state_words, 4);
        assert_eq!(entry.command_count, 2);
        assert!(!entry.is_vacant());
    }

    #[test]
    fn test_table_full() {
        let mut f = fixture(2);
        for _ in 0..2 {
            f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        }
        assert_eq!(
            f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()),
            Err(Error::OverlayTableFull)
        );
    }

    #[test]
    fn test_register_static() {
        let mut f = fixture(4);
        let id = f
            .overlays
            .register_static(&mut f.hw, &mut f.heap, &f.config, 3, &mixer())
            .unwrap();
        assert_eq!(id.raw(), 3);
        assert_eq!(
            f.overlays.register_static(&mut f.hw, &mut f.heap, &f.config, 3, &mixer()),
            Err(Error::OverlayIdTaken(3))
        );
        assert_eq!(
            f.overlays.register_static(&mut f.hw, &mut f.heap, &f.config, 5, &mixer()),
            Err(Error::InvalidOverlayId(5))
        );
        assert_eq!(
            f.overlays.register_static(&mut f.hw, &mut f.heap, &f.config, 0, &mixer()),
            Err(Error::InvalidOverlayId(0))
        );
        // Lowest free slot skips the pinned one
        let next = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        assert_eq!(next.raw(), 1);
    }

    #[test]
    fn test_image_validation() {
        let mut f = fixture(4);
        let no_commands = OverlayDescriptor::new("empty", &[1]);
        assert!(matches!(
            f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &no_commands),
            Err(Error::InvalidImage(_))
        ));

        let huge = OverlayDescriptor::new("huge", &vec![0; 2048]).with_command(0).unwrap();
        assert!(matches!(
            f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &huge),
            Err(Error::InvalidImage(_))
        ));

        let bad_state = OverlayDescriptor::new("state", &[1])
            .with_data(&[0; 2], 3)
            .with_command(0)
            .unwrap();
        assert!(f
            .overlays
            .register(&mut f.hw, &mut f.heap, &f.config, &bad_state)
            .is_err());
        assert_eq!(f.overlays.registered(), 0);
    }

    #[test]
    fn test_too_many_commands() {
        let mut desc = OverlayDescriptor::new("wide", &[1]);
        for _ in 0..MAX_OVERLAY_COMMANDS {
            desc = desc.with_command(1).unwrap();
        }
        assert_eq!(desc.command_count(), 16);
        assert!(matches!(desc.with_command(1), Err(Error::TooManyCommands)));
    }

    #[test]
    fn test_unregister_waits_for_uses() {
        let mut f = fixture(4);
        let id = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        let used = f.heap.used_words();

        f.overlays.mark_used(id, Priority::Low, 5);
        assert_eq!(
            f.overlays.unregister(&mut f.hw, &mut f.heap, &mut f.sync, id, false),
            Err(Error::OverlayInUse(1))
        );

        f.overlays.add_block_ref(id);
        f.hw.commit(f.sync.counters(), &[5, 0]);
        assert!(f
            .overlays
            .unregister(&mut f.hw, &mut f.heap, &mut f.sync, id, false)
            .is_err());

        f.overlays.release_block_ref(id);
        f.overlays
            .unregister(&mut f.hw, &mut f.heap, &mut f.sync, id, false)
            .unwrap();
        assert_eq!(f.overlays.registered(), 0);
        assert!(f.heap.used_words() < used);
        assert_eq!(f.overlays.state(id), Err(Error::OverlayNotRegistered(1)));
    }

    #[test]
    fn test_reregistration_bumps_generation() {
        let mut f = fixture(1);
        let id = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        f.overlays
            .unregister(&mut f.hw, &mut f.heap, &mut f.sync, id, false)
            .unwrap();
        let vacant = f.hw.read_ram(f.overlays.table(), OverlayEntry::WORDS).unwrap();
        assert!(vacant.iter().all(|&w| w == 0));

        let again = f.overlays.register(&mut f.hw, &mut f.heap, &f.config, &mixer()).unwrap();
        assert_eq!(again, id);
        let words = f.hw.read_ram(f.overlays.table(), OverlayEntry::WORDS).unwrap();
        assert_eq!(words[7], 2);
    }
}
