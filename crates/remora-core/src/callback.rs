//! Callback types, dispatch verdicts and instrumentation events.

use remora_types::Word;

use crate::analysis::InstAnalysis;
use crate::engine::VmHandle;
use crate::state::{FPRState, GPRState};

/// Identifier returned by every registration call; also the sentinel for a
/// failed registration.
pub const INVALID_EVENTID: u32 = u32::MAX;

/// High bit tagging identifiers of virtual memory callbacks, so deletion can
/// tell them apart from engine rule identifiers.
pub(crate) const VIRTUAL_EVENT_MASK: u32 = 1 << 31;

/// Verdict returned by a callback.
///
/// Totally ordered: when several callbacks fire at the same site, the
/// numeric maximum wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VMAction {
    /// Resume execution where it broke.
    Continue,
    /// Do not execute the current instruction (pre-position only); its
    /// post-position callbacks still fire.
    SkipInst,
    /// Skip the rest of the current instruction's patch, callbacks included.
    SkipPatch,
    /// Leave the execution block and re-dispatch from the current guest PC,
    /// honoring any state the callback wrote.
    BreakToVm,
    /// Unwind cleanly out of `run`.
    Stop,
}

/// Whether a callback fires before or after the instruction it is attached
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstPosition {
    PreInst,
    PostInst,
}

bitflags::bitflags! {
    /// Direction of a memory access, also used as a registration mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAccessType: u8 {
        const MEMORY_READ = 1;
        const MEMORY_WRITE = 2;
        const MEMORY_READ_WRITE = Self::MEMORY_READ.bits() | Self::MEMORY_WRITE.bits();
    }
}

bitflags::bitflags! {
    /// Qualifiers attached to a recorded memory access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAccessFlags: u8 {
        /// The accessed value was wider than a machine word and is not
        /// captured in `value`.
        const UNKNOWN_VALUE = 1;
    }
}

/// One recorded guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Address of the instruction performing the access.
    pub inst_address: Word,
    /// First byte touched.
    pub access_address: Word,
    /// Access width in bytes.
    pub size: usize,
    pub kind: MemoryAccessType,
    /// Value read or written, when it fits a machine word.
    pub value: Word,
    pub flags: MemoryAccessFlags,
}

impl MemoryAccess {
    pub fn range(&self) -> remora_types::Range<Word> {
        remora_types::Range::new(self.access_address, self.access_address + self.size as Word)
    }
}

bitflags::bitflags! {
    /// Events the engine can deliver to VM-event callbacks. Coinciding
    /// events are OR-combined into a single delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VMEvent: u32 {
        /// The block was built rather than served from cache.
        const BASIC_BLOCK_NEW = 1 << 0;
        /// A basic block is about to be entered.
        const BASIC_BLOCK_ENTRY = 1 << 1;
        /// A basic block was just left.
        const BASIC_BLOCK_EXIT = 1 << 2;
        /// An exec-block sequence is about to be entered.
        const SEQUENCE_ENTRY = 1 << 3;
        /// An exec-block sequence was just left.
        const SEQUENCE_EXIT = 1 << 4;
        /// Guest execution left the instrumented set.
        const EXEC_TRANSFER_CALL = 1 << 5;
        /// Guest execution returned to the instrumented set.
        const EXEC_TRANSFER_RETURN = 1 << 6;
    }
}

/// Snapshot handed to VM-event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMState {
    pub event: VMEvent,
    pub basic_block_start: Word,
    pub basic_block_end: Word,
    pub sequence_start: Word,
    pub sequence_end: Word,
}

/// Per-instruction callback. Fired at a break-to-host site with the guest
/// state materialized; writes to the state take effect when execution
/// resumes.
pub type InstCallback = Box<dyn FnMut(&mut VmHandle<'_>, &mut GPRState, &mut FPRState) -> VMAction>;

/// VM-event callback.
pub type VMCallback =
    Box<dyn FnMut(&mut VmHandle<'_>, &VMState, &mut GPRState, &mut FPRState) -> VMAction>;

/// Patch-time rule callback: inspects the analysis of an instruction about
/// to be instrumented and returns the callbacks to attach to it.
pub type InstrRuleCallback =
    Box<dyn FnMut(&mut VmHandle<'_>, &InstAnalysis) -> Vec<InstrRuleDataCBK>>;

/// One callback produced by an [`InstrRuleCallback`].
pub struct InstrRuleDataCBK {
    pub position: InstPosition,
    pub callback: InstCallback,
}

impl InstrRuleDataCBK {
    pub fn new(position: InstPosition, callback: InstCallback) -> Self {
        Self { position, callback }
    }
}

impl core::fmt::Debug for InstrRuleDataCBK {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstrRuleDataCBK")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
