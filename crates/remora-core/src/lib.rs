//! remora-core: a dynamic binary instrumentation engine.
//!
//! The engine takes an unmodified guest program's machine code, rewrites it
//! one basic block at a time into an instrumented equivalent, and executes
//! that copy inside the host process while keeping the guest's observable
//! register and memory state intact.
//!
//! The pipeline, in execution order:
//!
//! 1. the [`patch`] module turns each decoded guest instruction into a
//!    sequence of relocatable host instructions (semantics-preserving
//!    rewrites plus callback and break-to-host sites);
//! 2. [`exec_block`] lays resolved patches into executable pages next to a
//!    per-block [`state::Context`] image and a prologue/epilogue pair that
//!    swaps between host and guest register state;
//! 3. [`cache`] keys sealed blocks by guest basic-block start and handles
//!    range invalidation;
//! 4. [`engine`] drives fetch → build-or-hit → enter → resolve-next and
//!    dispatches instrumentation callbacks at break-to-host sites;
//! 5. [`vm`] is the public facade: callback registration, state access and
//!    the `run`/`call` helpers.

pub mod analysis;
pub mod cache;
pub mod callback;
pub mod engine;
pub mod errors;
pub mod exec_block;
pub mod memaccess;
pub mod patch;
pub mod state;
pub mod vm;

pub use analysis::{AnalysisType, InstAnalysis, OperandAnalysis};
pub use callback::{
    InstCallback, InstPosition, InstrRuleDataCBK, MemoryAccess, MemoryAccessFlags,
    MemoryAccessType, VMAction, VMCallback, VMEvent, VMState, INVALID_EVENTID,
};
pub use engine::{CacheStats, EngineConfig, Options, VmHandle};
pub use state::{Context, FPRState, GPRState, HostState};
pub use vm::VM;

pub use remora_types::{MemoryMap, Permission, Range, RangeSet, Word};
