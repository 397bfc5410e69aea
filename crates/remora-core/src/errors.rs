//! Error types of the instrumentation pipeline.

use remora_types::Word;

/// Failure while turning guest code into a sealed execution block.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("cannot decode guest instruction at {addr:#x}")]
    Decode { addr: Word },

    #[error(transparent)]
    Encode(#[from] remora_x86::EncodeError),

    /// The open execution block cannot fit the sequence being appended. The
    /// engine seals the block at the last clean boundary and retries in a
    /// fresh one.
    #[error("execution block out of space")]
    BlockFull,

    #[error("basic block at {addr:#x} leaves the instrumented ranges")]
    OutsideInstrumentedSpace { addr: Word },

    #[error("executable page allocation failed: {0}")]
    Alloc(#[source] std::io::Error),

    #[error("page protection change failed: {0}")]
    Protect(#[source] std::io::Error),
}

/// Why the engine loop stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A callback returned `VMAction::Stop`.
    Stopped,
    /// The guest PC reached the caller-provided stop address.
    ReachedStop,
    /// The guest PC left the instrumented ranges.
    LeftInstrumentedSpace(Word),
    /// The guest PC points at undecodable or unmapped code.
    UnmappedCode(Word),
}

impl ExitReason {
    /// Whether `run` reports this exit as success.
    pub fn is_success(self) -> bool {
        matches!(self, ExitReason::Stopped | ExitReason::ReachedStop)
    }
}
