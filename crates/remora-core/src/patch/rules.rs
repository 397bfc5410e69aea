//! Instrumentation rules: a predicate, an address filter and the action to
//! take for every matching instruction.

use remora_types::{Range, RangeSet, Word};
use remora_x86::DecodedInst;

use crate::analysis::AnalysisType;
use crate::callback::{InstCallback, InstPosition, InstrRuleCallback, MemoryAccessType};
use crate::patch::condition::PatchCondition;

/// What a matching rule contributes to the instruction's patch.
pub enum RuleKind {
    /// Break to host and run a client callback.
    ///
    /// The callback is temporarily taken out of its slot while it runs, so
    /// re-entrant dispatch of the same rule is a no-op.
    Callback {
        position: InstPosition,
        callback: Option<InstCallback>,
    },
    /// Engine-internal shadow recording of the instruction's memory
    /// accesses. Always dispatched before client callbacks at the same
    /// site.
    MemAccessRecord {
        access: MemoryAccessType,
        position: InstPosition,
    },
    /// Patch-time client rule: the callback inspects the instruction
    /// analysis and returns the callbacks to attach.
    UserRule {
        callback: Option<InstrRuleCallback>,
        analysis: AnalysisType,
    },
}

impl core::fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RuleKind::Callback { position, .. } => {
                f.debug_struct("Callback").field("position", position).finish_non_exhaustive()
            }
            RuleKind::MemAccessRecord { access, position } => f
                .debug_struct("MemAccessRecord")
                .field("access", access)
                .field("position", position)
                .finish(),
            RuleKind::UserRule { analysis, .. } => {
                f.debug_struct("UserRule").field("analysis", analysis).finish_non_exhaustive()
            }
        }
    }
}

/// One registered instrumentation rule.
#[derive(Debug)]
pub struct InstrRule {
    pub condition: PatchCondition,
    pub range: RangeSet<Word>,
    pub kind: RuleKind,
}

impl InstrRule {
    /// Rule over the whole address space.
    pub fn everywhere(condition: PatchCondition, kind: RuleKind) -> Self {
        let mut range = RangeSet::new();
        range.add(Range::new(0, Word::MAX));
        Self {
            condition,
            range,
            kind,
        }
    }

    pub fn in_range(condition: PatchCondition, range: Range<Word>, kind: RuleKind) -> Self {
        let mut set = RangeSet::new();
        set.add(range);
        Self {
            condition,
            range: set,
            kind,
        }
    }

    /// Does this rule apply to `decoded`?
    pub fn matches(&self, decoded: &DecodedInst) -> bool {
        self.range.contains(decoded.address() as Word) && self.condition.test(decoded)
    }

    /// Position of the break site this rule needs, if any.
    pub fn position(&self) -> Option<InstPosition> {
        match &self.kind {
            RuleKind::Callback { position, .. } => Some(*position),
            RuleKind::MemAccessRecord { position, .. } => Some(*position),
            RuleKind::UserRule { .. } => None,
        }
    }
}
