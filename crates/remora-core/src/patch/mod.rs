//! The patch pipeline: per-instruction rewriting into relocatable host
//! instructions.
//!
//! A guest instruction becomes an ordered list of [`PatchUnit`]s:
//! an optional pre-callback site, the semantics-preserving rewrite of the
//! original instruction, an optional post-callback site, and, for sequence
//! terminators, the sequence-end break. Units are resolved and written by
//! the execution block once their final addresses are known.

pub mod condition;
pub mod generator;
pub mod layer2;
pub mod relocatable;
pub mod rules;

pub use condition::PatchCondition;
pub use generator::{generate_inst_patch, prologue, epilogue, InstPatch, PatchUnit, UnitKind};
pub use relocatable::{ConstPool, RelocatableInst, RelocationLayout};
pub use rules::{InstrRule, RuleKind};
