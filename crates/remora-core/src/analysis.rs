//! Lazily computed per-instruction analysis records.

use remora_types::{MemoryMap, Word};
use remora_x86::{DecodedInst, OpKind, Termination};

bitflags::bitflags! {
    /// Which parts of an [`InstAnalysis`] the caller wants populated.
    ///
    /// Analyses are cached per (block, instruction) with the union of all
    /// flags requested so far; a cached record is reused whenever its flags
    /// are a superset of the request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AnalysisType: u32 {
        /// Address, size, mnemonic and control-flow classification.
        const ANALYSIS_INSTRUCTION = 1 << 0;
        /// Textual disassembly.
        const ANALYSIS_DISASSEMBLY = 1 << 1;
        /// Operand list with access roles.
        const ANALYSIS_OPERANDS = 1 << 2;
        /// Module name and offset, resolved through the process maps.
        const ANALYSIS_SYMBOL = 1 << 3;
    }
}

/// Access role of a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    Read,
    Write,
    ReadWrite,
    None,
}

/// Kind of one decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandKind {
    Register(String),
    Immediate(i64),
    Memory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandAnalysis {
    pub kind: OperandKind,
    pub role: OperandRole,
}

/// Immutable analysis of one guest instruction.
///
/// `analysis_type` records which sections are populated; unpopulated
/// sections hold their empty defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstAnalysis {
    pub analysis_type: AnalysisType,

    pub address: Word,
    pub inst_size: u32,
    pub mnemonic: String,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub is_conditional: bool,
    pub may_load: bool,
    pub may_store: bool,

    pub disassembly: Option<String>,
    pub operands: Vec<OperandAnalysis>,

    /// Basename of the module containing the instruction.
    pub module: Option<String>,
    /// Offset of the instruction inside that module.
    pub module_offset: Option<Word>,
}

/// Compute the analysis sections requested by `ty`.
///
/// `maps` is only consulted for `ANALYSIS_SYMBOL` and may be empty.
pub fn analyze(decoded: &DecodedInst, ty: AnalysisType, maps: &[MemoryMap]) -> InstAnalysis {
    let termination = decoded.termination();
    let mut analysis = InstAnalysis {
        analysis_type: ty | AnalysisType::ANALYSIS_INSTRUCTION,
        address: decoded.address() as Word,
        inst_size: decoded.len as u32,
        mnemonic: remora_x86::mnemonic_name(decoded.mnemonic()),
        is_branch: matches!(
            termination,
            Termination::DirectJump { .. }
                | Termination::CondJump { .. }
                | Termination::IndirectJump
        ),
        is_call: matches!(
            termination,
            Termination::DirectCall { .. } | Termination::IndirectCall
        ),
        is_return: matches!(termination, Termination::Return { .. }),
        is_conditional: matches!(termination, Termination::CondJump { .. }),
        may_load: remora_x86::may_read_memory(&decoded.instr),
        may_store: remora_x86::may_write_memory(&decoded.instr),
        disassembly: None,
        operands: Vec::new(),
        module: None,
        module_offset: None,
    };

    if ty.contains(AnalysisType::ANALYSIS_DISASSEMBLY) {
        analysis.disassembly = Some(remora_x86::disassemble(&decoded.instr));
    }

    if ty.contains(AnalysisType::ANALYSIS_OPERANDS) {
        analysis.operands = analyze_operands(decoded);
    }

    if ty.contains(AnalysisType::ANALYSIS_SYMBOL) {
        let addr = decoded.address() as Word;
        if let Some(map) = maps.iter().find(|m| m.range.contains(addr)) {
            if !map.name.is_empty() {
                analysis.module = Some(map.name.clone());
                analysis.module_offset = Some(addr - map.range.start);
            }
        }
    }

    analysis
}

fn analyze_operands(decoded: &DecodedInst) -> Vec<OperandAnalysis> {
    let instr = &decoded.instr;
    let used = remora_x86::used_registers(instr);
    (0..instr.op_count())
        .map(|i| {
            let kind = match instr.op_kind(i) {
                OpKind::Register => {
                    OperandKind::Register(format!("{:?}", instr.op_register(i)))
                }
                OpKind::Immediate8
                | OpKind::Immediate16
                | OpKind::Immediate32
                | OpKind::Immediate64
                | OpKind::Immediate8to16
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64 => {
                    OperandKind::Immediate(instr.immediate(i) as i64)
                }
                OpKind::Memory => OperandKind::Memory,
                _ => OperandKind::Other,
            };
            let role = operand_role(instr, i, &used);
            OperandAnalysis { kind, role }
        })
        .collect()
}

fn operand_role(
    instr: &remora_x86::Instruction,
    op: u32,
    used: &[remora_x86::Register],
) -> OperandRole {
    // Destination-position register operands on x86 are op 0; whether they
    // also read depends on the instruction, which `used_registers` does not
    // tell us per-operand. Approximate: op 0 registers that also appear as a
    // source operand elsewhere are read-write.
    if instr.op_kind(op) != OpKind::Register {
        return OperandRole::None;
    }
    let reg = instr.op_register(op);
    if !used.contains(&reg) {
        return OperandRole::None;
    }
    if op == 0 {
        if instr.op_count() > 1 {
            OperandRole::ReadWrite
        } else {
            OperandRole::Write
        }
    } else {
        OperandRole::Read
    }
}
