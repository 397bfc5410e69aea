//! x86-64 decoding and encoding helpers.
//!
//! The engine uses `iced-x86` underneath, but the rest of the workspace goes
//! through this wrapper so no other crate depends on `iced-x86` directly.
//! The wrapper adds the two classifications the patch pipeline cares about:
//! how an instruction terminates a basic block ([`Termination`]) and which
//! memory operands it may touch ([`MemOperand`]).

use iced_x86::{Decoder, DecoderOptions, Encoder, Formatter, InstructionInfoFactory, OpAccess};

pub use iced_x86::{
    Code, FlowControl, IcedError, Instruction, MemoryOperand, MemorySize, Mnemonic, OpKind,
    Register,
};

/// Architectural maximum x86 instruction length.
pub const MAX_INST_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid instruction at {ip:#x}")]
    InvalidInstruction { ip: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("cannot encode {mnemonic:?} at {ip:#x}: {msg}")]
    Encoding {
        mnemonic: Mnemonic,
        ip: u64,
        msg: String,
    },
}

/// A decoded guest instruction plus its byte length.
#[derive(Debug, Clone)]
pub struct DecodedInst {
    pub instr: Instruction,
    pub len: u8,
}

impl DecodedInst {
    pub fn address(&self) -> u64 {
        self.instr.ip()
    }

    /// Address of the instruction that follows in memory.
    pub fn next_address(&self) -> u64 {
        self.instr.next_ip()
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.instr.mnemonic()
    }

    /// How this instruction ends (or does not end) a basic block.
    pub fn termination(&self) -> Termination {
        termination(&self.instr)
    }

    /// True when the instruction's semantics depend on the program counter
    /// (a RIP-relative memory operand on a non-control-flow instruction).
    pub fn is_pc_relative(&self) -> bool {
        self.instr.is_ip_rel_memory_operand()
    }
}

/// Decode a single 64-bit instruction from the start of `bytes`.
///
/// `ip` is the guest address of the instruction; relative operands are
/// materialized against it.
pub fn decode(bytes: &[u8], ip: u64) -> Result<DecodedInst, DecodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(DecodeError::InvalidInstruction { ip });
    }
    Ok(DecodedInst {
        len: instr.len() as u8,
        instr,
    })
}

/// Encode `instr` as if it were located at `ip`.
///
/// Relative operands (branches, RIP-relative memory) are recomputed against
/// `ip`; the returned bytes are final.
pub fn encode(instr: &Instruction, ip: u64) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new(64);
    encoder
        .encode(instr, ip)
        .map_err(|e| EncodeError::Encoding {
            mnemonic: instr.mnemonic(),
            ip,
            msg: e.to_string(),
        })?;
    Ok(encoder.take_buffer())
}

/// Basic-block termination class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Execution falls through to the next instruction.
    None,
    /// `jmp rel8/rel32`, target known at decode time.
    DirectJump { target: u64 },
    /// `jcc rel8/rel32`.
    CondJump { target: u64 },
    /// `jmp reg` / `jmp [mem]`.
    IndirectJump,
    /// `call rel32`, target known at decode time.
    DirectCall { target: u64 },
    /// `call reg` / `call [mem]`.
    IndirectCall,
    /// `ret` / `ret imm16`, with the extra stack adjustment in bytes.
    Return { stack_adjust: u16 },
}

impl Termination {
    pub fn ends_sequence(&self) -> bool {
        !matches!(self, Termination::None)
    }
}

pub fn termination(instr: &Instruction) -> Termination {
    match instr.flow_control() {
        FlowControl::UnconditionalBranch if instr.is_jmp_short_or_near() => {
            Termination::DirectJump {
                target: instr.near_branch_target(),
            }
        }
        FlowControl::ConditionalBranch
            if instr.is_jcc_short_or_near()
                || instr.is_loopcc()
                || instr.is_loop()
                || instr.is_jcx_short() =>
        {
            Termination::CondJump {
                target: instr.near_branch_target(),
            }
        }
        FlowControl::IndirectBranch if instr.is_jmp_near_indirect() => Termination::IndirectJump,
        // SYSCALL/SYSENTER classify as calls but transfer to the kernel,
        // not to guest code; they execute inline like any other
        // instruction. Far control flow is not instrumented either.
        FlowControl::Call if instr.is_call_near() => Termination::DirectCall {
            target: instr.near_branch_target(),
        },
        FlowControl::IndirectCall if instr.is_call_near_indirect() => Termination::IndirectCall,
        FlowControl::Return if matches!(instr.code(), Code::Retnq | Code::Retnq_imm16) => {
            Termination::Return {
                stack_adjust: if instr.op_count() == 1 {
                    instr.immediate16()
                } else {
                    0
                },
            }
        }
        // Everything else (interrupts, TSX markers, far transfers) runs
        // inline.
        _ => Termination::None,
    }
}

/// Memory access direction of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
    ReadWrite,
}

impl MemAccess {
    pub fn may_read(self) -> bool {
        matches!(self, MemAccess::Read | MemAccess::ReadWrite)
    }

    pub fn may_write(self) -> bool {
        matches!(self, MemAccess::Write | MemAccess::ReadWrite)
    }
}

/// One memory operand of an instruction, in resolved-register form.
///
/// For RIP-relative operands `base` is [`Register::RIP`] and `displacement`
/// already holds the absolute target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Register,
    pub index: Register,
    pub scale: u32,
    pub displacement: u64,
    pub size: usize,
    pub access: MemAccess,
}

/// Enumerate the memory operands `instr` may access.
///
/// Operands that touch no memory (LEA-style address computations) are not
/// reported. Conditional accesses (CMOVcc loads, REP stores) are reported
/// with their direction; whether they fire at run time depends on state.
pub fn memory_operands(instr: &Instruction) -> Vec<MemOperand> {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(instr);
    info.used_memory()
        .iter()
        .filter_map(|m| {
            let access = match m.access() {
                OpAccess::Read | OpAccess::CondRead => MemAccess::Read,
                OpAccess::Write | OpAccess::CondWrite => MemAccess::Write,
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => MemAccess::ReadWrite,
                _ => return None,
            };
            Some(MemOperand {
                base: m.base(),
                index: m.index(),
                scale: m.scale(),
                displacement: m.displacement(),
                size: m.memory_size().size(),
                access,
            })
        })
        .collect()
}

pub fn may_read_memory(instr: &Instruction) -> bool {
    memory_operands(instr).iter().any(|m| m.access.may_read())
}

pub fn may_write_memory(instr: &Instruction) -> bool {
    memory_operands(instr).iter().any(|m| m.access.may_write())
}

/// Registers read or written by `instr`, excluding memory addressing.
pub fn used_registers(instr: &Instruction) -> Vec<Register> {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(instr);
    info.used_registers().iter().map(|r| r.register()).collect()
}

/// Canonical upper-case mnemonic name, e.g. `"MOV"`.
pub fn mnemonic_name(m: Mnemonic) -> String {
    format!("{m:?}").to_uppercase()
}

/// Intel-syntax disassembly of a single instruction.
pub fn disassemble(instr: &Instruction) -> String {
    let mut formatter = iced_x86::IntelFormatter::new();
    let mut out = String::new();
    formatter.format(instr, &mut out);
    out
}
