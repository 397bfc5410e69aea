//! Host-instruction builders used by the patch generator.
//!
//! Thin constructors over the encoder wrapper. RIP-relative forms take the
//! absolute target address; the encoder turns it into the final rel32 when
//! the instruction's own address is known. These are only ever pointed at
//! the owning block's data area, which is guaranteed to be in rel32 range.

use remora_x86::{Code, IcedError, Instruction, MemoryOperand, Register};

fn built(res: Result<Instruction, IcedError>) -> Instruction {
    // All callers pass operand combinations that are valid by construction.
    res.expect("layer2 builder received statically valid operands")
}

fn rip_mem(target: u64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RIP, target as i64)
}

/// `mov reg, [rip -> target]`
pub fn mov_reg_rip(reg: Register, target: u64) -> Instruction {
    built(Instruction::with2(Code::Mov_r64_rm64, reg, rip_mem(target)))
}

/// `mov [rip -> target], reg`
pub fn mov_rip_reg(target: u64, reg: Register) -> Instruction {
    built(Instruction::with2(Code::Mov_rm64_r64, rip_mem(target), reg))
}

/// `mov qword [rip -> target], imm32`
pub fn mov_rip_imm32(target: u64, value: i32) -> Instruction {
    built(Instruction::with2(Code::Mov_rm64_imm32, rip_mem(target), value))
}

/// `mov reg, imm64`
pub fn mov_reg_imm64(reg: Register, value: u64) -> Instruction {
    built(Instruction::with2(Code::Mov_r64_imm64, reg, value))
}

/// `mov dst, src`
pub fn mov_reg_reg(dst: Register, src: Register) -> Instruction {
    built(Instruction::with2(Code::Mov_r64_rm64, dst, src))
}

/// `mov dst, <memory operand>`
pub fn mov_reg_mem(dst: Register, mem: MemoryOperand) -> Instruction {
    built(Instruction::with2(Code::Mov_r64_rm64, dst, mem))
}

/// `mov [base + disp], src`
pub fn mov_base_mem_reg(base: Register, disp: i64, src: Register) -> Instruction {
    built(Instruction::with2(
        Code::Mov_rm64_r64,
        MemoryOperand::with_base_displ(base, disp),
        src,
    ))
}

/// `mov dst, [base + disp]`
pub fn mov_reg_base_mem(dst: Register, base: Register, disp: i64) -> Instruction {
    built(Instruction::with2(
        Code::Mov_r64_rm64,
        dst,
        MemoryOperand::with_base_displ(base, disp),
    ))
}

/// `lea rsp, [rsp + disp]`: stack adjustment that leaves flags alone.
pub fn lea_rsp(disp: i64) -> Instruction {
    built(Instruction::with2(
        Code::Lea_r64_m,
        Register::RSP,
        MemoryOperand::with_base_displ(Register::RSP, disp),
    ))
}

/// `jmp rel32 -> target`
pub fn jmp(target: u64) -> Instruction {
    built(Instruction::with_branch(Code::Jmp_rel32_64, target))
}

/// `jmp qword [rip -> target]`
pub fn jmp_rip_mem(target: u64) -> Instruction {
    built(Instruction::with1(Code::Jmp_rm64, rip_mem(target)))
}

pub fn push_reg(reg: Register) -> Instruction {
    built(Instruction::with1(Code::Push_r64, reg))
}

pub fn pop_reg(reg: Register) -> Instruction {
    built(Instruction::with1(Code::Pop_r64, reg))
}

pub fn pushfq() -> Instruction {
    Instruction::with(Code::Pushfq)
}

pub fn popfq() -> Instruction {
    Instruction::with(Code::Popfq)
}

pub fn cld() -> Instruction {
    Instruction::with(Code::Cld)
}

pub fn ret() -> Instruction {
    Instruction::with(Code::Retnq)
}

/// `fxsave64 [rip -> target]`; `target` must be 16-byte aligned.
pub fn fxsave64_rip(target: u64) -> Instruction {
    built(Instruction::with1(Code::Fxsave64_m512byte, rip_mem(target)))
}

/// `fxrstor64 [rip -> target]`; `target` must be 16-byte aligned.
pub fn fxrstor64_rip(target: u64) -> Instruction {
    built(Instruction::with1(Code::Fxrstor64_m512byte, rip_mem(target)))
}

/// Clone the memory operand of a decoded instruction into builder form,
/// with a fixed 32-bit displacement so the re-encoded size is stable.
///
/// Segment-prefixed operands are reproduced without their prefix; the
/// engine does not instrument `fs`/`gs`-based control flow.
pub fn clone_mem_operand(instr: &Instruction) -> MemoryOperand {
    MemoryOperand::new(
        instr.memory_base(),
        instr.memory_index(),
        instr.memory_index_scale(),
        instr.memory_displacement64() as i64,
        4,
        false,
        Register::None,
    )
}
