//! Guest and host register state, and the per-block context image.
//!
//! A [`Context`] lives in the data area of every execution block. The block's
//! prologue and epilogue read and write it directly through RIP-relative
//! addressing, so every struct here is `repr(C)` and its field offsets are
//! part of the generated-code contract.

use core::mem::offset_of;

use remora_types::Word;
use remora_x86::Register;

/// General-purpose guest registers.
///
/// `rip` and `eflags` are only meaningful at break-to-host boundaries: while
/// a block runs, the guest values live in the hardware registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GPRState {
    pub rax: Word,
    pub rbx: Word,
    pub rcx: Word,
    pub rdx: Word,
    pub rsi: Word,
    pub rdi: Word,
    pub r8: Word,
    pub r9: Word,
    pub r10: Word,
    pub r11: Word,
    pub r12: Word,
    pub r13: Word,
    pub r14: Word,
    pub r15: Word,
    pub rbp: Word,
    pub rsp: Word,
    pub rip: Word,
    pub eflags: Word,
}

/// Number of word-sized slots in [`GPRState`].
pub const NUM_GPR: usize = 18;

/// Index of the return-value register (`rax`).
pub const REG_RETURN: usize = 0;
/// Index of the stack pointer.
pub const REG_SP: usize = 15;
/// Index of the program counter.
pub const REG_PC: usize = 16;
/// Index of the flags register.
pub const REG_FLAGS: usize = 17;

impl GPRState {
    /// Indexed access for generic code; `idx` follows field order.
    pub fn get(&self, idx: usize) -> Word {
        match idx {
            0 => self.rax,
            1 => self.rbx,
            2 => self.rcx,
            3 => self.rdx,
            4 => self.rsi,
            5 => self.rdi,
            6 => self.r8,
            7 => self.r9,
            8 => self.r10,
            9 => self.r11,
            10 => self.r12,
            11 => self.r13,
            12 => self.r14,
            13 => self.r15,
            14 => self.rbp,
            15 => self.rsp,
            16 => self.rip,
            17 => self.eflags,
            _ => panic!("GPR index {idx} out of range"),
        }
    }

    pub fn set(&mut self, idx: usize, value: Word) {
        match idx {
            0 => self.rax = value,
            1 => self.rbx = value,
            2 => self.rcx = value,
            3 => self.rdx = value,
            4 => self.rsi = value,
            5 => self.rdi = value,
            6 => self.r8 = value,
            7 => self.r9 = value,
            8 => self.r10 = value,
            9 => self.r11 = value,
            10 => self.r12 = value,
            11 => self.r13 = value,
            12 => self.r14 = value,
            13 => self.r15 = value,
            14 => self.rbp = value,
            15 => self.rsp = value,
            16 => self.rip = value,
            17 => self.eflags = value,
            _ => panic!("GPR index {idx} out of range"),
        }
    }

    /// Value of a hardware register, widened to its full 64-bit form.
    pub fn read_reg(&self, reg: Register) -> Word {
        match gpr_index(reg) {
            Some(idx) => self.get(idx),
            None => 0,
        }
    }
}

/// Slot index of an iced register inside [`GPRState`], if it has one.
///
/// Sub-registers (`eax`, `ax`, `al`, …) map to their full 64-bit slot.
pub fn gpr_index(reg: Register) -> Option<usize> {
    match reg.full_register() {
        Register::RAX => Some(0),
        Register::RBX => Some(1),
        Register::RCX => Some(2),
        Register::RDX => Some(3),
        Register::RSI => Some(4),
        Register::RDI => Some(5),
        Register::R8 => Some(6),
        Register::R9 => Some(7),
        Register::R10 => Some(8),
        Register::R11 => Some(9),
        Register::R12 => Some(10),
        Register::R13 => Some(11),
        Register::R14 => Some(12),
        Register::R15 => Some(13),
        Register::RBP => Some(14),
        Register::RSP => Some(15),
        Register::RIP => Some(16),
        _ => None,
    }
}

/// Byte offset of a register slot inside [`GPRState`].
pub fn gpr_offset(idx: usize) -> usize {
    debug_assert!(idx < NUM_GPR);
    idx * core::mem::size_of::<Word>()
}

/// Floating-point and SIMD guest state, stored as an `fxsave64` image.
///
/// The 512-byte area must stay 16-byte aligned for `fxsave64`/`fxrstor64`.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FPRState {
    pub data: [u8; 512],
}

impl Default for FPRState {
    fn default() -> Self {
        let mut data = [0u8; 512];
        // x87 control word: all exceptions masked, 64-bit precision.
        data[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        // Empty tag word.
        data[4] = 0x00;
        // MXCSR: all SIMD exceptions masked.
        data[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        Self { data }
    }
}

impl PartialEq for FPRState {
    fn eq(&self, other: &Self) -> bool {
        self.data[..] == other.data[..]
    }
}

impl Eq for FPRState {}

impl core::fmt::Debug for FPRState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FPRState {{ fxsave64 image }}")
    }
}

/// Per-block host bookkeeping, written by generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostState {
    /// Host stack pointer, saved by the prologue and restored by the
    /// epilogue.
    pub host_rsp: Word,
    /// Host address the prologue jumps to; set by the engine before every
    /// entry.
    pub entry: Word,
    /// Next guest PC, materialized by every break-to-host.
    pub selector: Word,
    /// Host address just past the breaking patch site, for resuming
    /// mid-sequence after a callback. Zero when the sequence ended.
    pub resume: Word,
    /// [`BreakEvent`] discriminant of the last break.
    pub event: Word,
    /// Identifier of the instruction owning the last break site.
    pub inst_id: Word,
    /// Identifier of the sequence being executed.
    pub seq_id: Word,
    /// Spill slots used by break-to-host and rewrite sequences.
    pub scratch: [Word; 2],
}

/// Why generated code broke back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakEvent {
    SequenceEnd,
    PreInst,
    PostInst,
}

impl BreakEvent {
    pub const fn as_word(self) -> Word {
        match self {
            BreakEvent::SequenceEnd => 0,
            BreakEvent::PreInst => 1,
            BreakEvent::PostInst => 2,
        }
    }

    pub fn from_word(w: Word) -> Option<Self> {
        match w {
            0 => Some(BreakEvent::SequenceEnd),
            1 => Some(BreakEvent::PreInst),
            2 => Some(BreakEvent::PostInst),
            _ => None,
        }
    }
}

/// The context image embedded in every execution block's data area.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    pub host_state: HostState,
    pub gpr_state: GPRState,
    pub fpr_state: FPRState,
}

impl Context {
    pub const fn host_state_offset(field: HostField) -> usize {
        offset_of!(Context, host_state)
            + match field {
                HostField::HostRsp => offset_of!(HostState, host_rsp),
                HostField::Entry => offset_of!(HostState, entry),
                HostField::Selector => offset_of!(HostState, selector),
                HostField::Resume => offset_of!(HostState, resume),
                HostField::Event => offset_of!(HostState, event),
                HostField::InstId => offset_of!(HostState, inst_id),
                HostField::SeqId => offset_of!(HostState, seq_id),
                HostField::Scratch0 => offset_of!(HostState, scratch),
                HostField::Scratch1 => {
                    offset_of!(HostState, scratch) + core::mem::size_of::<Word>()
                }
            }
    }

    /// Offset of a guest register slot inside the context.
    pub const fn gpr_state_offset(slot: usize) -> usize {
        offset_of!(Context, gpr_state) + slot * core::mem::size_of::<Word>()
    }

    pub const fn fpr_state_offset() -> usize {
        offset_of!(Context, fpr_state)
    }
}

/// Named [`HostState`] fields addressed by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostField {
    HostRsp,
    Entry,
    Selector,
    Resume,
    Event,
    InstId,
    SeqId,
    Scratch0,
    Scratch1,
}

/// Sentinel return address pushed by the `call` helper and used as its stop
/// address.
pub const FAKE_RET_ADDR: Word = 0x2A;

/// Prepare `gpr` for calling a function with the SysV x86-64 convention:
/// the first six arguments go to registers, the rest are stored on the
/// guest stack right-to-left, then `ret_addr` is pushed.
///
/// The caller must have pointed `rsp` at usable writable memory.
pub fn simulate_call(gpr: &mut GPRState, ret_addr: Word, args: &[Word]) {
    const ARG_REGS: usize = 6;

    for (i, &arg) in args.iter().take(ARG_REGS).enumerate() {
        match i {
            0 => gpr.rdi = arg,
            1 => gpr.rsi = arg,
            2 => gpr.rdx = arg,
            3 => gpr.rcx = arg,
            4 => gpr.r8 = arg,
            5 => gpr.r9 = arg,
            _ => unreachable!(),
        }
    }

    let stack_args = if args.len() > ARG_REGS {
        &args[ARG_REGS..]
    } else {
        &[]
    };

    // Keep the ABI alignment contract: at function entry `rsp % 16 == 8`.
    let mut rsp = gpr.rsp & !0xF;
    if stack_args.len() % 2 == 1 {
        rsp -= core::mem::size_of::<Word>() as Word;
    }
    for &arg in stack_args.iter().rev() {
        rsp -= core::mem::size_of::<Word>() as Word;
        // SAFETY: the caller provided a writable guest stack.
        unsafe { (rsp as *mut Word).write(arg) };
    }
    rsp -= core::mem::size_of::<Word>() as Word;
    // SAFETY: as above.
    unsafe { (rsp as *mut Word).write(ret_addr) };
    gpr.rsp = rsp;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_layout_is_stable() {
        // The fxsave64 area must be 16-byte aligned whenever the context is.
        assert_eq!(Context::fpr_state_offset() % 16, 0);
        assert_eq!(core::mem::align_of::<Context>() % 16, 0);

        // Host fields are laid out in declaration order.
        assert_eq!(Context::host_state_offset(HostField::HostRsp), 0);
        assert_eq!(
            Context::host_state_offset(HostField::Entry),
            core::mem::size_of::<Word>()
        );
        assert!(
            Context::host_state_offset(HostField::Scratch1)
                < Context::gpr_state_offset(0)
        );
    }

    #[test]
    fn gpr_indexing_matches_fields() {
        let mut gpr = GPRState::default();
        gpr.set(REG_RETURN, 42);
        gpr.set(REG_SP, 0x7000);
        gpr.set(REG_PC, 0x1234);
        assert_eq!(gpr.rax, 42);
        assert_eq!(gpr.rsp, 0x7000);
        assert_eq!(gpr.rip, 0x1234);
        assert_eq!(gpr.get(17), gpr.eflags);
    }

    #[test]
    fn sub_registers_map_to_full_slots() {
        assert_eq!(gpr_index(Register::EAX), Some(0));
        assert_eq!(gpr_index(Register::AL), Some(0));
        assert_eq!(gpr_index(Register::R11D), Some(9));
        assert_eq!(gpr_index(Register::XMM0), None);
    }

    #[test]
    fn simulate_call_register_arguments() {
        let mut stack = vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as Word + 4096) & !0xF;

        let mut gpr = GPRState {
            rsp: top,
            ..GPRState::default()
        };
        simulate_call(&mut gpr, FAKE_RET_ADDR, &[3, 4]);
        assert_eq!(gpr.rdi, 3);
        assert_eq!(gpr.rsi, 4);
        assert_eq!(gpr.rsp % 16, 8);
        let ret = unsafe { (gpr.rsp as *const Word).read() };
        assert_eq!(ret, FAKE_RET_ADDR);
    }

    #[test]
    fn simulate_call_spills_extra_arguments() {
        let mut stack = vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as Word + 4096) & !0xF;

        let mut gpr = GPRState {
            rsp: top,
            ..GPRState::default()
        };
        simulate_call(&mut gpr, FAKE_RET_ADDR, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(gpr.rsp % 16, 8);
        unsafe {
            assert_eq!((gpr.rsp as *const Word).read(), FAKE_RET_ADDR);
            assert_eq!((gpr.rsp as *const Word).add(1).read(), 7);
            assert_eq!((gpr.rsp as *const Word).add(2).read(), 8);
        }
    }
}
