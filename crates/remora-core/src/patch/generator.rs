//! Per-instruction patch generation.
//!
//! Every guest instruction becomes `[pre-site] [semantics] [post-site]
//! [sequence-end]` units. Semantics are the original instruction copied
//! verbatim unless they depend on the program counter: control flow and
//! RIP-relative accesses are rewritten into sequences that materialize the
//! original PC in a scratch register first.
//!
//! A break-to-host always follows the same discipline: compute the guest
//! resume address, store it to the context selector, store the host resume
//! address, restore the scratch register from its spill slot and jump to
//! the block epilogue.

use remora_types::Word;
use remora_x86::{DecodedInst, OpKind, Register, Termination};

use crate::errors::BuildError;
use crate::patch::layer2;
use crate::patch::relocatable::RelocatableInst;
use crate::state::{gpr_index, BreakEvent, Context, HostField};

/// Scratch registers the generator may spill. Deliberately excludes `rsp`,
/// `rbp` and the high callee-saved registers so rewrites stay short.
const TEMP_CANDIDATES: [Register; 10] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

fn host_off(field: HostField) -> usize {
    Context::host_state_offset(field)
}

fn gpr_off(reg: Register) -> usize {
    let idx = gpr_index(reg).expect("temp candidates all have context slots");
    Context::gpr_state_offset(idx)
}

fn pick_temps(used: &[Register], n: usize) -> Vec<Register> {
    let used_full: Vec<Register> = used.iter().map(|r| r.full_register()).collect();
    let picked: Vec<Register> = TEMP_CANDIDATES
        .iter()
        .copied()
        .filter(|c| !used_full.contains(c))
        .take(n)
        .collect();
    debug_assert_eq!(picked.len(), n, "instruction uses every temp candidate");
    picked
}

/// Role of one unit inside an instruction's patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Pre-position break-to-host site.
    PreSite,
    /// The semantics-preserving rewrite of the guest instruction.
    Semantics,
    /// Post-position break-to-host site.
    PostSite,
    /// Final break of a sequence.
    SequenceEnd,
}

#[derive(Debug)]
pub struct PatchUnit {
    pub kind: UnitKind,
    pub insts: Vec<RelocatableInst>,
}

/// The full patch of one guest instruction.
#[derive(Debug)]
pub struct InstPatch {
    pub decoded: DecodedInst,
    pub units: Vec<PatchUnit>,
    pub terminator: bool,
}

/// Emit the break-to-host tail shared by every callback site.
///
/// `resume_guest` is the guest PC a fresh dispatch should resume from;
/// sequence terminators omit it because their semantics already stored the
/// branch target in the selector.
fn break_site(event: BreakEvent, inst_id: u16, resume_guest: Option<Word>) -> Vec<RelocatableInst> {
    let mut insts = vec![RelocatableInst::StoreData {
        reg: Register::RAX,
        offset: host_off(HostField::Scratch0),
    }];
    if let Some(pc) = resume_guest {
        insts.push(RelocatableInst::MovImm64 {
            reg: Register::RAX,
            value: pc,
        });
        insts.push(RelocatableInst::StoreData {
            reg: Register::RAX,
            offset: host_off(HostField::Selector),
        });
    }
    insts.push(RelocatableInst::MovPatchEnd { reg: Register::RAX });
    insts.push(RelocatableInst::StoreData {
        reg: Register::RAX,
        offset: host_off(HostField::Resume),
    });
    insts.push(RelocatableInst::StoreDataImm {
        offset: host_off(HostField::Event),
        value: event.as_word() as i32,
    });
    insts.push(RelocatableInst::StoreDataImm {
        offset: host_off(HostField::InstId),
        value: inst_id as i32,
    });
    insts.push(RelocatableInst::LoadData {
        reg: Register::RAX,
        offset: host_off(HostField::Scratch0),
    });
    insts.push(RelocatableInst::JmpEpilogue);
    insts
}

/// Final unit of a sequence whose selector is already set.
fn seq_end(inst_id: u16) -> Vec<RelocatableInst> {
    vec![
        RelocatableInst::StoreDataImm {
            offset: host_off(HostField::Event),
            value: BreakEvent::SequenceEnd.as_word() as i32,
        },
        RelocatableInst::StoreDataImm {
            offset: host_off(HostField::Resume),
            value: 0,
        },
        RelocatableInst::StoreDataImm {
            offset: host_off(HostField::InstId),
            value: inst_id as i32,
        },
        RelocatableInst::JmpEpilogue,
    ]
}

/// Sequence end for a block cut at a non-terminator (block split or
/// instruction budget): the selector is the fall-through address.
fn fallthrough_end(next: Word, inst_id: u16) -> Vec<RelocatableInst> {
    let mut insts = vec![
        RelocatableInst::StoreData {
            reg: Register::RAX,
            offset: host_off(HostField::Scratch0),
        },
        RelocatableInst::MovImm64 {
            reg: Register::RAX,
            value: next,
        },
        RelocatableInst::StoreData {
            reg: Register::RAX,
            offset: host_off(HostField::Selector),
        },
        RelocatableInst::LoadData {
            reg: Register::RAX,
            offset: host_off(HostField::Scratch0),
        },
    ];
    insts.extend(seq_end(inst_id));
    insts
}

/// Load the target of an indirect branch/call operand into `temp`.
fn load_indirect_target(decoded: &DecodedInst, temp: Register) -> Vec<RelocatableInst> {
    let instr = &decoded.instr;
    if instr.op0_kind() == OpKind::Register {
        return vec![RelocatableInst::Inst(layer2::mov_reg_reg(
            temp,
            instr.op0_register(),
        ))];
    }
    if instr.is_ip_rel_memory_operand() {
        // The pointer lives at a guest absolute address; go through the
        // temp so the rewritten code works at any distance from it.
        return vec![
            RelocatableInst::MovImm64 {
                reg: temp,
                value: instr.ip_rel_memory_address(),
            },
            RelocatableInst::Inst(layer2::mov_reg_base_mem(temp, temp, 0)),
        ];
    }
    vec![RelocatableInst::Inst(layer2::mov_reg_mem(
        temp,
        layer2::clone_mem_operand(instr),
    ))]
}

/// Semantics unit of a sequence terminator: compute the next guest PC into
/// a scratch register, store it to the selector, restore the scratch.
fn terminator_semantics(decoded: &DecodedInst) -> Result<Vec<RelocatableInst>, BuildError> {
    let used = remora_x86::used_registers(&decoded.instr);
    let next = decoded.next_address();

    let store_selector = |t: Register| RelocatableInst::StoreData {
        reg: t,
        offset: host_off(HostField::Selector),
    };
    let spill = |t: Register| RelocatableInst::StoreData {
        reg: t,
        offset: gpr_off(t),
    };
    let reload = |t: Register| RelocatableInst::LoadData {
        reg: t,
        offset: gpr_off(t),
    };

    let insts = match decoded.termination() {
        Termination::DirectJump { target } => {
            let t = pick_temps(&[], 1)[0];
            vec![
                spill(t),
                RelocatableInst::MovImm64 { reg: t, value: target },
                store_selector(t),
                reload(t),
            ]
        }
        Termination::CondJump { target } => {
            // Keep the original conditional (and its side effects for the
            // LOOP family) but retarget it inside the patch: taken lands on
            // the target materialization, not-taken on the fall-through one.
            let t = pick_temps(&used, 1)[0];
            vec![
                spill(t),
                RelocatableInst::CondSkip {
                    instr: decoded.instr,
                    skip: 2,
                },
                RelocatableInst::MovImm64 { reg: t, value: next },
                RelocatableInst::JmpSkip { skip: 1 },
                RelocatableInst::MovImm64 { reg: t, value: target },
                store_selector(t),
                reload(t),
            ]
        }
        Termination::IndirectJump => {
            let t = pick_temps(&used, 1)[0];
            let mut v = vec![spill(t)];
            v.extend(load_indirect_target(decoded, t));
            v.push(store_selector(t));
            v.push(reload(t));
            v
        }
        Termination::DirectCall { target } => {
            let t = pick_temps(&used, 1)[0];
            vec![
                spill(t),
                RelocatableInst::LoadConst { reg: t, value: next },
                RelocatableInst::Inst(layer2::lea_rsp(-8)),
                RelocatableInst::Inst(layer2::mov_base_mem_reg(Register::RSP, 0, t)),
                RelocatableInst::MovImm64 { reg: t, value: target },
                store_selector(t),
                reload(t),
            ]
        }
        Termination::IndirectCall => {
            // The target operand may involve rsp, so it is read before the
            // return address is pushed.
            let temps = pick_temps(&used, 2);
            let (ta, tb) = (temps[0], temps[1]);
            let mut v = vec![spill(ta), spill(tb)];
            v.extend(load_indirect_target(decoded, ta));
            v.push(RelocatableInst::LoadConst { reg: tb, value: next });
            v.push(RelocatableInst::Inst(layer2::lea_rsp(-8)));
            v.push(RelocatableInst::Inst(layer2::mov_base_mem_reg(
                Register::RSP,
                0,
                tb,
            )));
            v.push(store_selector(ta));
            v.push(reload(tb));
            v.push(reload(ta));
            v
        }
        Termination::Return { stack_adjust } => {
            let t = pick_temps(&used, 1)[0];
            vec![
                spill(t),
                RelocatableInst::Inst(layer2::mov_reg_base_mem(t, Register::RSP, 0)),
                RelocatableInst::Inst(layer2::lea_rsp(8 + i64::from(stack_adjust))),
                store_selector(t),
                reload(t),
            ]
        }
        Termination::None => unreachable!("terminator_semantics on fall-through instruction"),
    };
    Ok(insts)
}

/// Rewrite a RIP-relative, non-control-flow instruction: the absolute
/// target is loaded into a scratch register which replaces the RIP base.
fn pc_relative_semantics(decoded: &DecodedInst) -> Vec<RelocatableInst> {
    let used = remora_x86::used_registers(&decoded.instr);
    let t = pick_temps(&used, 1)[0];

    let mut rewritten = decoded.instr;
    let target = rewritten.memory_displacement64();
    rewritten.set_memory_base(t);
    rewritten.set_memory_displacement64(0);
    rewritten.set_memory_displ_size(0);

    vec![
        RelocatableInst::StoreData {
            reg: t,
            offset: gpr_off(t),
        },
        RelocatableInst::MovImm64 {
            reg: t,
            value: target,
        },
        RelocatableInst::Inst(rewritten),
        RelocatableInst::LoadData {
            reg: t,
            offset: gpr_off(t),
        },
    ]
}

/// Generate the full patch of one guest instruction.
///
/// `force_end` closes the sequence after this instruction even when it is
/// not a terminator (instruction budget reached or block split).
pub fn generate_inst_patch(
    decoded: &DecodedInst,
    inst_id: u16,
    has_pre: bool,
    has_post: bool,
    force_end: bool,
) -> Result<InstPatch, BuildError> {
    let terminator = decoded.termination().ends_sequence();
    let addr = decoded.address() as Word;
    let next = decoded.next_address() as Word;
    let mut units = Vec::new();

    if has_pre {
        units.push(PatchUnit {
            kind: UnitKind::PreSite,
            insts: break_site(BreakEvent::PreInst, inst_id, Some(addr)),
        });
    }

    if terminator {
        units.push(PatchUnit {
            kind: UnitKind::Semantics,
            insts: terminator_semantics(decoded)?,
        });
        if has_post {
            units.push(PatchUnit {
                kind: UnitKind::PostSite,
                insts: break_site(BreakEvent::PostInst, inst_id, None),
            });
        }
        units.push(PatchUnit {
            kind: UnitKind::SequenceEnd,
            insts: seq_end(inst_id),
        });
    } else {
        let sem = if decoded.is_pc_relative() {
            pc_relative_semantics(decoded)
        } else {
            vec![RelocatableInst::Inst(decoded.instr)]
        };
        units.push(PatchUnit {
            kind: UnitKind::Semantics,
            insts: sem,
        });
        if has_post {
            units.push(PatchUnit {
                kind: UnitKind::PostSite,
                insts: break_site(BreakEvent::PostInst, inst_id, Some(next)),
            });
        }
        if force_end {
            units.push(PatchUnit {
                kind: UnitKind::SequenceEnd,
                insts: fallthrough_end(next, inst_id),
            });
        }
    }

    Ok(InstPatch {
        decoded: decoded.clone(),
        units,
        terminator,
    })
}

/// Context-switch prologue emitted once per execution block: saves the host
/// callee-saved registers, parks the host stack pointer in the context,
/// loads the full guest state and jumps through the entry slot.
pub fn prologue(with_fpr: bool) -> Vec<RelocatableInst> {
    let callee_saved = [
        Register::RBX,
        Register::RBP,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    let mut insts: Vec<RelocatableInst> = callee_saved
        .iter()
        .map(|&r| RelocatableInst::Inst(layer2::push_reg(r)))
        .collect();
    insts.push(RelocatableInst::StoreData {
        reg: Register::RSP,
        offset: host_off(HostField::HostRsp),
    });
    if with_fpr {
        insts.push(RelocatableInst::FxRstorData {
            offset: Context::fpr_state_offset(),
        });
    }

    // Guest eflags, staged through rax while still on the host stack.
    insts.push(RelocatableInst::LoadData {
        reg: Register::RAX,
        offset: gpr_off_by_index(crate::state::REG_FLAGS),
    });
    insts.push(RelocatableInst::Inst(layer2::push_reg(Register::RAX)));
    insts.push(RelocatableInst::Inst(layer2::popfq()));

    // Guest registers; rsp last, the jump does not touch the stack.
    for reg in GPR_LOAD_ORDER {
        insts.push(RelocatableInst::LoadData {
            reg,
            offset: gpr_off(reg),
        });
    }
    insts.push(RelocatableInst::LoadData {
        reg: Register::RSP,
        offset: gpr_off(Register::RSP),
    });
    insts.push(RelocatableInst::JmpMemData {
        offset: host_off(HostField::Entry),
    });
    insts
}

/// Context-switch epilogue, symmetric to [`prologue`]: saves the full guest
/// state, restores the host stack and callee-saved registers, returns to
/// the engine.
pub fn epilogue(with_fpr: bool) -> Vec<RelocatableInst> {
    let mut insts = vec![RelocatableInst::StoreData {
        reg: Register::RAX,
        offset: gpr_off(Register::RAX),
    }];

    // Guest eflags via pushfq on the guest stack, then a clean host DF.
    insts.push(RelocatableInst::Inst(layer2::pushfq()));
    insts.push(RelocatableInst::Inst(layer2::pop_reg(Register::RAX)));
    insts.push(RelocatableInst::StoreData {
        reg: Register::RAX,
        offset: gpr_off_by_index(crate::state::REG_FLAGS),
    });
    insts.push(RelocatableInst::Inst(layer2::cld()));

    for reg in GPR_LOAD_ORDER {
        if reg == Register::RAX {
            continue;
        }
        insts.push(RelocatableInst::StoreData {
            reg,
            offset: gpr_off(reg),
        });
    }
    insts.push(RelocatableInst::StoreData {
        reg: Register::RSP,
        offset: gpr_off(Register::RSP),
    });
    if with_fpr {
        insts.push(RelocatableInst::FxSaveData {
            offset: Context::fpr_state_offset(),
        });
    }

    insts.push(RelocatableInst::LoadData {
        reg: Register::RSP,
        offset: host_off(HostField::HostRsp),
    });
    for &r in [
        Register::R15,
        Register::R14,
        Register::R13,
        Register::R12,
        Register::RBP,
        Register::RBX,
    ]
    .iter()
    {
        insts.push(RelocatableInst::Inst(layer2::pop_reg(r)));
    }
    insts.push(RelocatableInst::Inst(layer2::ret()));
    insts
}

/// Registers loaded/stored by the context switch, `rsp` excluded (handled
/// last on load, explicitly on store).
const GPR_LOAD_ORDER: [Register; 15] = [
    Register::RAX,
    Register::RBX,
    Register::RCX,
    Register::RDX,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::RBP,
];

fn gpr_off_by_index(idx: usize) -> usize {
    Context::gpr_state_offset(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(bytes: &[u8], ip: u64) -> DecodedInst {
        remora_x86::decode(bytes, ip).unwrap()
    }

    #[test]
    fn plain_instruction_is_copied_verbatim() {
        let d = decode(&[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00], 0x1000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        assert!(!p.terminator);
        assert_eq!(p.units.len(), 1);
        assert_eq!(p.units[0].kind, UnitKind::Semantics);
        assert!(matches!(p.units[0].insts[0], RelocatableInst::Inst(_)));
    }

    #[test]
    fn callback_sites_wrap_semantics() {
        let d = decode(&[0x90], 0x1000);
        let p = generate_inst_patch(&d, 3, true, true, false).unwrap();
        let kinds: Vec<UnitKind> = p.units.iter().map(|u| u.kind).collect();
        assert_eq!(
            kinds,
            vec![UnitKind::PreSite, UnitKind::Semantics, UnitKind::PostSite]
        );
        // The pre site resumes at the instruction itself.
        assert!(p.units[0]
            .insts
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1000, .. })));
        // The post site resumes at the next instruction.
        assert!(p.units[2]
            .insts
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1001, .. })));
    }

    #[test]
    fn direct_jump_materializes_its_target() {
        // jmp +5 at 0x1000 -> target 0x1005
        let d = decode(&[0xE9, 0x00, 0x00, 0x00, 0x00], 0x1000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        assert!(p.terminator);
        assert_eq!(p.units.last().unwrap().kind, UnitKind::SequenceEnd);
        let sem = &p.units[0];
        assert!(sem
            .insts
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1005, .. })));
    }

    #[test]
    fn conditional_jump_keeps_both_paths() {
        // jne -2 at 0x2000: taken 0x1ffe, fall-through 0x2002
        let d = decode(&[0x75, 0xFC], 0x2000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        let sem = &p.units[0].insts;
        assert!(sem.iter().any(|i| matches!(i, RelocatableInst::CondSkip { skip: 2, .. })));
        assert!(sem
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x2002, .. })));
        assert!(sem
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1ffe, .. })));
    }

    #[test]
    fn call_pushes_its_return_address_through_the_pool() {
        // call rel32 at 0x1000, next 0x1005
        let d = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00], 0x1000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        let sem = &p.units[0].insts;
        assert!(sem
            .iter()
            .any(|i| matches!(i, RelocatableInst::LoadConst { value: 0x1005, .. })));
    }

    #[test]
    fn ret_reads_the_guest_stack() {
        let d = decode(&[0xC3], 0x1000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        assert!(p.terminator);
    }

    #[test]
    fn rip_relative_load_goes_through_a_scratch_register() {
        // mov rax, [rip+0x10] at 0x1000; rax is used, so the temp must differ.
        let d = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000);
        let p = generate_inst_patch(&d, 0, false, false, false).unwrap();
        let sem = &p.units[0].insts;
        let temp = match sem[0] {
            RelocatableInst::StoreData { reg, .. } => reg,
            ref other => panic!("expected spill, got {other:?}"),
        };
        assert_ne!(temp, Register::RAX);
        assert!(sem
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1017, .. })));
    }

    #[test]
    fn forced_end_emits_a_fallthrough_selector() {
        let d = decode(&[0x90], 0x1000);
        let p = generate_inst_patch(&d, 7, false, false, true).unwrap();
        let end = p.units.last().unwrap();
        assert_eq!(end.kind, UnitKind::SequenceEnd);
        assert!(end
            .insts
            .iter()
            .any(|i| matches!(i, RelocatableInst::MovImm64 { value: 0x1001, .. })));
    }

    #[test]
    fn prologue_and_epilogue_are_symmetric() {
        let p = prologue(true);
        let e = epilogue(true);
        assert!(matches!(p.last().unwrap(), RelocatableInst::JmpMemData { .. }));
        assert!(matches!(p[6], RelocatableInst::StoreData { reg: Register::RSP, .. }));
        assert!(p.iter().any(|i| matches!(i, RelocatableInst::FxRstorData { .. })));
        assert!(e.iter().any(|i| matches!(i, RelocatableInst::FxSaveData { .. })));

        // Without FPR handling both shrink by exactly one instruction.
        assert_eq!(prologue(false).len(), p.len() - 1);
        assert_eq!(epilogue(false).len(), e.len() - 1);
    }
}
