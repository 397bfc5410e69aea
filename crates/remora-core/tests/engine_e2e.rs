//! End-to-end scenarios: guest shellcode rewritten, cached and executed
//! under instrumentation, compared against natively computed results.
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pretty_assertions::assert_eq;
use remora_core::{
    AnalysisType, InstPosition, InstrRuleDataCBK, MemoryAccessType, VMAction, VMEvent, Word, VM,
};

/// Address no guest code ever lives at, used as the run stop sentinel that
/// shellcode returns to.
const STOP: Word = 0x4242;

/// A guest stack whose top holds the stop sentinel as return address.
struct GuestStack {
    _buf: Vec<u8>,
    rsp: Word,
}

fn guest_stack() -> GuestStack {
    let mut buf = vec![0u8; 0x8000];
    let top = (buf.as_mut_ptr() as Word + 0x8000 - 256) & !0xF;
    let rsp = top - 8;
    unsafe { (rsp as *mut Word).write(STOP) };
    GuestStack { _buf: buf, rsp }
}

/// Set up a VM around `code`: instrument the code range and point the
/// guest stack at a sentinel return address.
fn vm_for(code: &[u8]) -> (VM, Word) {
    let entry = code.as_ptr() as Word;
    let mut vm = VM::new();
    vm.add_instrumented_range(entry, entry + code.len() as Word);
    let stack = guest_stack();
    let mut gpr = vm.get_gpr_state();
    gpr.rsp = stack.rsp;
    gpr.eflags = 0x202;
    vm.set_gpr_state(&gpr);
    // The stack buffer must outlive the run.
    std::mem::forget(stack._buf);
    (vm, entry)
}

#[test]
fn identity_run_preserves_semantics() {
    // mov rax, 42 ; ret
    let code = [0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rax, 42);
}

#[test]
fn arithmetic_loop_matches_native_execution() {
    // mov rax, 0 ; mov rcx, 10 ; l: add rax, rcx ; dec rcx ; jnz l ; ret
    let code = [
        0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // 0x00 mov rax, 0
        0x48, 0xC7, 0xC1, 0x0A, 0x00, 0x00, 0x00, // 0x07 mov rcx, 10
        0x48, 0x01, 0xC8, // 0x0e add rax, rcx
        0x48, 0xFF, 0xC9, // 0x11 dec rcx
        0x75, 0xF8, // 0x14 jnz -8
        0xC3, // 0x16 ret
    ];
    let (mut vm, entry) = vm_for(&code);

    assert!(vm.run(entry, STOP));
    let gpr = vm.get_gpr_state();
    assert_eq!(gpr.rax, (1..=10).sum::<u64>());
    assert_eq!(gpr.rcx, 0);
}

#[test]
fn code_cb_counts_every_executed_instruction() {
    // mov rcx, 5 ; l: dec rcx ; jnz l ; ret
    let code = [
        0x48, 0xC7, 0xC1, 0x05, 0x00, 0x00, 0x00, // mov rcx, 5
        0x48, 0xFF, 0xC9, // dec rcx
        0x75, 0xFB, // jnz -5
        0xC3, // ret
    ];
    let (mut vm, entry) = vm_for(&code);

    let counter = Rc::new(Cell::new(0u64));
    let c = Rc::clone(&counter);
    let id = vm.add_code_cb(
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            c.set(c.get() + 1);
            VMAction::Continue
        }),
    );
    assert_ne!(id, remora_core::INVALID_EVENTID);

    assert!(vm.run(entry, STOP));
    // mov + 5 * (dec + jnz) + ret
    assert_eq!(counter.get(), 1 + 5 * 2 + 1);
}

#[test]
fn stop_action_halts_at_the_requested_address() {
    // nop ; nop ; nop ; ret
    let code = [0x90, 0x90, 0x90, 0xC3];
    let (mut vm, entry) = vm_for(&code);
    let addr_mid = entry + 1;

    let later = Rc::new(Cell::new(0u64));
    let l = Rc::clone(&later);
    vm.add_code_addr_cb(
        entry + 2,
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            l.set(l.get() + 1);
            VMAction::Continue
        }),
    );
    vm.add_code_addr_cb(
        addr_mid,
        InstPosition::PreInst,
        Box::new(|_, _, _| VMAction::Stop),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rip, addr_mid);
    assert_eq!(later.get(), 0, "instructions past the stop site executed");
}

#[test]
fn skip_inst_suppresses_one_instruction() {
    // mov rax, 1 ; mov rax, 2 ; ret
    let code = [
        0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
        0x48, 0xC7, 0xC0, 0x02, 0x00, 0x00, 0x00, // mov rax, 2
        0xC3, // ret
    ];
    let (mut vm, entry) = vm_for(&code);

    vm.add_code_addr_cb(
        entry + 7,
        InstPosition::PreInst,
        Box::new(|_, _, _| VMAction::SkipInst),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rax, 1);
}

#[test]
fn mem_range_cb_sees_the_write() {
    // mov [rdi], rax ; ret
    let code = [0x48, 0x89, 0x07, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let buffer = vec![0u8; 16];
    let b = buffer.as_ptr() as Word;

    let hits: Rc<RefCell<Vec<remora_core::MemoryAccess>>> = Rc::new(RefCell::new(Vec::new()));
    let h = Rc::clone(&hits);
    let id = vm.add_mem_range_cb(
        b,
        b + 16,
        MemoryAccessType::MEMORY_WRITE,
        Box::new(move |vm, _, _| {
            h.borrow_mut().extend(
                vm.get_inst_memory_access()
                    .into_iter()
                    .filter(|a| a.kind == MemoryAccessType::MEMORY_WRITE),
            );
            VMAction::Continue
        }),
    );
    assert_ne!(id, remora_core::INVALID_EVENTID);
    // Virtual callback identifiers carry the high tag bit.
    assert_ne!(id & (1 << 31), 0);

    let mut gpr = vm.get_gpr_state();
    gpr.rdi = b + 4;
    gpr.rax = 0x1122_3344_5566_7788;
    vm.set_gpr_state(&gpr);

    assert!(vm.run(entry, STOP));

    let hits = hits.borrow();
    assert_eq!(hits.len(), 1, "expected exactly one write record");
    let access = hits[0];
    assert!(access.range().overlaps(&remora_core::Range::new(b + 4, b + 8)));
    assert_eq!(access.access_address, b + 4);
    assert_eq!(access.value, 0x1122_3344_5566_7788);
    drop(hits);

    // The buffer really was written through the rewritten code.
    assert_eq!(
        u64::from_le_bytes(buffer[4..12].try_into().unwrap()),
        0x1122_3344_5566_7788
    );
}

#[test]
fn mem_addr_cb_matches_single_byte_reads() {
    // movzx eax, byte [rdi] ; ret
    let code = [0x0F, 0xB6, 0x07, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let buffer = vec![0x5Au8; 4];
    let b = buffer.as_ptr() as Word;

    let hits = Rc::new(Cell::new(0u32));
    let h = Rc::clone(&hits);
    vm.add_mem_addr_cb(
        b,
        MemoryAccessType::MEMORY_READ,
        Box::new(move |_, _, _| {
            h.set(h.get() + 1);
            VMAction::Continue
        }),
    );

    let mut gpr = vm.get_gpr_state();
    gpr.rdi = b;
    vm.set_gpr_state(&gpr);

    assert!(vm.run(entry, STOP));
    assert_eq!(hits.get(), 1);
    assert_eq!(vm.get_gpr_state().rax, 0x5A);
}

#[test]
fn cache_invalidation_picks_up_rewritten_guest_code() {
    // mov rax, 1 ; ret, in a writable buffer we patch afterwards.
    let mut code = vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xC3];
    let entry = code.as_ptr() as Word;
    let len = code.len() as Word;

    let mut vm = VM::new();
    vm.add_instrumented_range(entry, entry + len);
    let stack = guest_stack();
    let mut gpr = vm.get_gpr_state();
    gpr.rsp = stack.rsp;
    vm.set_gpr_state(&gpr);

    assert!(vm.precache_basic_block(entry));
    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rax, 1);

    // Patch the immediate and flush the stale block.
    code[3] = 0x02;
    vm.clear_cache(entry, entry + len);

    let mut gpr = vm.get_gpr_state();
    gpr.rsp = stack.rsp;
    unsafe { (stack.rsp as *mut Word).write(STOP) };
    vm.set_gpr_state(&gpr);

    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rax, 2);
}

#[test]
fn call_helper_passes_arguments_and_returns() {
    // lea rax, [rdi + rsi] ; ret
    let code = [0x48, 0x8D, 0x04, 0x37, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let mut ret: Word = 0;
    assert!(vm.call(Some(&mut ret), entry, &[3, 4]));
    assert_eq!(ret, 7);
}

#[test]
fn call_helper_requires_a_stack_pointer() {
    let code = [0xC3];
    let entry = code.as_ptr() as Word;
    let mut vm = VM::new();
    vm.add_instrumented_range(entry, entry + 1);

    let mut ret: Word = 0;
    assert!(!vm.call(Some(&mut ret), entry, &[]));
}

#[test]
fn callbacks_fire_in_registration_order_and_deletion_is_idempotent() {
    let code = [0x90, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let o1 = Rc::clone(&order);
    let cb1 = vm.add_code_addr_cb(
        entry,
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            o1.borrow_mut().push(1);
            VMAction::Continue
        }),
    );
    let o2 = Rc::clone(&order);
    let _cb2 = vm.add_code_addr_cb(
        entry,
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            o2.borrow_mut().push(2);
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(*order.borrow(), vec![1, 2]);

    order.borrow_mut().clear();
    assert!(vm.delete_instrumentation(cb1));
    assert!(!vm.delete_instrumentation(cb1), "second delete must fail");

    unsafe { ((vm.get_gpr_state().rsp) as *mut Word).write(STOP) };
    assert!(vm.run(entry, STOP));
    assert_eq!(*order.borrow(), vec![2]);
}

#[test]
fn dispatcher_keeps_the_most_aggressive_action() {
    let code = [0x90, 0x90, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s1 = Rc::clone(&seen);
    vm.add_code_addr_cb(
        entry,
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            s1.borrow_mut().push("continue");
            VMAction::Continue
        }),
    );
    let s2 = Rc::clone(&seen);
    vm.add_code_addr_cb(
        entry,
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            s2.borrow_mut().push("stop");
            VMAction::Stop
        }),
    );

    assert!(vm.run(entry, STOP));
    // Both ran, in order; the max action (Stop) won.
    assert_eq!(*seen.borrow(), vec!["continue", "stop"]);
    assert_eq!(vm.get_gpr_state().rip, entry);
}

#[test]
fn post_position_callbacks_observe_results() {
    // mov rax, 7 ; ret
    let code = [0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let observed = Rc::new(Cell::new(0u64));
    let o = Rc::clone(&observed);
    vm.add_code_addr_cb(
        entry,
        InstPosition::PostInst,
        Box::new(move |_, gpr, _| {
            o.set(gpr.rax);
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(observed.get(), 7);
}

#[test]
fn callbacks_can_rewrite_guest_state() {
    // mov rax, 1 ; ret; a pre callback on ret rewrites rax.
    let code = [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    vm.add_code_addr_cb(
        entry + 7,
        InstPosition::PreInst,
        Box::new(|_, gpr, _| {
            gpr.rax = 99;
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(vm.get_gpr_state().rax, 99);
}

#[test]
fn mnemonic_cb_matches_with_wildcard() {
    let code = [
        0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, // mov rax, 42
        0x90, // nop
        0xC3, // ret
    ];
    let (mut vm, entry) = vm_for(&code);

    let movs = Rc::new(Cell::new(0u32));
    let m = Rc::clone(&movs);
    vm.add_mnemonic_cb(
        "MOV*",
        InstPosition::PreInst,
        Box::new(move |_, _, _| {
            m.set(m.get() + 1);
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(movs.get(), 1);
}

#[test]
fn instr_rule_attaches_callbacks_from_analysis() {
    // nop ; nop ; ret; the rule instruments only returns.
    let code = [0x90, 0x90, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let rets = Rc::new(Cell::new(0u32));
    let outer = Rc::clone(&rets);
    let id = vm.add_instr_rule(
        Box::new(move |_, analysis| {
            if !analysis.is_return {
                return Vec::new();
            }
            let counter = Rc::clone(&outer);
            vec![InstrRuleDataCBK::new(
                InstPosition::PreInst,
                Box::new(move |_, _, _| {
                    counter.set(counter.get() + 1);
                    VMAction::Continue
                }),
            )]
        }),
        AnalysisType::ANALYSIS_INSTRUCTION,
    );
    assert_ne!(id, remora_core::INVALID_EVENTID);

    assert!(vm.run(entry, STOP));
    assert_eq!(rets.get(), 1);
}

#[test]
fn vm_events_report_block_boundaries() {
    // mov rcx, 3 ; l: dec rcx ; jnz l ; ret
    let code = [
        0x48, 0xC7, 0xC1, 0x03, 0x00, 0x00, 0x00, // mov rcx, 3
        0x48, 0xFF, 0xC9, // dec rcx
        0x75, 0xFB, // jnz -5
        0xC3, // ret
    ];
    let (mut vm, entry) = vm_for(&code);

    let entries = Rc::new(Cell::new(0u32));
    let built = Rc::new(Cell::new(0u32));
    let e = Rc::clone(&entries);
    let b = Rc::clone(&built);
    vm.add_vm_event_cb(
        VMEvent::BASIC_BLOCK_ENTRY | VMEvent::BASIC_BLOCK_NEW,
        Box::new(move |_, state, _, _| {
            if state.event.contains(VMEvent::BASIC_BLOCK_ENTRY) {
                e.set(e.get() + 1);
                assert!(state.basic_block_start < state.basic_block_end);
            }
            if state.event.contains(VMEvent::BASIC_BLOCK_NEW) {
                b.set(b.get() + 1);
            }
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    // Blocks: [mov,dec,jnz] once, [dec,jnz] twice, [ret] once.
    assert_eq!(built.get(), 3);
    assert_eq!(entries.get(), 4);
}

#[test]
fn bb_memory_access_accumulates_over_the_sequence() {
    // mov [rdi], al ; mov [rdi+1], al ; ret
    let code = [
        0x88, 0x07, // mov [rdi], al
        0x88, 0x47, 0x01, // mov [rdi+1], al
        0xC3, // ret
    ];
    let (mut vm, entry) = vm_for(&code);

    let buffer = vec![0u8; 4];
    let b = buffer.as_ptr() as Word;

    let totals = Rc::new(Cell::new(0usize));
    let t = Rc::clone(&totals);
    // Post callback on the ret: by then both writes are in the shadow.
    vm.add_mem_access_cb(
        MemoryAccessType::MEMORY_WRITE,
        Box::new(|_, _, _| VMAction::Continue),
    );
    vm.add_code_addr_cb(
        entry + 5,
        InstPosition::PreInst,
        Box::new(move |vm, _, _| {
            t.set(vm.get_bb_memory_access().len());
            VMAction::Continue
        }),
    );

    let mut gpr = vm.get_gpr_state();
    gpr.rdi = b;
    gpr.rax = 0x77;
    vm.set_gpr_state(&gpr);

    assert!(vm.run(entry, STOP));
    assert_eq!(totals.get(), 2);
    assert_eq!(&buffer[..2], &[0x77, 0x77]);
}

#[test]
fn analysis_is_available_inside_callbacks() {
    let code = [0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3];
    let (mut vm, entry) = vm_for(&code);

    let mnemonic = Rc::new(RefCell::new(String::new()));
    let m = Rc::clone(&mnemonic);
    vm.add_code_addr_cb(
        entry,
        InstPosition::PreInst,
        Box::new(move |vm, _, _| {
            let analysis = vm
                .get_inst_analysis(AnalysisType::ANALYSIS_INSTRUCTION | AnalysisType::ANALYSIS_DISASSEMBLY)
                .expect("analysis inside a callback");
            *m.borrow_mut() = analysis.mnemonic.clone();
            assert!(analysis.disassembly.as_deref().unwrap_or("").contains("mov"));
            VMAction::Continue
        }),
    );

    assert!(vm.run(entry, STOP));
    assert_eq!(&*mnemonic.borrow(), "MOV");
}
