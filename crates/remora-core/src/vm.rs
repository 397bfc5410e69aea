//! The public engine facade: callback registration, state access and the
//! `run`/`call` helpers.
//!
//! Virtual memory callbacks are layered on top of the physical recording
//! rules: the first range registration lazily installs a shared *read
//! gate* (pre-position) and *write gate* (post-position). Each gate scans
//! the shadow buffer of the current instruction and forwards to every
//! registered callback whose access mask and range overlap the observed
//! accesses.

use std::cell::RefCell;
use std::rc::Rc;

use remora_types::{Range, RangeSet, Word};
use tracing::debug;

use crate::analysis::{AnalysisType, InstAnalysis};
use crate::callback::{
    InstCallback, InstPosition, InstrRuleCallback, MemoryAccess, MemoryAccessType, VMAction,
    VMCallback, VMEvent, INVALID_EVENTID, VIRTUAL_EVENT_MASK,
};
use crate::engine::{CacheStats, Engine, EngineConfig, Options};
use crate::patch::{InstrRule, PatchCondition, RuleKind};
use crate::state::{simulate_call, FAKE_RET_ADDR, FPRState, GPRState};

/// One registered virtual memory callback.
struct MemCBInfo {
    access: MemoryAccessType,
    range: Range<Word>,
    /// Taken out of the slot while the callback runs.
    callback: Option<InstCallback>,
}

type MemCBList = Rc<RefCell<Vec<(u32, MemCBInfo)>>>;

/// A dynamic binary instrumentation VM: one engine instance plus the
/// client-facing callback registries.
pub struct VM {
    engine: Engine,
    mem_cb_infos: MemCBList,
    next_virtual_id: u32,
    read_gate_id: u32,
    write_gate_id: u32,
    memory_logging: MemoryAccessType,
    recorder_ids: Vec<u32>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        Self::with_options(Options::empty())
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            engine: Engine::new(EngineConfig::default(), options),
            mem_cb_infos: Rc::new(RefCell::new(Vec::new())),
            next_virtual_id: 0,
            read_gate_id: INVALID_EVENTID,
            write_gate_id: INVALID_EVENTID,
            memory_logging: MemoryAccessType::empty(),
            recorder_ids: Vec::new(),
        }
    }

    pub fn options(&self) -> Options {
        self.engine.options()
    }

    pub fn set_options(&mut self, options: Options) {
        self.engine.set_options(options);
    }

    // ---- guest state --------------------------------------------------------

    pub fn get_gpr_state(&self) -> GPRState {
        *self.engine.gpr_state()
    }

    pub fn set_gpr_state(&mut self, state: &GPRState) {
        *self.engine.gpr_state_mut() = *state;
    }

    pub fn get_fpr_state(&self) -> FPRState {
        *self.engine.fpr_state()
    }

    pub fn set_fpr_state(&mut self, state: &FPRState) {
        *self.engine.fpr_state_mut() = *state;
    }

    // ---- instrumented ranges ------------------------------------------------

    pub fn add_instrumented_range(&mut self, start: Word, end: Word) {
        if start >= end {
            return;
        }
        self.engine.add_instrumented_range(start, end);
    }

    pub fn remove_instrumented_range(&mut self, start: Word, end: Word) {
        if start >= end {
            return;
        }
        self.engine.remove_instrumented_range(start, end);
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.engine.remove_all_instrumented_ranges();
    }

    /// Instrument every executable map whose name matches `name`.
    pub fn add_instrumented_module(&mut self, name: &str) -> bool {
        self.for_each_module_map(name, |engine, range| {
            engine.add_instrumented_range(range.start, range.end)
        })
    }

    pub fn remove_instrumented_module(&mut self, name: &str) -> bool {
        self.for_each_module_map(name, |engine, range| {
            engine.remove_instrumented_range(range.start, range.end)
        })
    }

    /// Instrument the module containing `addr`.
    pub fn add_instrumented_module_from_addr(&mut self, addr: Word) -> bool {
        match self.module_name_at(addr) {
            Some(name) if !name.is_empty() => self.add_instrumented_module(&name),
            Some(_) => {
                // Anonymous mapping: instrument just that region.
                let maps = remora_procmaps::current_process_maps(false);
                let Some(m) = maps.iter().find(|m| m.range.contains(addr)) else {
                    return false;
                };
                self.engine.add_instrumented_range(m.range.start, m.range.end);
                true
            }
            None => false,
        }
    }

    pub fn remove_instrumented_module_from_addr(&mut self, addr: Word) -> bool {
        match self.module_name_at(addr) {
            Some(name) if !name.is_empty() => self.remove_instrumented_module(&name),
            Some(_) => {
                let maps = remora_procmaps::current_process_maps(false);
                let Some(m) = maps.iter().find(|m| m.range.contains(addr)) else {
                    return false;
                };
                self.engine.remove_instrumented_range(m.range.start, m.range.end);
                true
            }
            None => false,
        }
    }

    /// Instrument every executable map of the current process.
    pub fn instrument_all_executable_maps(&mut self) -> bool {
        let maps = remora_procmaps::current_process_maps(false);
        if maps.is_empty() {
            return false;
        }
        for m in maps.iter().filter(|m| m.is_executable()) {
            self.engine.add_instrumented_range(m.range.start, m.range.end);
        }
        true
    }

    fn module_name_at(&self, addr: Word) -> Option<String> {
        remora_procmaps::current_process_maps(false)
            .into_iter()
            .find(|m| m.range.contains(addr))
            .map(|m| m.name)
    }

    fn for_each_module_map(
        &mut self,
        name: &str,
        mut f: impl FnMut(&mut Engine, Range<Word>),
    ) -> bool {
        let maps = remora_procmaps::current_process_maps(false);
        let mut found = false;
        for m in maps.iter().filter(|m| m.is_executable() && m.name == name) {
            f(&mut self.engine, m.range);
            found = true;
        }
        found
    }

    // ---- code callbacks -----------------------------------------------------

    /// Callback on every instrumented instruction.
    pub fn add_code_cb(&mut self, position: InstPosition, callback: InstCallback) -> u32 {
        self.engine.add_instr_rule(InstrRule::everywhere(
            PatchCondition::True,
            RuleKind::Callback {
                position,
                callback: Some(callback),
            },
        ))
    }

    /// Callback on the instruction at `address`.
    pub fn add_code_addr_cb(
        &mut self,
        address: Word,
        position: InstPosition,
        callback: InstCallback,
    ) -> u32 {
        self.engine.add_instr_rule(InstrRule::everywhere(
            PatchCondition::AddressIs(address),
            RuleKind::Callback {
                position,
                callback: Some(callback),
            },
        ))
    }

    /// Callback on every instruction starting in `[start, end)`.
    pub fn add_code_range_cb(
        &mut self,
        start: Word,
        end: Word,
        position: InstPosition,
        callback: InstCallback,
    ) -> u32 {
        if start >= end {
            return INVALID_EVENTID;
        }
        self.engine.add_instr_rule(InstrRule::everywhere(
            PatchCondition::InstructionInRange(Range::new(start, end)),
            RuleKind::Callback {
                position,
                callback: Some(callback),
            },
        ))
    }

    /// Callback on every instruction whose mnemonic matches `mnemonic`
    /// (case-insensitive, trailing `*` wildcard).
    pub fn add_mnemonic_cb(
        &mut self,
        mnemonic: &str,
        position: InstPosition,
        callback: InstCallback,
    ) -> u32 {
        if mnemonic.is_empty() {
            return INVALID_EVENTID;
        }
        self.engine.add_instr_rule(InstrRule::everywhere(
            PatchCondition::MnemonicIs(mnemonic.to_owned()),
            RuleKind::Callback {
                position,
                callback: Some(callback),
            },
        ))
    }

    // ---- instrumentation rules ----------------------------------------------

    /// Patch-time rule over the whole address space: `callback` inspects
    /// each instruction's analysis and returns the callbacks to attach.
    pub fn add_instr_rule(&mut self, callback: InstrRuleCallback, analysis: AnalysisType) -> u32 {
        self.engine.add_instr_rule(InstrRule::everywhere(
            PatchCondition::True,
            RuleKind::UserRule {
                callback: Some(callback),
                analysis,
            },
        ))
    }

    /// Patch-time rule restricted to `[start, end)`.
    pub fn add_instr_rule_range(
        &mut self,
        start: Word,
        end: Word,
        callback: InstrRuleCallback,
        analysis: AnalysisType,
    ) -> u32 {
        if start >= end {
            return INVALID_EVENTID;
        }
        self.engine.add_instr_rule(InstrRule::in_range(
            PatchCondition::True,
            Range::new(start, end),
            RuleKind::UserRule {
                callback: Some(callback),
                analysis,
            },
        ))
    }

    // ---- memory callbacks ---------------------------------------------------

    /// Enable per-instruction shadow recording for `access`. Idempotent.
    pub fn record_memory_access(&mut self, access: MemoryAccessType) -> bool {
        if access.is_empty() || self.options().contains(Options::OPT_DISABLE_MEMORY_LOGGING) {
            return false;
        }
        if access.contains(MemoryAccessType::MEMORY_READ)
            && !self.memory_logging.contains(MemoryAccessType::MEMORY_READ)
        {
            self.memory_logging |= MemoryAccessType::MEMORY_READ;
            let id = self.engine.add_instr_rule(InstrRule::everywhere(
                PatchCondition::DoesReadAccess,
                RuleKind::MemAccessRecord {
                    access: MemoryAccessType::MEMORY_READ,
                    position: InstPosition::PreInst,
                },
            ));
            self.recorder_ids.push(id);
        }
        if access.contains(MemoryAccessType::MEMORY_WRITE)
            && !self.memory_logging.contains(MemoryAccessType::MEMORY_WRITE)
        {
            self.memory_logging |= MemoryAccessType::MEMORY_WRITE;
            let id = self.engine.add_instr_rule(InstrRule::everywhere(
                PatchCondition::DoesWriteAccess,
                RuleKind::MemAccessRecord {
                    access: MemoryAccessType::MEMORY_WRITE,
                    position: InstPosition::PostInst,
                },
            ));
            self.recorder_ids.push(id);
        }
        true
    }

    /// Physical memory callback: fires on every instrumented instruction
    /// that may access memory in the requested direction.
    pub fn add_mem_access_cb(&mut self, access: MemoryAccessType, callback: InstCallback) -> u32 {
        if !self.record_memory_access(access) {
            return INVALID_EVENTID;
        }
        let (condition, position) = if access == MemoryAccessType::MEMORY_READ {
            (PatchCondition::DoesReadAccess, InstPosition::PreInst)
        } else if access == MemoryAccessType::MEMORY_WRITE {
            (PatchCondition::DoesWriteAccess, InstPosition::PostInst)
        } else if access == MemoryAccessType::MEMORY_READ_WRITE {
            (
                PatchCondition::Or(vec![
                    PatchCondition::DoesReadAccess,
                    PatchCondition::DoesWriteAccess,
                ]),
                InstPosition::PostInst,
            )
        } else {
            return INVALID_EVENTID;
        };
        self.engine.add_instr_rule(InstrRule::everywhere(
            condition,
            RuleKind::Callback {
                position,
                callback: Some(callback),
            },
        ))
    }

    /// Virtual memory callback on the single byte at `address`: only
    /// accesses intersecting `[address, address+1)` match.
    pub fn add_mem_addr_cb(
        &mut self,
        address: Word,
        access: MemoryAccessType,
        callback: InstCallback,
    ) -> u32 {
        self.add_mem_range_cb(address, address + 1, access, callback)
    }

    /// Virtual memory callback over `[start, end)`, dispatched through the
    /// shared gates.
    pub fn add_mem_range_cb(
        &mut self,
        start: Word,
        end: Word,
        access: MemoryAccessType,
        callback: InstCallback,
    ) -> u32 {
        if start >= end || access.is_empty() {
            return INVALID_EVENTID;
        }
        if access == MemoryAccessType::MEMORY_READ && self.read_gate_id == INVALID_EVENTID {
            let gate = read_gate(&self.mem_cb_infos);
            self.read_gate_id = self.add_mem_access_cb(MemoryAccessType::MEMORY_READ, gate);
            if self.read_gate_id == INVALID_EVENTID {
                return INVALID_EVENTID;
            }
        }
        if access.contains(MemoryAccessType::MEMORY_WRITE)
            && self.write_gate_id == INVALID_EVENTID
        {
            let gate = write_gate(&self.mem_cb_infos);
            self.write_gate_id = self.add_mem_access_cb(MemoryAccessType::MEMORY_READ_WRITE, gate);
            if self.write_gate_id == INVALID_EVENTID {
                return INVALID_EVENTID;
            }
        }

        let id = self.next_virtual_id;
        if id >= VIRTUAL_EVENT_MASK {
            return INVALID_EVENTID;
        }
        self.next_virtual_id += 1;
        self.mem_cb_infos.borrow_mut().push((
            id,
            MemCBInfo {
                access,
                range: Range::new(start, end),
                callback: Some(callback),
            },
        ));
        id | VIRTUAL_EVENT_MASK
    }

    // ---- VM events ----------------------------------------------------------

    pub fn add_vm_event_cb(&mut self, mask: VMEvent, callback: VMCallback) -> u32 {
        if mask.is_empty() {
            return INVALID_EVENTID;
        }
        self.engine.add_vm_event_cb(mask, callback)
    }

    // ---- deletion -----------------------------------------------------------

    /// Remove one instrumentation by identifier. Deleting twice reports
    /// failure the second time.
    pub fn delete_instrumentation(&mut self, id: u32) -> bool {
        if id & VIRTUAL_EVENT_MASK != 0 {
            let raw = id & !VIRTUAL_EVENT_MASK;
            let mut infos = self.mem_cb_infos.borrow_mut();
            let before = infos.len();
            infos.retain(|(i, _)| *i != raw);
            return infos.len() != before;
        }
        self.engine.delete_instrumentation(id)
    }

    pub fn delete_all_instrumentations(&mut self) {
        self.engine.delete_all_instrumentations();
        self.mem_cb_infos.borrow_mut().clear();
        self.read_gate_id = INVALID_EVENTID;
        self.write_gate_id = INVALID_EVENTID;
        self.memory_logging = MemoryAccessType::empty();
        self.recorder_ids.clear();
    }

    // ---- queries ------------------------------------------------------------

    /// Analysis of the instruction the current callback is attached to.
    /// Only valid while a callback is running.
    pub fn get_inst_analysis(&mut self, ty: AnalysisType) -> Option<Rc<InstAnalysis>> {
        self.engine.current_inst_analysis(ty)
    }

    /// Analysis of any instruction present in the cache.
    pub fn get_cached_inst_analysis(
        &mut self,
        address: Word,
        ty: AnalysisType,
    ) -> Option<Rc<InstAnalysis>> {
        self.engine.cached_inst_analysis(address, ty)
    }

    pub fn get_inst_memory_access(&self) -> Vec<MemoryAccess> {
        self.engine.inst_memory_access()
    }

    pub fn get_bb_memory_access(&self) -> Vec<MemoryAccess> {
        self.engine.bb_memory_access()
    }

    // ---- cache --------------------------------------------------------------

    pub fn precache_basic_block(&mut self, pc: Word) -> bool {
        self.engine.precache_basic_block(pc)
    }

    pub fn clear_cache(&mut self, start: Word, end: Word) {
        self.engine.clear_cache(start, end);
    }

    pub fn clear_all_cache(&mut self) {
        self.engine.clear_all_cache();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }

    // ---- running ------------------------------------------------------------

    /// Run instrumented guest code from `start` until `stop` is reached or
    /// a callback stops the run.
    pub fn run(&mut self, start: Word, stop: Word) -> bool {
        let stop_cb = self.add_code_addr_cb(
            stop,
            InstPosition::PreInst,
            Box::new(|_, _, _| VMAction::Stop),
        );
        let reason = self.engine.run(start, stop);
        self.delete_instrumentation(stop_cb);
        debug!(?reason, "vm run finished");
        reason.is_success()
    }

    /// Call `function` with `args` under instrumentation, following the
    /// host calling convention. Fails when no stack pointer is set.
    pub fn call(&mut self, retval: Option<&mut Word>, function: Word, args: &[Word]) -> bool {
        self.call_a(retval, function, args)
    }

    /// Argument-array form of [`Self::call`].
    pub fn call_a(&mut self, retval: Option<&mut Word>, function: Word, args: &[Word]) -> bool {
        let mut gpr = self.get_gpr_state();
        if gpr.rsp == 0 {
            return false;
        }
        simulate_call(&mut gpr, FAKE_RET_ADDR, args);
        self.set_gpr_state(&gpr);

        let result = self.run(function, FAKE_RET_ADDR);

        if let Some(ret) = retval {
            *ret = self.get_gpr_state().rax;
        }
        result
    }
}

/// Shared pre-position gate: forwards read accesses of the current
/// instruction to every matching virtual callback.
fn read_gate(infos: &MemCBList) -> InstCallback {
    let infos = Rc::clone(infos);
    Box::new(move |vm, gpr, fpr| {
        let mut read_ranges = RangeSet::new();
        for access in vm.get_inst_memory_access() {
            if access.kind.contains(MemoryAccessType::MEMORY_READ) {
                read_ranges.add(access.range());
            }
        }
        dispatch_gate(&infos, vm, gpr, fpr, |info| {
            info.access == MemoryAccessType::MEMORY_READ && read_ranges.overlaps(&info.range)
        })
    })
}

/// Shared post-position gate: forwards write accesses, and read accesses
/// of read-write callbacks, to every matching virtual callback.
fn write_gate(infos: &MemCBList) -> InstCallback {
    let infos = Rc::clone(infos);
    Box::new(move |vm, gpr, fpr| {
        let mut read_ranges = RangeSet::new();
        let mut write_ranges = RangeSet::new();
        for access in vm.get_inst_memory_access() {
            if access.kind.contains(MemoryAccessType::MEMORY_READ) {
                read_ranges.add(access.range());
            }
            if access.kind.contains(MemoryAccessType::MEMORY_WRITE) {
                write_ranges.add(access.range());
            }
        }
        // Read-only callbacks are handled by the read gate.
        dispatch_gate(&infos, vm, gpr, fpr, |info| {
            (info.access.contains(MemoryAccessType::MEMORY_WRITE)
                && write_ranges.overlaps(&info.range))
                || (info.access == MemoryAccessType::MEMORY_READ_WRITE
                    && read_ranges.overlaps(&info.range))
        })
    })
}

fn dispatch_gate(
    infos: &MemCBList,
    vm: &mut crate::engine::VmHandle<'_>,
    gpr: &mut GPRState,
    fpr: &mut FPRState,
    matches: impl Fn(&MemCBInfo) -> bool,
) -> VMAction {
    let ids: Vec<u32> = infos.borrow().iter().map(|(id, _)| *id).collect();
    let mut action = VMAction::Continue;
    for id in ids {
        let cb = {
            let mut borrow = infos.borrow_mut();
            match borrow.iter_mut().find(|(i, _)| *i == id) {
                Some((_, info)) if matches(info) => info.callback.take(),
                _ => None,
            }
        };
        let Some(mut cb) = cb else { continue };
        let act = cb(vm, gpr, fpr);
        {
            let mut borrow = infos.borrow_mut();
            if let Some((_, info)) = borrow.iter_mut().find(|(i, _)| *i == id) {
                info.callback = Some(cb);
            }
        }
        // Keep the most aggressive verdict.
        action = action.max(act);
    }
    action
}
