//! The engine loop: fetch → build-or-hit → enter → resolve-next, plus the
//! callback dispatcher that runs at every break-to-host site.

use std::rc::Rc;

use remora_types::{Range, RangeSet, Word};
use remora_x86::DecodedInst;
use tracing::{debug, trace};

use crate::analysis::{AnalysisType, InstAnalysis};
use crate::cache::{BlockCache, BlockLoc};
pub use crate::cache::CacheStats;
use crate::callback::{
    InstPosition, MemoryAccess, VMAction, VMCallback, VMEvent, VMState,
};
use crate::errors::{BuildError, ExitReason};
use crate::exec_block::{InstSiteTable, SiteEntry, NO_OFF};
use crate::memaccess::compute_accesses;
use crate::patch::{generate_inst_patch, InstrRule, RuleKind};
use crate::state::{BreakEvent, FPRState, GPRState};

bitflags::bitflags! {
    /// Engine options fixed at construction; changing them invalidates all
    /// cached blocks because they influence code generation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Options: u32 {
        /// Skip FPR save/restore in the context switch.
        const OPT_DISABLE_FPR = 1 << 0;
        /// Refuse physical memory-access recording.
        const OPT_DISABLE_MEMORY_LOGGING = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on guest instructions per built sequence.
    pub max_seq_insts: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_seq_insts: 256 }
    }
}

struct RuleSlot {
    id: u32,
    rule: InstrRule,
}

struct EventSlot {
    id: u32,
    mask: VMEvent,
    callback: Option<VMCallback>,
}

#[derive(Debug, Clone, Copy)]
struct CurSite {
    block: usize,
    inst: u16,
}

enum PendingClear {
    Ranges(Vec<Range<Word>>),
    All,
}

/// Non-owning engine view passed to every callback invocation.
///
/// Cache mutations requested from inside a callback are deferred to the
/// next dispatch boundary, where no execution block is live.
pub struct VmHandle<'a> {
    pub(crate) engine: &'a mut Engine,
}

impl VmHandle<'_> {
    /// Recorded accesses of the instruction the current callback is
    /// attached to. At a pre-position site writes are not visible yet.
    pub fn get_inst_memory_access(&self) -> Vec<MemoryAccess> {
        self.engine.inst_memory_access()
    }

    /// Recorded accesses of the current sequence so far.
    pub fn get_bb_memory_access(&self) -> Vec<MemoryAccess> {
        self.engine.bb_memory_access()
    }

    /// Analysis of the instruction the current callback is attached to.
    pub fn get_inst_analysis(&mut self, ty: AnalysisType) -> Option<Rc<InstAnalysis>> {
        self.engine.current_inst_analysis(ty)
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
}

/// One engine instance: a single guest execution thread plus its rules,
/// block cache and guest state.
pub struct Engine {
    config: EngineConfig,
    options: Options,
    gpr_state: GPRState,
    fpr_state: FPRState,
    instrumented: RangeSet<Word>,
    rules: Vec<RuleSlot>,
    event_cbs: Vec<EventSlot>,
    next_id: u32,
    cache: BlockCache,
    cur: Option<CurSite>,
    running: bool,
    building: bool,
    pending_clear: Option<PendingClear>,
}

impl Engine {
    pub fn new(config: EngineConfig, options: Options) -> Self {
        Self {
            config,
            options,
            gpr_state: GPRState::default(),
            fpr_state: FPRState::default(),
            instrumented: RangeSet::new(),
            rules: Vec::new(),
            event_cbs: Vec::new(),
            next_id: 0,
            cache: BlockCache::new(),
            cur: None,
            running: false,
            building: false,
            pending_clear: None,
        }
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn set_options(&mut self, options: Options) {
        if options != self.options {
            self.options = options;
            self.clear_all_cache();
        }
    }

    // ---- guest state --------------------------------------------------------

    pub fn gpr_state(&self) -> &GPRState {
        &self.gpr_state
    }

    pub fn gpr_state_mut(&mut self) -> &mut GPRState {
        &mut self.gpr_state
    }

    pub fn fpr_state(&self) -> &FPRState {
        &self.fpr_state
    }

    pub fn fpr_state_mut(&mut self) -> &mut FPRState {
        &mut self.fpr_state
    }

    // ---- instrumented ranges ------------------------------------------------

    pub fn add_instrumented_range(&mut self, start: Word, end: Word) {
        self.instrumented.add(Range::new(start, end));
    }

    pub fn remove_instrumented_range(&mut self, start: Word, end: Word) {
        self.instrumented.remove(Range::new(start, end));
        self.clear_cache(start, end);
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.instrumented.clear();
        self.clear_all_cache();
    }

    pub fn instrumented_ranges(&self) -> &RangeSet<Word> {
        &self.instrumented
    }

    // ---- rules and event callbacks ------------------------------------------

    /// Register a rule. Conservatively drops every cached block, since any
    /// of them could have been built differently under the new rule set.
    pub fn add_instr_rule(&mut self, rule: InstrRule) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.rules.push(RuleSlot { id, rule });
        self.clear_all_cache();
        id
    }

    pub fn add_vm_event_cb(&mut self, mask: VMEvent, callback: VMCallback) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.event_cbs.push(EventSlot {
            id,
            mask,
            callback: Some(callback),
        });
        id
    }

    /// Remove a rule or VM-event callback. Idempotent: the second deletion
    /// of an identifier reports failure.
    pub fn delete_instrumentation(&mut self, id: u32) -> bool {
        if let Some(idx) = self.rules.iter().position(|s| s.id == id) {
            self.rules.remove(idx);
            self.clear_all_cache();
            return true;
        }
        if let Some(idx) = self.event_cbs.iter().position(|s| s.id == id) {
            self.event_cbs.remove(idx);
            return true;
        }
        false
    }

    pub fn delete_all_instrumentations(&mut self) {
        self.rules.clear();
        self.event_cbs.clear();
        self.clear_all_cache();
    }

    // ---- cache --------------------------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Invalidate every block overlapping `[start, end)`. Deferred to the
    /// next dispatch boundary while the engine is running.
    pub fn clear_cache(&mut self, start: Word, end: Word) {
        if start >= end {
            return;
        }
        let range = Range::new(start, end);
        if self.running {
            match &mut self.pending_clear {
                Some(PendingClear::All) => {}
                Some(PendingClear::Ranges(v)) => v.push(range),
                None => self.pending_clear = Some(PendingClear::Ranges(vec![range])),
            }
        } else {
            self.cache.clear_range(range);
        }
    }

    pub fn clear_all_cache(&mut self) {
        if self.running {
            self.pending_clear = Some(PendingClear::All);
        } else {
            self.cache.clear_all();
        }
    }

    fn apply_pending_clears(&mut self) {
        match self.pending_clear.take() {
            None => {}
            Some(PendingClear::All) => self.cache.clear_all(),
            Some(PendingClear::Ranges(ranges)) => {
                for r in ranges {
                    self.cache.clear_range(r);
                }
            }
        }
    }

    /// Build and seal the basic block at `pc` without executing it.
    pub fn precache_basic_block(&mut self, pc: Word) -> bool {
        if self.cache.contains(pc) {
            return true;
        }
        match self.build_block(pc) {
            Ok(_) => true,
            Err(err) => {
                debug!(pc = %format_args!("{pc:#x}"), %err, "precache failed");
                false
            }
        }
    }

    // ---- analysis and memory-access queries ---------------------------------

    /// Analysis of the instruction owning the current break site.
    pub fn current_inst_analysis(&mut self, ty: AnalysisType) -> Option<Rc<InstAnalysis>> {
        let cur = self.cur?;
        let maps = if ty.contains(AnalysisType::ANALYSIS_SYMBOL) {
            remora_procmaps::current_process_maps(false)
        } else {
            Vec::new()
        };
        Some(self.cache.block_mut(cur.block).analysis(cur.inst, ty, &maps))
    }

    /// Analysis of any instruction already present in a cached block.
    pub fn cached_inst_analysis(&mut self, addr: Word, ty: AnalysisType) -> Option<Rc<InstAnalysis>> {
        let maps = if ty.contains(AnalysisType::ANALYSIS_SYMBOL) {
            remora_procmaps::current_process_maps(false)
        } else {
            Vec::new()
        };
        let loc = self.find_cached_inst(addr)?;
        Some(self.cache.block_mut(loc.0).analysis(loc.1, ty, &maps))
    }

    fn find_cached_inst(&self, addr: Word) -> Option<(usize, u16)> {
        for idx in 0..self.cache.block_count() {
            let Some(block) = self.cache.try_block(idx) else {
                continue;
            };
            if !block.covered().contains(addr) {
                continue;
            }
            for inst_id in 0..block.inst_count() {
                if block.inst(inst_id).guest_address() == addr {
                    return Some((idx, inst_id));
                }
            }
        }
        None
    }

    /// Shadow-buffer records of the current instruction.
    pub fn inst_memory_access(&self) -> Vec<MemoryAccess> {
        let Some(cur) = self.cur else {
            return Vec::new();
        };
        let block = self.cache.block(cur.block);
        let addr = block.inst(cur.inst).guest_address();
        block
            .shadow()
            .iter()
            .filter(|a| a.inst_address == addr)
            .copied()
            .collect()
    }

    /// Shadow-buffer records accumulated since the current sequence began.
    pub fn bb_memory_access(&self) -> Vec<MemoryAccess> {
        let Some(cur) = self.cur else {
            return Vec::new();
        };
        self.cache.block(cur.block).shadow().to_vec()
    }

    // ---- building -----------------------------------------------------------

    /// Decode the basic block starting at `pc`, bounded by the instrumented
    /// range it lives in and the per-sequence instruction budget.
    fn decode_sequence(&self, pc: Word) -> Result<Vec<DecodedInst>, BuildError> {
        let range = self
            .instrumented
            .find(pc)
            .ok_or(BuildError::OutsideInstrumentedSpace { addr: pc })?;

        let mut seq = Vec::new();
        let mut addr = pc;
        while seq.len() < self.config.max_seq_insts as usize {
            if !range.contains(addr) {
                break;
            }
            let avail = (range.end - addr).min(remora_x86::MAX_INST_LEN as Word) as usize;
            let mut buf = [0u8; remora_x86::MAX_INST_LEN];
            // SAFETY: addr lies inside a client-instrumented range, which
            // must be mapped readable guest code.
            unsafe {
                core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), avail);
            }
            let decoded = match remora_x86::decode(&buf[..avail], addr) {
                Ok(d) => d,
                Err(err) if seq.is_empty() => {
                    debug!(addr = %format_args!("{addr:#x}"), %err, "undecodable block start");
                    return Err(BuildError::Decode { addr });
                }
                // A decode failure past the first instruction ends the
                // sequence early; execution may never get there.
                Err(_) => break,
            };
            addr = decoded.next_address();
            let terminator = decoded.termination().ends_sequence();
            seq.push(decoded);
            if terminator {
                break;
            }
        }
        if seq.is_empty() {
            return Err(BuildError::Decode { addr: pc });
        }
        Ok(seq)
    }

    /// Dispatch-table entries and site requirements of one instruction
    /// under the current rule set. Shadow recorders come first so the
    /// shadow buffer is filled before any client callback reads it.
    fn match_rules(&mut self, decoded: &DecodedInst) -> InstSiteTable {
        let mut table = InstSiteTable::default();
        let ids: Vec<u32> = self.rules.iter().map(|s| s.id).collect();

        for &id in &ids {
            let Some(slot) = self.rules.iter().find(|s| s.id == id) else {
                continue;
            };
            if !matches!(slot.rule.kind, RuleKind::MemAccessRecord { .. }) {
                continue;
            }
            if !slot.rule.matches(decoded) {
                continue;
            }
            match slot.rule.position() {
                Some(InstPosition::PreInst) => table.pre.push(SiteEntry::Rule(id)),
                Some(InstPosition::PostInst) => table.post.push(SiteEntry::Rule(id)),
                None => {}
            }
        }

        for &id in &ids {
            let Some(idx) = self.rules.iter().position(|s| s.id == id) else {
                continue;
            };
            match &self.rules[idx].rule.kind {
                RuleKind::MemAccessRecord { .. } => {}
                RuleKind::Callback { .. } => {
                    if self.rules[idx].rule.matches(decoded) {
                        match self.rules[idx].rule.position() {
                            Some(InstPosition::PreInst) => table.pre.push(SiteEntry::Rule(id)),
                            Some(InstPosition::PostInst) => table.post.push(SiteEntry::Rule(id)),
                            None => {}
                        }
                    }
                }
                RuleKind::UserRule { analysis, .. } => {
                    if !self.rules[idx].rule.matches(decoded) {
                        continue;
                    }
                    let ty = *analysis;
                    let maps = if ty.contains(AnalysisType::ANALYSIS_SYMBOL) {
                        remora_procmaps::current_process_maps(false)
                    } else {
                        Vec::new()
                    };
                    let inst_analysis = crate::analysis::analyze(decoded, ty, &maps);
                    // Take the callback out so the client can reach the
                    // engine through the handle while it runs.
                    let cb = match &mut self.rules[idx].rule.kind {
                        RuleKind::UserRule { callback, .. } => callback.take(),
                        _ => unreachable!(),
                    };
                    let Some(mut cb) = cb else { continue };
                    let produced = cb(&mut VmHandle { engine: self }, &inst_analysis);
                    if let Some(slot) = self.rules.iter_mut().find(|s| s.id == id) {
                        if let RuleKind::UserRule { callback, .. } = &mut slot.rule.kind {
                            *callback = Some(cb);
                        }
                    }
                    for data in produced {
                        let entry = SiteEntry::Inline {
                            rule_id: id,
                            callback: Some(data.callback),
                        };
                        match data.position {
                            InstPosition::PreInst => table.pre.push(entry),
                            InstPosition::PostInst => table.post.push(entry),
                        }
                    }
                }
            }
        }
        table
    }

    /// Build, lay out and cache the basic block starting at `pc`.
    ///
    /// Single-threaded by design; the assertion documents the at-most-one
    /// build invariant rather than enforcing mutual exclusion.
    fn build_block(&mut self, pc: Word) -> Result<BlockLoc, BuildError> {
        debug_assert!(!self.building, "re-entrant build for {pc:#x}");
        self.building = true;
        let result = self.build_block_inner(pc);
        self.building = false;
        result
    }

    fn build_block_inner(&mut self, pc: Word) -> Result<BlockLoc, BuildError> {
        let seq = self.decode_sequence(pc)?;
        let with_fpr = !self.options.contains(Options::OPT_DISABLE_FPR);

        // First attempt in the open block, one retry in a fresh block when
        // it runs out of space mid-sequence.
        for attempt in 0..2 {
            let block_idx = self.cache.open_block(with_fpr)?;
            let base_id = self.cache.block(block_idx).inst_count();

            let mut patches = Vec::with_capacity(seq.len());
            let mut sites = Vec::with_capacity(seq.len());
            for (i, decoded) in seq.iter().enumerate() {
                let table = self.match_rules(decoded);
                let is_last = i == seq.len() - 1;
                let force_end = is_last && !decoded.termination().ends_sequence();
                let patch = generate_inst_patch(
                    decoded,
                    base_id + i as u16,
                    !table.pre.is_empty(),
                    !table.post.is_empty(),
                    force_end,
                )?;
                patches.push(patch);
                sites.push(table);
            }

            match self.cache.block_mut(block_idx).append_sequence(&patches, sites) {
                Ok(seq_id) => {
                    let loc = BlockLoc {
                        block: block_idx,
                        entry_inst: base_id,
                        seq: seq_id,
                    };
                    self.cache.insert(pc, loc);
                    trace!(
                        pc = %format_args!("{pc:#x}"),
                        insts = seq.len(),
                        attempt,
                        "built basic block"
                    );
                    return Ok(loc);
                }
                Err(BuildError::BlockFull) if attempt == 0 => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BuildError::BlockFull)
    }

    fn obtain_block(&mut self, pc: Word) -> Result<(BlockLoc, bool), BuildError> {
        if let Some(loc) = self.cache.lookup(pc) {
            return Ok((loc, false));
        }
        let loc = self.build_block(pc)?;
        Ok((loc, true))
    }

    // ---- dispatch -----------------------------------------------------------

    fn invoke_rule_callback(&mut self, id: u32, position: InstPosition) -> Option<VMAction> {
        let idx = self.rules.iter().position(|s| s.id == id)?;
        let cb = match &mut self.rules[idx].rule.kind {
            RuleKind::Callback {
                position: rule_pos,
                callback,
            } if *rule_pos == position => callback.take(),
            _ => None,
        };
        let mut cb = cb?;

        let mut gpr = self.gpr_state;
        let mut fpr = self.fpr_state;
        let action = cb(&mut VmHandle { engine: self }, &mut gpr, &mut fpr);
        self.gpr_state = gpr;
        self.fpr_state = fpr;

        if let Some(slot) = self.rules.iter_mut().find(|s| s.id == id) {
            if let RuleKind::Callback { callback, .. } = &mut slot.rule.kind {
                *callback = Some(cb);
            }
        }
        Some(action)
    }

    fn record_accesses(&mut self, block: usize, inst: u16, wanted: crate::callback::MemoryAccessType) {
        let decoded = self.cache.block(block).inst(inst).decoded.clone();
        let accesses = compute_accesses(&decoded, &self.gpr_state, wanted);
        let eb = self.cache.block_mut(block);
        for a in accesses {
            eb.push_shadow(a);
        }
    }

    /// Run every callback attached to `inst` at `position`, in
    /// registration order, and return the most aggressive action.
    fn dispatch_site(&mut self, block: usize, inst: u16, position: InstPosition) -> VMAction {
        let count = {
            let table = self.cache.block(block).sites(inst);
            match position {
                InstPosition::PreInst => table.pre.len(),
                InstPosition::PostInst => table.post.len(),
            }
        };

        let mut action = VMAction::Continue;
        for i in 0..count {
            let entry_kind = {
                let table = self.cache.block(block).sites(inst);
                let entries = match position {
                    InstPosition::PreInst => &table.pre,
                    InstPosition::PostInst => &table.post,
                };
                match &entries[i] {
                    SiteEntry::Rule(id) => Ok(*id),
                    SiteEntry::Inline { .. } => Err(()),
                }
            };

            let fired = match entry_kind {
                Ok(id) => {
                    let record = self.rules.iter().find(|s| s.id == id).and_then(|slot| {
                        match &slot.rule.kind {
                            RuleKind::MemAccessRecord {
                                access,
                                position: rule_pos,
                            } if *rule_pos == position => Some(*access),
                            _ => None,
                        }
                    });
                    if let Some(access) = record {
                        self.record_accesses(block, inst, access);
                        Some(VMAction::Continue)
                    } else {
                        self.invoke_rule_callback(id, position)
                    }
                }
                Err(()) => {
                    let cb = {
                        let table = self.cache.block_mut(block).sites_mut(inst);
                        let entries = match position {
                            InstPosition::PreInst => &mut table.pre,
                            InstPosition::PostInst => &mut table.post,
                        };
                        match &mut entries[i] {
                            SiteEntry::Inline { callback, .. } => callback.take(),
                            SiteEntry::Rule(_) => None,
                        }
                    };
                    cb.map(|mut cb| {
                        let mut gpr = self.gpr_state;
                        let mut fpr = self.fpr_state;
                        let act = cb(&mut VmHandle { engine: self }, &mut gpr, &mut fpr);
                        self.gpr_state = gpr;
                        self.fpr_state = fpr;
                        let table = self.cache.block_mut(block).sites_mut(inst);
                        let entries = match position {
                            InstPosition::PreInst => &mut table.pre,
                            InstPosition::PostInst => &mut table.post,
                        };
                        if let SiteEntry::Inline { callback, .. } = &mut entries[i] {
                            *callback = Some(cb);
                        }
                        act
                    })
                }
            };

            if let Some(act) = fired {
                action = action.max(act);
            }
        }
        action
    }

    fn deliver_vm_events(&mut self, state: VMState) -> VMAction {
        let ids: Vec<u32> = self
            .event_cbs
            .iter()
            .filter(|s| s.mask.intersects(state.event))
            .map(|s| s.id)
            .collect();
        let mut action = VMAction::Continue;
        for id in ids {
            let cb = self
                .event_cbs
                .iter_mut()
                .find(|s| s.id == id)
                .and_then(|s| s.callback.take());
            let Some(mut cb) = cb else { continue };
            let mut gpr = self.gpr_state;
            let mut fpr = self.fpr_state;
            let act = cb(&mut VmHandle { engine: self }, &state, &mut gpr, &mut fpr);
            self.gpr_state = gpr;
            self.fpr_state = fpr;
            if let Some(slot) = self.event_cbs.iter_mut().find(|s| s.id == id) {
                slot.callback = Some(cb);
            }
            action = action.max(act);
        }
        action
    }

    fn vm_state_for(&self, loc: BlockLoc, event: VMEvent) -> VMState {
        let seq = self.cache.block(loc.block).seq(loc.seq).clone();
        VMState {
            event,
            basic_block_start: seq.guest.start,
            basic_block_end: seq.guest.end,
            sequence_start: seq.guest.start,
            sequence_end: seq.guest.end,
        }
    }

    // ---- the loop -----------------------------------------------------------

    /// Execute instrumented guest code from `start` until a callback stops
    /// the run, the guest PC reaches `stop`, or execution leaves the
    /// engine's reach.
    pub fn run(&mut self, start: Word, stop: Word) -> ExitReason {
        self.gpr_state.rip = start;
        self.running = true;

        let reason = loop {
            let pc = self.gpr_state.rip;
            if pc == stop {
                break ExitReason::ReachedStop;
            }
            self.apply_pending_clears();
            if !self.instrumented.contains(pc) {
                debug!(pc = %format_args!("{pc:#x}"), "execution left instrumented space");
                let state = VMState {
                    event: VMEvent::EXEC_TRANSFER_CALL,
                    basic_block_start: pc,
                    basic_block_end: pc,
                    sequence_start: pc,
                    sequence_end: pc,
                };
                self.deliver_vm_events(state);
                break ExitReason::LeftInstrumentedSpace(pc);
            }

            let (loc, built) = match self.obtain_block(pc) {
                Ok(x) => x,
                Err(err) => {
                    debug!(pc = %format_args!("{pc:#x}"), %err, "cannot instrument block");
                    break ExitReason::UnmappedCode(pc);
                }
            };

            let mut entry_event = VMEvent::BASIC_BLOCK_ENTRY | VMEvent::SEQUENCE_ENTRY;
            if built {
                entry_event |= VMEvent::BASIC_BLOCK_NEW;
            }
            let state = self.vm_state_for(loc, entry_event);
            if self.deliver_vm_events(state) == VMAction::Stop {
                break ExitReason::Stopped;
            }

            self.cache.block_mut(loc.block).clear_shadow();
            let mut entry_off = self.cache.block(loc.block).inst(loc.entry_inst).start_off();

            let block_exit: Option<ExitReason> = loop {
                let summary = {
                    let Engine {
                        ref mut cache,
                        ref mut gpr_state,
                        ref mut fpr_state,
                        ..
                    } = *self;
                    match cache
                        .block_mut(loc.block)
                        .execute(entry_off, loc.seq, gpr_state, fpr_state)
                    {
                        Ok(s) => s,
                        Err(err) => {
                            debug!(%err, "block entry failed");
                            break Some(ExitReason::UnmappedCode(pc));
                        }
                    }
                };

                match summary.event {
                    BreakEvent::SequenceEnd => {
                        self.gpr_state.rip = summary.selector;
                        break None;
                    }
                    BreakEvent::PreInst | BreakEvent::PostInst => {
                        let position = if summary.event == BreakEvent::PreInst {
                            InstPosition::PreInst
                        } else {
                            InstPosition::PostInst
                        };
                        self.gpr_state.rip = summary.selector;
                        self.cur = Some(CurSite {
                            block: loc.block,
                            inst: summary.inst_id,
                        });
                        let action = self.dispatch_site(loc.block, summary.inst_id, position);
                        self.cur = None;

                        match action {
                            VMAction::Continue => {
                                entry_off = summary
                                    .resume_off
                                    .expect("callback sites always record a resume address");
                            }
                            VMAction::SkipInst | VMAction::SkipPatch => {
                                let (terminator, post_off, skip_off, next) = {
                                    let e = self.cache.block(loc.block).inst(summary.inst_id);
                                    (
                                        e.terminator,
                                        e.post_off,
                                        e.skip_rest_off(),
                                        e.decoded.next_address() as Word,
                                    )
                                };
                                if terminator {
                                    if position == InstPosition::PreInst {
                                        // Skipping a terminator suppresses
                                        // the transfer: fall through.
                                        self.gpr_state.rip = next;
                                    }
                                    // At post position the transfer already
                                    // happened; rip holds the target.
                                    break None;
                                }
                                entry_off = if action == VMAction::SkipInst
                                    && position == InstPosition::PreInst
                                    && post_off != NO_OFF
                                {
                                    post_off
                                } else {
                                    skip_off
                                };
                            }
                            VMAction::BreakToVm => break None,
                            VMAction::Stop => break Some(ExitReason::Stopped),
                        }
                    }
                }
            };

            let state = self.vm_state_for(
                loc,
                VMEvent::SEQUENCE_EXIT | VMEvent::BASIC_BLOCK_EXIT,
            );
            let exit_action = self.deliver_vm_events(state);
            if let Some(reason) = block_exit {
                break reason;
            }
            if exit_action == VMAction::Stop {
                break ExitReason::Stopped;
            }
        };

        self.running = false;
        self.apply_pending_clears();
        debug!(?reason, "engine run finished");
        reason
    }
}
