//! Execution blocks: page-backed buffers holding rewritten guest code next
//! to the context image the generated code reads and writes.
//!
//! A block owns one anonymous mapping split into a *code area* and a *data
//! area*. The code area starts with the context-switch prologue and
//! epilogue, followed by the patched sequences appended over the block's
//! lifetime. The data area holds the [`Context`] image and the constant
//! pool. Permissions flip between RW (while appending) and RX (while
//! executing); once the block is sealed its code bytes never change again.

use std::rc::Rc;

use remora_types::{MemoryMap, Range, RangeSet, Word};
use remora_x86::DecodedInst;
use tracing::{debug, trace};

use crate::analysis::{analyze, AnalysisType, InstAnalysis};
use crate::callback::{InstCallback, MemoryAccess};
use crate::errors::BuildError;
use crate::patch::{ConstPool, InstPatch, RelocatableInst, RelocationLayout, UnitKind};
use crate::state::{BreakEvent, Context, FPRState, GPRState};

/// Code area capacity of one block.
const CODE_AREA_SIZE: usize = 0x10000;
/// Data area capacity (context image + constant pool).
const DATA_AREA_SIZE: usize = 0x1000;

/// Offset of the constant pool inside the data area.
fn const_pool_off() -> usize {
    (core::mem::size_of::<Context>() + 15) & !15
}

/// Sentinel for "no offset recorded".
pub const NO_OFF: u32 = u32::MAX;

/// One dispatch-table entry of a callback site.
pub enum SiteEntry {
    /// An engine rule, resolved by identifier at dispatch time.
    Rule(u32),
    /// A callback produced at patch time by a client instrumentation rule.
    /// Taken out of its slot while it runs.
    Inline {
        rule_id: u32,
        callback: Option<InstCallback>,
    },
}

impl core::fmt::Debug for SiteEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SiteEntry::Rule(id) => write!(f, "Rule({id})"),
            SiteEntry::Inline { rule_id, .. } => write!(f, "Inline({rule_id})"),
        }
    }
}

/// Pre- and post-position dispatch tables of one instruction.
#[derive(Debug, Default)]
pub struct InstSiteTable {
    pub pre: Vec<SiteEntry>,
    pub post: Vec<SiteEntry>,
}

/// Per-instruction metadata recorded while writing a sequence.
#[derive(Debug)]
pub struct InstEntry {
    pub decoded: DecodedInst,
    /// Start of the pre-callback site, [`NO_OFF`] when absent.
    pub pre_off: u32,
    /// Start of the semantics unit; this is where `SkipPatch` resumes from
    /// the previous instruction.
    pub sem_off: u32,
    /// Start of the post-callback site, [`NO_OFF`] when absent.
    pub post_off: u32,
    /// Start of the sequence-end unit, [`NO_OFF`] when this instruction
    /// does not close its sequence.
    pub seqend_off: u32,
    /// First byte past the instruction's whole patch.
    pub end_off: u32,
    pub seq: u16,
    pub terminator: bool,
}

impl InstEntry {
    /// Host offset at which a fresh execution of this instruction starts.
    pub fn start_off(&self) -> u32 {
        if self.pre_off != NO_OFF {
            self.pre_off
        } else {
            self.sem_off
        }
    }

    pub fn guest_address(&self) -> Word {
        self.decoded.address() as Word
    }

    /// Resume offset that skips everything left of this instruction's patch
    /// while still running the sequence-end bookkeeping.
    pub fn skip_rest_off(&self) -> u32 {
        if self.seqend_off != NO_OFF {
            self.seqend_off
        } else {
            self.end_off
        }
    }
}

/// One guest basic block laid into the code area.
#[derive(Debug, Clone)]
pub struct SeqEntry {
    pub first_inst: u16,
    pub last_inst: u16,
    pub guest: Range<Word>,
}

/// Exit summary of one block entry.
#[derive(Debug, Clone, Copy)]
pub struct BreakSummary {
    pub event: BreakEvent,
    /// Next guest PC materialized by the break.
    pub selector: Word,
    /// Code-area offset to resume at after a callback site, if any.
    pub resume_off: Option<u32>,
    pub inst_id: u16,
}

pub struct ExecBlock {
    base: *mut u8,
    map_size: usize,
    code_len: usize,
    epilogue_off: usize,
    sealed: bool,
    executable: bool,
    with_fpr: bool,

    insts: Vec<InstEntry>,
    seqs: Vec<SeqEntry>,
    covered: RangeSet<Word>,
    sites: Vec<InstSiteTable>,
    analysis_cache: Vec<Option<(AnalysisType, Rc<InstAnalysis>)>>,
    shadow: Vec<MemoryAccess>,
    consts: ConstPool,
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        // SAFETY: base/map_size came from a successful mmap in `new`.
        unsafe {
            libc::munmap(self.base.cast(), self.map_size);
        }
    }
}

impl ExecBlock {
    /// Allocate an empty block and lay down its prologue and epilogue.
    pub fn new(with_fpr: bool) -> Result<Self, BuildError> {
        let map_size = CODE_AREA_SIZE + DATA_AREA_SIZE;
        // SAFETY: plain anonymous mapping; failure is checked below.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BuildError::Alloc(std::io::Error::last_os_error()));
        }

        let mut block = Self {
            base: base.cast(),
            map_size,
            code_len: 0,
            epilogue_off: 0,
            sealed: false,
            executable: false,
            with_fpr,
            insts: Vec::new(),
            seqs: Vec::new(),
            covered: RangeSet::new(),
            sites: Vec::new(),
            analysis_cache: Vec::new(),
            shadow: Vec::new(),
            consts: ConstPool::default(),
        };

        *block.context_mut() = Context::default();
        block.write_context_switch()?;
        debug!(base = ?block.base, "allocated execution block");
        Ok(block)
    }

    pub fn code_base(&self) -> Word {
        self.base as Word
    }

    fn data_base(&self) -> Word {
        self.base as Word + CODE_AREA_SIZE as Word
    }

    pub fn context(&self) -> &Context {
        // SAFETY: the data area starts with a Context initialized in `new`;
        // the mapping is page aligned, satisfying the 16-byte alignment.
        unsafe { &*(self.data_base() as *const Context) }
    }

    pub fn context_mut(&mut self) -> &mut Context {
        // SAFETY: as in `context`.
        unsafe { &mut *(self.data_base() as *mut Context) }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Mark the block full: no sequence will ever be appended again and the
    /// code bytes are final.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn covered(&self) -> &RangeSet<Word> {
        &self.covered
    }

    pub fn inst(&self, id: u16) -> &InstEntry {
        &self.insts[id as usize]
    }

    pub fn inst_count(&self) -> u16 {
        self.insts.len() as u16
    }

    pub fn seq(&self, id: u16) -> &SeqEntry {
        &self.seqs[id as usize]
    }

    pub fn sites(&self, inst: u16) -> &InstSiteTable {
        &self.sites[inst as usize]
    }

    pub fn sites_mut(&mut self, inst: u16) -> &mut InstSiteTable {
        &mut self.sites[inst as usize]
    }

    // ---- shadow buffer ------------------------------------------------------

    pub fn clear_shadow(&mut self) {
        self.shadow.clear();
    }

    pub fn push_shadow(&mut self, access: MemoryAccess) {
        self.shadow.push(access);
    }

    pub fn shadow(&self) -> &[MemoryAccess] {
        &self.shadow
    }

    // ---- analysis cache -----------------------------------------------------

    /// Analysis of `inst`, cached with the union of all requested flags.
    pub fn analysis(
        &mut self,
        inst: u16,
        ty: AnalysisType,
        maps: &[MemoryMap],
    ) -> Rc<InstAnalysis> {
        let slot = &mut self.analysis_cache[inst as usize];
        if let Some((cached_ty, cached)) = slot {
            if cached_ty.contains(ty) {
                return Rc::clone(cached);
            }
        }
        let want = match slot {
            Some((cached_ty, _)) => *cached_ty | ty,
            None => ty,
        };
        let analysis = Rc::new(analyze(&self.insts[inst as usize].decoded, want, maps));
        *slot = Some((want, Rc::clone(&analysis)));
        analysis
    }

    // ---- permission flips ---------------------------------------------------

    fn protect_code(&mut self, prot: libc::c_int, executable: bool) -> Result<(), BuildError> {
        // SAFETY: base is page aligned, the code area is a whole number of
        // pages inside our own mapping.
        let rc = unsafe { libc::mprotect(self.base.cast(), CODE_AREA_SIZE, prot) };
        if rc != 0 {
            return Err(BuildError::Protect(std::io::Error::last_os_error()));
        }
        self.executable = executable;
        Ok(())
    }

    fn make_writable(&mut self) -> Result<(), BuildError> {
        if self.executable {
            self.protect_code(libc::PROT_READ | libc::PROT_WRITE, false)?;
        }
        Ok(())
    }

    fn make_executable(&mut self) -> Result<(), BuildError> {
        if !self.executable {
            self.protect_code(libc::PROT_READ | libc::PROT_EXEC, true)?;
        }
        Ok(())
    }

    // ---- writing ------------------------------------------------------------

    fn write_bytes(&mut self, off: usize, bytes: &[u8]) {
        debug_assert!(off + bytes.len() <= CODE_AREA_SIZE);
        // SAFETY: bounds asserted above; area is writable while building.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), bytes.len());
        }
    }

    fn write_const_pool(&mut self) {
        let off = const_pool_off();
        debug_assert!(off + self.consts.len() * 8 <= DATA_AREA_SIZE);
        for (i, &v) in self.consts.values().iter().enumerate() {
            // SAFETY: bounds asserted above; the data area stays writable.
            unsafe {
                ((self.data_base() as usize + off + i * 8) as *mut u64).write_unaligned(v);
            }
        }
    }

    /// Emit the prologue and epilogue at the top of the code area.
    fn write_context_switch(&mut self) -> Result<(), BuildError> {
        let prologue = crate::patch::prologue(self.with_fpr);
        let epilogue = crate::patch::epilogue(self.with_fpr);

        // The prologue must start at offset 0: entering a block is a call
        // to its base address.
        let prologue_end = self.layout_and_write(0, &[prologue.as_slice()])?;
        self.epilogue_off = prologue_end;
        let code_end = self.layout_and_write(prologue_end, &[epilogue.as_slice()])?;
        self.code_len = code_end;
        Ok(())
    }

    /// Two-pass unit writer: size every instruction at its final position,
    /// then encode with resolved holes. Returns the offset past the last
    /// written byte.
    fn layout_and_write(
        &mut self,
        start: usize,
        units: &[&[RelocatableInst]],
    ) -> Result<usize, BuildError> {
        // Sizing pass: per-unit, per-instruction offsets. Hole values that
        // are not yet known (unit end, skip targets) are substituted with
        // the write position; template sizes do not depend on them.
        let mut unit_offs: Vec<Vec<usize>> = Vec::with_capacity(units.len());
        let mut pos = start;
        for unit in units {
            let mut offs = Vec::with_capacity(unit.len());
            for inst in unit.iter() {
                offs.push(pos);
                let ip = self.code_base() + pos as Word;
                let mut layout = self.layout(ip, ip);
                let bytes = inst.encode(ip, &mut layout)?;
                pos += bytes.len();
            }
            offs.push(pos); // end-of-unit marker
            unit_offs.push(offs);
        }
        if pos > CODE_AREA_SIZE || const_pool_off() + self.consts.len() * 8 > DATA_AREA_SIZE {
            return Err(BuildError::BlockFull);
        }

        // Encoding pass with real hole values.
        for (unit, offs) in units.iter().zip(&unit_offs) {
            let unit_end = self.code_base() + offs[unit.len()] as Word;
            for (i, inst) in unit.iter().enumerate() {
                let ip = self.code_base() + offs[i] as Word;
                let skip_target = {
                    let idx = (i + 1 + inst.skip_count()).min(unit.len());
                    self.code_base() + offs[idx] as Word
                };
                let mut layout = self.layout(unit_end, skip_target);
                let bytes = inst.encode(ip, &mut layout)?;
                debug_assert_eq!(offs[i] + bytes.len(), offs[i + 1]);
                self.write_bytes(offs[i], &bytes);
            }
        }
        Ok(pos)
    }

    fn layout(&mut self, unit_end: Word, skip_target: Word) -> RelocationLayout<'_> {
        RelocationLayout {
            data_base: self.base as u64 + CODE_AREA_SIZE as u64,
            const_base: self.base as u64 + (CODE_AREA_SIZE + const_pool_off()) as u64,
            epilogue: self.base as u64 + self.epilogue_off as u64,
            unit_end,
            skip_target,
            consts: &mut self.consts,
        }
    }

    /// Append one patched sequence. On [`BuildError::BlockFull`] the block
    /// is sealed with its previous contents intact and the caller retries
    /// in a fresh block.
    pub fn append_sequence(
        &mut self,
        patches: &[InstPatch],
        sites: Vec<InstSiteTable>,
    ) -> Result<u16, BuildError> {
        debug_assert!(!self.sealed, "append to a sealed block");
        debug_assert_eq!(patches.len(), sites.len());
        self.make_writable()?;

        let unit_lists: Vec<Vec<&[RelocatableInst]>> = patches
            .iter()
            .map(|p| p.units.iter().map(|u| u.insts.as_slice()).collect())
            .collect();
        let flat: Vec<&[RelocatableInst]> = unit_lists.iter().flatten().copied().collect();

        let start = self.code_len;
        let end = match self.layout_and_write(start, &flat) {
            Ok(end) => end,
            Err(BuildError::BlockFull) => {
                self.seal();
                trace!(code_len = self.code_len, "execution block full, sealing");
                return Err(BuildError::BlockFull);
            }
            Err(e) => return Err(e),
        };

        // Rebuild the per-unit offsets to fill the instruction table. The
        // sizing is deterministic, so re-walking the flat layout is exact.
        let first_inst = self.insts.len() as u16;
        let seq_id = self.seqs.len() as u16;
        let mut pos = start;
        let mut flat_idx = 0;
        for (patch, units) in patches.iter().zip(&unit_lists) {
            let mut entry = InstEntry {
                decoded: patch.decoded.clone(),
                pre_off: NO_OFF,
                sem_off: 0,
                post_off: NO_OFF,
                seqend_off: NO_OFF,
                end_off: 0,
                seq: seq_id,
                terminator: patch.terminator,
            };
            for (unit, insts) in patch.units.iter().zip(units.iter()) {
                let unit_start = pos as u32;
                for inst in insts.iter() {
                    let ip = self.code_base() + pos as Word;
                    let mut layout = self.layout(ip, ip);
                    pos += inst.encode(ip, &mut layout).expect("sized in first pass").len();
                }
                match unit.kind {
                    UnitKind::PreSite => entry.pre_off = unit_start,
                    UnitKind::Semantics => entry.sem_off = unit_start,
                    UnitKind::PostSite => entry.post_off = unit_start,
                    UnitKind::SequenceEnd => entry.seqend_off = unit_start,
                }
            }
            entry.end_off = pos as u32;
            self.insts.push(entry);
            self.analysis_cache.push(None);
            flat_idx += units.len();
        }
        debug_assert_eq!(flat_idx, flat.len());
        debug_assert_eq!(pos, end);
        self.code_len = end;

        let guest = Range::new(
            patches[0].decoded.address() as Word,
            patches[patches.len() - 1].decoded.next_address() as Word,
        );
        self.covered.add(guest);
        self.seqs.push(SeqEntry {
            first_inst,
            last_inst: self.insts.len() as u16 - 1,
            guest,
        });
        self.sites.extend(sites);
        self.write_const_pool();

        trace!(
            seq = seq_id,
            guest = ?guest,
            code_len = self.code_len,
            "appended sequence"
        );
        Ok(seq_id)
    }

    // ---- execution ----------------------------------------------------------

    /// Enter the block at `entry_off` with the given guest state and run
    /// until the next break-to-host.
    pub fn execute(
        &mut self,
        entry_off: u32,
        seq_id: u16,
        gpr: &mut GPRState,
        fpr: &mut FPRState,
    ) -> Result<BreakSummary, BuildError> {
        self.make_executable()?;
        let code_base = self.code_base();
        {
            let ctx = self.context_mut();
            ctx.gpr_state = *gpr;
            ctx.fpr_state = *fpr;
            ctx.host_state.entry = code_base + entry_off as Word;
            ctx.host_state.seq_id = seq_id as Word;
            ctx.host_state.resume = 0;
        }

        // SAFETY: the code area holds the prologue at offset 0 followed by
        // sealed-or-complete patched units; it was just made executable.
        // The prologue/epilogue pair preserves the host's callee-saved
        // registers and stack, so this behaves as a plain call.
        unsafe {
            let entry: unsafe extern "C" fn() = core::mem::transmute(self.base);
            entry();
        }

        let ctx = self.context();
        *gpr = ctx.gpr_state;
        *fpr = ctx.fpr_state;
        let event = BreakEvent::from_word(ctx.host_state.event)
            .expect("generated code stores a valid break event");
        let resume_off = if ctx.host_state.resume == 0 {
            None
        } else {
            Some((ctx.host_state.resume - code_base) as u32)
        };
        Ok(BreakSummary {
            event,
            selector: ctx.host_state.selector,
            resume_off,
            inst_id: ctx.host_state.inst_id as u16,
        })
    }
}
