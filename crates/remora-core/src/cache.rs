//! Execution-block cache keyed by guest basic-block start address.

use std::collections::HashMap;

use remora_types::{Range, Word};
use tracing::{debug, trace};

use crate::exec_block::ExecBlock;

/// Where a cached basic block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLoc {
    /// Index into the block table.
    pub block: usize,
    /// First instruction of the sequence inside that block.
    pub entry_inst: u16,
    pub seq: u16,
}

/// Cache counters, reset with the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub lookup_hit_total: u64,
    pub lookup_miss_total: u64,
    pub sequences_built_total: u64,
    pub blocks_allocated_total: u64,
    pub blocks_invalidated_total: u64,
}

/// Owner of every execution block. Lookup is O(1) expected; invalidation
/// drops whole blocks, removing every key that resolved into them.
#[derive(Default)]
pub struct BlockCache {
    blocks: Vec<Option<ExecBlock>>,
    keys: HashMap<Word, BlockLoc>,
    /// Block currently accepting appended sequences.
    open: Option<usize>,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Cached location of the basic block starting at `pc`, if any.
    pub fn lookup(&mut self, pc: Word) -> Option<BlockLoc> {
        let loc = self.keys.get(&pc).copied();
        if loc.is_some() {
            self.stats.lookup_hit_total += 1;
        } else {
            self.stats.lookup_miss_total += 1;
        }
        loc
    }

    pub fn contains(&self, pc: Word) -> bool {
        self.keys.contains_key(&pc)
    }

    pub fn block(&self, idx: usize) -> &ExecBlock {
        self.blocks[idx].as_ref().expect("stale block index")
    }

    pub fn block_mut(&mut self, idx: usize) -> &mut ExecBlock {
        self.blocks[idx].as_mut().expect("stale block index")
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Like [`Self::block`], but `None` for invalidated slots.
    pub fn try_block(&self, idx: usize) -> Option<&ExecBlock> {
        self.blocks.get(idx).and_then(|b| b.as_ref())
    }

    /// Block new sequences should be appended to, allocating one if needed.
    pub fn open_block(&mut self, with_fpr: bool) -> Result<usize, crate::errors::BuildError> {
        if let Some(idx) = self.open {
            if !self.block(idx).is_sealed() {
                return Ok(idx);
            }
        }
        let block = ExecBlock::new(with_fpr)?;
        let idx = self.blocks.len();
        self.blocks.push(Some(block));
        self.open = Some(idx);
        self.stats.blocks_allocated_total += 1;
        Ok(idx)
    }

    /// Record the freshly appended sequence for `pc`.
    pub fn insert(&mut self, pc: Word, loc: BlockLoc) {
        self.stats.sequences_built_total += 1;
        let prev = self.keys.insert(pc, loc);
        debug_assert!(prev.is_none(), "duplicate build for {pc:#x}");
        trace!(pc = %format_args!("{pc:#x}"), ?loc, "cached basic block");
    }

    /// Drop every block whose covered guest range overlaps `range`.
    pub fn clear_range(&mut self, range: Range<Word>) {
        let mut dropped = Vec::new();
        for (idx, slot) in self.blocks.iter_mut().enumerate() {
            let overlapping = slot
                .as_ref()
                .is_some_and(|b| b.covered().overlaps(&range));
            if overlapping {
                *slot = None;
                dropped.push(idx);
            }
        }
        if dropped.is_empty() {
            return;
        }
        self.stats.blocks_invalidated_total += dropped.len() as u64;
        self.keys.retain(|_, loc| !dropped.contains(&loc.block));
        if self.open.is_some_and(|idx| dropped.contains(&idx)) {
            self.open = None;
        }
        debug!(?range, count = dropped.len(), "invalidated execution blocks");
    }

    /// Drop every block.
    pub fn clear_all(&mut self) {
        let count = self.blocks.iter().filter(|b| b.is_some()).count();
        if count > 0 {
            self.stats.blocks_invalidated_total += count as u64;
            debug!(count, "invalidated all execution blocks");
        }
        self.blocks.clear();
        self.keys.clear();
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn insert_block(cache: &mut BlockCache, pc: Word, guest_len: Word) -> BlockLoc {
        use crate::exec_block::InstSiteTable;
        use crate::patch::generate_inst_patch;

        let idx = cache.open_block(true).unwrap();
        // A nop patch per guest address keeps coverage bookkeeping honest.
        let mut patches = Vec::new();
        let mut sites = Vec::new();
        for (i, addr) in (pc..pc + guest_len).enumerate() {
            let d = remora_x86::decode(&[0x90], addr).unwrap();
            let force_end = addr + 1 == pc + guest_len;
            let base = cache.block(idx).inst_count();
            patches.push(generate_inst_patch(&d, base + i as u16, false, false, force_end).unwrap());
            sites.push(InstSiteTable::default());
        }
        let entry_inst = cache.block(idx).inst_count();
        let seq = cache.block_mut(idx).append_sequence(&patches, sites).unwrap();
        let loc = BlockLoc {
            block: idx,
            entry_inst,
            seq,
        };
        cache.insert(pc, loc);
        loc
    }

    #[test]
    fn lookup_tracks_hits_and_misses() {
        let mut cache = BlockCache::new();
        assert_eq!(cache.lookup(0x1000), None);
        let loc = insert_block(&mut cache, 0x1000, 4);
        assert_eq!(cache.lookup(0x1000), Some(loc));
        let stats = cache.stats();
        assert_eq!(stats.lookup_hit_total, 1);
        assert_eq!(stats.lookup_miss_total, 1);
        assert_eq!(stats.sequences_built_total, 1);
    }

    #[test]
    fn range_invalidation_drops_overlapping_blocks_only() {
        let mut cache = BlockCache::new();
        insert_block(&mut cache, 0x1000, 4);
        // Force the second sequence into a separate block.
        let open = cache.open.unwrap();
        cache.block_mut(open).seal();
        insert_block(&mut cache, 0x9000, 4);

        cache.clear_range(Range::new(0x1002, 0x1003));
        assert!(!cache.contains(0x1000));
        assert!(cache.contains(0x9000));
        assert_eq!(cache.stats().blocks_invalidated_total, 1);
    }

    #[test]
    fn sequences_sharing_a_block_fall_together() {
        let mut cache = BlockCache::new();
        let a = insert_block(&mut cache, 0x1000, 2);
        let b = insert_block(&mut cache, 0x2000, 2);
        assert_eq!(a.block, b.block);

        // Invalidate through the second key's range: both keys must go,
        // because the block is the owning unit.
        cache.clear_range(Range::new(0x2000, 0x2001));
        assert!(!cache.contains(0x1000));
        assert!(!cache.contains(0x2000));
    }

    #[test]
    fn clear_all_resets_everything_but_stats() {
        let mut cache = BlockCache::new();
        insert_block(&mut cache, 0x1000, 2);
        cache.clear_all();
        assert!(!cache.contains(0x1000));
        assert_eq!(cache.stats().blocks_invalidated_total, 1);
        // A new open block can be allocated afterwards.
        assert!(cache.open_block(true).is_ok());
    }
}
