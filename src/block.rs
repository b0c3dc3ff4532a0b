//! Per-block RAM state. The block lifecycle
//! state machine and the `BlockInfo` record that the allocator and GC
//! both mutate under the device gate.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Allocating,
    Full,
    Collecting,
    Dirty,
    /// Mount-time only: scan has not yet classified this block.
    NeedsScan,
    /// Retired bad block.
    Dead,
    /// Holds checkpoint payload.
    Checkpoint,
}

#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub state: BlockState,
    pub seq_number: u32,
    pub pages_in_use: usize,
    pub soft_del_pages: usize,
    pub has_shrink_hdr: bool,
    pub needs_retiring: bool,
    pub skip_erased_check: bool,
    pub gc_prioritise: bool,
    pub chunk_error_strikes: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            state: BlockState::Empty,
            seq_number: 0,
            pages_in_use: 0,
            soft_del_pages: 0,
            has_shrink_hdr: false,
            needs_retiring: false,
            skip_erased_check: false,
            gc_prioritise: false,
            chunk_error_strikes: 0,
        }
    }
}

impl BlockInfo {
    /// Live (non-soft-deleted) chunk count: a GC victim-selection
    /// heuristic, not a raw occupancy count.
    pub fn live_weight(&self) -> usize {
        self.pages_in_use.saturating_sub(self.soft_del_pages)
    }
}

/// Flat per-block record array, indexed by internal block index
/// (`block - start_block`), alongside its chunk bitmap.
#[derive(Debug)]
pub struct BlockInfoTable {
    blocks: Vec<BlockInfo>,
}

impl BlockInfoTable {
    pub fn new(n_blocks: usize) -> Self {
        Self {
            blocks: (0..n_blocks).map(|_| BlockInfo::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, block: usize) -> &BlockInfo {
        &self.blocks[block]
    }

    pub fn get_mut(&mut self, block: usize) -> &mut BlockInfo {
        &mut self.blocks[block]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BlockInfo)> {
        self.blocks.iter().enumerate()
    }
}
