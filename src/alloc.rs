//! Allocator: chooses an empty block, streams pages
//! linearly within it, and reserves space for the GC working set.

use crate::bitmap::ChunkBitmap;
use crate::block::{BlockInfoTable, BlockState};
use crate::error::{YaffsError, YaffsResult};
use crate::geometry::Geometry;

#[derive(Debug)]
pub struct Allocator {
    alloc_block: Option<usize>,
    alloc_page: usize,
    alloc_block_finder: usize,
    pub seq_number: u32,
    pub n_free_chunks: usize,
    pub n_erased_blocks: usize,
}

impl Allocator {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            alloc_block: None,
            alloc_page: 0,
            alloc_block_finder: 0,
            seq_number: 0,
            n_free_chunks: 0,
            n_erased_blocks: 0,
        }
    }

    /// Restores allocator cursors after a scan or checkpoint restore,
    /// which is the only time these are set from outside `alloc_chunk`.
    pub fn restore(
        &mut self,
        seq_number: u32,
        n_free_chunks: usize,
        n_erased_blocks: usize,
    ) {
        self.seq_number = seq_number;
        self.n_free_chunks = n_free_chunks;
        self.n_erased_blocks = n_erased_blocks;
    }

    fn find_empty_block(&mut self, blocks: &BlockInfoTable, geometry: &Geometry) -> Option<usize> {
        let n = blocks.len();
        for i in 0..n {
            let idx = (self.alloc_block_finder + i) % n;
            if blocks.get(idx).state == BlockState::Empty {
                self.alloc_block_finder = (idx + 1) % n;
                let _ = geometry;
                return Some(idx);
            }
        }
        None
    }

    /// `alloc_chunk(use_reserve) -> (phys_chunk, block) | OutOfSpace`
    ///. `checkpoint_blocks_required` is folded into the
    /// reserve threshold by the caller via `extra_reserve`.
    pub fn alloc_chunk(
        &mut self,
        use_reserve: bool,
        extra_reserve_chunks: usize,
        blocks: &mut BlockInfoTable,
        bitmap: &mut ChunkBitmap,
        geometry: &Geometry,
    ) -> YaffsResult<(usize, usize)> {
        if self.alloc_block.is_none() {
            let block = self
                .find_empty_block(blocks, geometry)
                .ok_or(YaffsError::OutOfSpace)?;
            blocks.get_mut(block).state = BlockState::Allocating;
            self.seq_number += 1;
            blocks.get_mut(block).seq_number = self.seq_number;
            self.n_erased_blocks -= 1;
            self.alloc_block = Some(block);
            self.alloc_page = 0;
        }

        let reserve_chunks =
            (geometry.n_reserved_blocks * geometry.chunks_per_block) + extra_reserve_chunks;
        if !use_reserve && self.n_free_chunks <= reserve_chunks {
            return Err(YaffsError::OutOfSpace);
        }

        let block = self.alloc_block.unwrap();
        let chunk_in_block = self.alloc_page;
        let phys_chunk = block * geometry.chunks_per_block + chunk_in_block;

        bitmap.set_chunk_bit(block, chunk_in_block);
        blocks.get_mut(block).pages_in_use += 1;
        self.n_free_chunks -= 1;

        self.alloc_page += 1;
        if self.alloc_page == geometry.chunks_per_block {
            blocks.get_mut(block).state = BlockState::Full;
            self.alloc_block = None;
            self.alloc_page = 0;
        }

        Ok((phys_chunk, block))
    }

    /// Immediately closes the current allocation block after a write
    /// error so a damaged chunk doesn't poison later writes in the same
    /// block.
    pub fn skip_rest_of_block(&mut self, blocks: &mut BlockInfoTable) {
        if let Some(block) = self.alloc_block.take() {
            blocks.get_mut(block).state = BlockState::Full;
            self.alloc_page = 0;
        }
    }

    pub fn current_alloc_block(&self) -> Option<usize> {
        self.alloc_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DeviceConfig;

    fn setup() -> (Geometry, BlockInfoTable, ChunkBitmap, Allocator) {
        let mut cfg = DeviceConfig::default();
        cfg.chunks_per_block = 4;
        cfg.start_block = 0;
        cfg.end_block = 9;
        cfg.n_reserved_blocks = 2;
        let geometry = cfg.validate().unwrap();
        let mut blocks = BlockInfoTable::new(geometry.n_blocks);
        let bitmap = ChunkBitmap::new(geometry.n_blocks, geometry.chunks_per_block);
        let mut alloc = Allocator::new(&geometry);
        let total_chunks = geometry.n_blocks * geometry.chunks_per_block;
        alloc.restore(0, total_chunks, geometry.n_blocks);
        for i in 0..geometry.n_blocks {
            blocks.get_mut(i).state = BlockState::Empty;
        }
        (geometry, blocks, bitmap, alloc)
    }

    #[test]
    fn linear_allocation_fills_a_block_then_moves_on() {
        let (geometry, mut blocks, mut bitmap, mut alloc) = setup();
        let mut chunks = vec![];
        for _ in 0..geometry.chunks_per_block {
            let (c, b) = alloc
                .alloc_chunk(true, 0, &mut blocks, &mut bitmap, &geometry)
                .unwrap();
            chunks.push((c, b));
        }
        assert!(chunks.windows(2).all(|w| w[0].1 == w[1].1));
        assert_eq!(blocks.get(chunks[0].1).state, BlockState::Full);
        let (_, b2) = alloc
            .alloc_chunk(true, 0, &mut blocks, &mut bitmap, &geometry)
            .unwrap();
        assert_ne!(b2, chunks[0].1);
    }

    #[test]
    fn reserve_denies_non_reserve_allocation_near_limit() {
        let (geometry, mut blocks, mut bitmap, mut alloc) = setup();
        let reserve = geometry.n_reserved_blocks * geometry.chunks_per_block;
        alloc.n_free_chunks = reserve;
        let err = alloc.alloc_chunk(false, 0, &mut blocks, &mut bitmap, &geometry);
        assert!(err.is_err());
        assert!(alloc
            .alloc_chunk(true, 0, &mut blocks, &mut bitmap, &geometry)
            .is_ok());
    }
}
