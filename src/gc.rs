//! Garbage collector, ordering and constants
//! ported from `examples/original_source/yaffs_guts.c`'s
//! `yaffs_find_gc_block`/`yaffs_gc_block`/`yaffs_check_gc`.

use crate::block::BlockState;
use crate::device::Device;
use crate::error::YaffsResult;
use log::{debug, info};
use nand_driver::NandDriver;

/// Early-exit threshold: a block this close to empty is "good enough"
/// without scanning further for a better victim.
pub const YAFFS_GC_GOOD_ENOUGH: usize = 2;
const BACKGROUND_SCAN_LIMIT: usize = 100;
const GC_NOT_DONE_BG_THRESHOLD: u32 = 10;
const GC_NOT_DONE_FG_THRESHOLD: u32 = 20;

impl<T: NandDriver> Device<T> {
    /// `find_gc_block(aggressive, background)`.
    fn find_gc_block(&mut self, aggressive: bool, background: bool) -> Option<usize> {
        if let Some((block, _)) = self
            .blocks
            .iter()
            .find(|(_, b)| b.gc_prioritise && b.state == BlockState::Full)
        {
            return Some(block);
        }

        let threshold = if aggressive {
            self.geometry.chunks_per_block
        } else {
            self.geometry.chunks_per_block / 2
        };
        let scan_limit = if aggressive {
            self.blocks.len()
        } else {
            (self.blocks.len() / 16 + 1).min(BACKGROUND_SCAN_LIMIT)
        };

        let mut best: Option<(usize, usize)> = None;
        for i in 0..scan_limit.min(self.blocks.len()) {
            let idx = i % self.blocks.len();
            let info = self.blocks.get(idx);
            if info.state != BlockState::Full {
                continue;
            }
            let weight = info.live_weight();
            if weight > threshold {
                continue;
            }
            if weight <= YAFFS_GC_GOOD_ENOUGH {
                return Some(idx);
            }
            if best.map(|(_, w)| weight < w).unwrap_or(true) {
                best = Some((idx, weight));
            }
        }
        let _ = background;
        best.map(|(idx, _)| idx)
    }

    /// Re-reads every chunk in a just-erased block to confirm the
    /// controller's erase actually cleared it, catching a silent erase
    /// failure the driver reported as success.
    fn verify_block_erased(&mut self, block: usize) -> bool {
        let cpb = self.geometry.chunks_per_block;
        let mut buf = vec![0u8; self.geometry.total_bytes_per_chunk];
        for phys_chunk in block * cpb..(block + 1) * cpb {
            match self.driver.read_chunk(phys_chunk, Some(&mut buf), None) {
                Ok(_) if buf.iter().all(|&b| b == 0xFF) => {}
                _ => return false,
            }
        }
        true
    }

    fn oldest_dirty_block(&self) -> Option<usize> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.state == BlockState::Full)
            .min_by_key(|(_, b)| b.seq_number)
            .map(|(idx, _)| idx)
    }

    /// `gc_block(block, whole_block)`.
    fn gc_block(&mut self, block: usize, whole_block: bool) -> YaffsResult<()> {
        self.blocks.get_mut(block).state = BlockState::Collecting;
        self.blocks.get_mut(block).has_shrink_hdr = false;

        if self.bitmap.still_some_chunks(block) {
            let budget = if whole_block {
                self.geometry.chunks_per_block
            } else {
                5
            };
            let mut cleanup: Vec<u32> = Vec::new();
            let mut copied = 0;
            for chunk_in_block in 0..self.geometry.chunks_per_block {
                if copied >= budget {
                    break;
                }
                if !self.bitmap.check_chunk_bit(block, chunk_in_block) {
                    continue;
                }
                let phys_chunk = block * self.geometry.chunks_per_block + chunk_in_block;
                let mut data = vec![0u8; self.geometry.data_bytes_per_chunk()];
                let tag = match self.read_chunk(phys_chunk, Some(&mut data)) {
                    Ok(Some(t)) => t,
                    _ => continue,
                };
                copied += 1;

                let obj_soft_deleted = self
                    .objects
                    .get(tag.obj_id)
                    .map(|o| o.flags.soft_del)
                    .unwrap_or(false);

                if obj_soft_deleted && !tag.is_header() {
                    self.blocks.get_mut(block).soft_del_pages =
                        self.blocks.get(block).soft_del_pages.saturating_sub(1);
                    if let Some(file) = self
                        .objects
                        .get_mut(tag.obj_id)
                        .and_then(|o| o.as_file_mut())
                    {
                        file.n_data_chunks = file.n_data_chunks.saturating_sub(1);
                        if file.n_data_chunks == 0 {
                            cleanup.push(tag.obj_id);
                        }
                    }
                    self.delete_chunk(phys_chunk);
                    continue;
                }

                if tag.is_header() {
                    self.update_oh(tag.obj_id, None, false, 0)?;
                    self.delete_chunk(phys_chunk);
                } else if self.objects.contains(tag.obj_id) {
                    let use_data = &data[..tag.n_bytes as usize];
                    self.wr_data_obj_chunk(tag.obj_id, tag.chunk_id as u64, use_data, true)?;
                    self.delete_chunk(phys_chunk);
                } else {
                    self.delete_chunk(phys_chunk);
                }
            }
            for obj_id in cleanup {
                self.destroy_object(obj_id)?;
            }
        }

        if !self.bitmap.still_some_chunks(block) {
            self.blocks.get_mut(block).state = BlockState::Dirty;
            let erase_ok = self.driver.erase_block(block).is_ok()
                && (!self.geometry.always_check_erased || self.verify_block_erased(block));
            if !erase_ok {
                self.blocks.get_mut(block).state = crate::block::BlockState::Dead;
                self.blocks.get_mut(block).needs_retiring = true;
                let _ = self.driver.mark_bad(block);
                return Ok(());
            }
            self.bitmap.clear_all_chunk_bits(block);
            self.blocks.get_mut(block).state = BlockState::Empty;
            self.blocks.get_mut(block).pages_in_use = 0;
            self.blocks.get_mut(block).soft_del_pages = 0;
            self.allocator.n_erased_blocks += 1;
            debug!("gc reclaimed block {}", block);
        } else {
            self.blocks.get_mut(block).state = BlockState::Full;
        }
        Ok(())
    }

    /// `check_gc(background)`: loop until either enough
    /// erased blocks exist or two full passes make no progress, per
    /// `yaffs_check_gc`'s literal rule.
    pub fn check_gc(&mut self, background: bool) -> YaffsResult<()> {
        if self.read_only {
            return Ok(());
        }
        let min_erased = self.geometry.n_reserved_blocks + self.checkpoint_blocks_required + 1;
        if self.allocator.n_erased_blocks >= min_erased {
            let total_chunks = self.geometry.n_blocks * self.geometry.chunks_per_block;
            if !background && self.allocator.n_erased_blocks * self.geometry.chunks_per_block
                > total_chunks / 4
            {
                return Ok(());
            }
        }

        let aggressive = self.allocator.n_erased_blocks < min_erased;
        let mut passes_without_progress = 0u32;
        let mut not_done = 0u32;

        while self.allocator.n_erased_blocks < self.geometry.n_reserved_blocks {
            let victim = self
                .find_gc_block(aggressive, background)
                .or_else(|| {
                    let threshold = if background {
                        GC_NOT_DONE_BG_THRESHOLD
                    } else {
                        GC_NOT_DONE_FG_THRESHOLD
                    };
                    if not_done >= threshold {
                        self.oldest_dirty_block()
                    } else {
                        None
                    }
                });

            match victim {
                Some(block) => {
                    let erased_before = self.allocator.n_erased_blocks;
                    self.gc_block(block, aggressive)?;
                    if self.allocator.n_erased_blocks > erased_before {
                        passes_without_progress = 0;
                    } else {
                        not_done += 1;
                        passes_without_progress += 1;
                    }
                }
                None => {
                    passes_without_progress += 1;
                }
            }

            if passes_without_progress >= 2 {
                break;
            }
        }
        Ok(())
    }

    /// Background caller entry point: one bounded pass, never
    /// preempting a foreground request.
    pub fn bg_gc(&mut self, urgency: u32) -> YaffsResult<()> {
        info!("background gc pass, urgency={}", urgency);
        self.check_gc(true)
    }
}
