//! Device config and geometry: a struct of operational parameters,
//! validated once at mount time, with derived values computed and
//! cached alongside.

use crate::error::{YaffsError, YaffsResult};

pub const YAFFS_MAX_SHORT_OP_CACHES: usize = 20;
pub const MIN_CHUNK_SIZE_V1: usize = 512;
pub const MIN_CHUNK_SIZE_V2_NO_INBAND: usize = 1024;

/// Operational parameters for one device; anything derived
/// (shifts/masks/widths) is computed by [`DeviceConfig::validate`]
/// into a [`Geometry`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub total_bytes_per_chunk: usize,
    pub chunks_per_block: usize,
    pub start_block: usize,
    pub end_block: usize,
    pub n_reserved_blocks: usize,
    pub n_caches: usize,
    pub is_yaffs2: bool,
    pub inband_tags: bool,
    pub wide_tnodes_disabled: bool,
    pub always_check_erased: bool,
    pub skip_checkpt_rd: bool,
    pub skip_checkpt_wr: bool,
    pub empty_lost_n_found: bool,
    pub disable_soft_del: bool,
    pub hide_lost_n_found: bool,
    pub disable_summary: bool,
    pub defered_dir_update: bool,
    pub cache_bypass_aligned: bool,
    pub max_objects: usize,
    /// Number of write retries before a block is retired on
    /// `WriteVerifyFailure`, as a per-device parameter rather than a
    /// process-wide constant.
    pub wr_attempts: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            total_bytes_per_chunk: 2048,
            chunks_per_block: 64,
            start_block: 0,
            end_block: 999,
            n_reserved_blocks: 5,
            n_caches: 10,
            is_yaffs2: true,
            inband_tags: false,
            wide_tnodes_disabled: false,
            always_check_erased: false,
            skip_checkpt_rd: false,
            skip_checkpt_wr: false,
            empty_lost_n_found: false,
            disable_soft_del: false,
            hide_lost_n_found: false,
            disable_summary: false,
            defered_dir_update: false,
            cache_bypass_aligned: false,
            max_objects: 10_000,
            wr_attempts: 3,
        }
    }
}

/// Values derived from a validated [`DeviceConfig`], computed once.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub total_bytes_per_chunk: usize,
    pub chunks_per_block: usize,
    pub start_block: usize,
    pub end_block: usize,
    pub n_reserved_blocks: usize,
    pub n_caches: usize,
    pub is_yaffs2: bool,
    pub inband_tags: bool,
    pub chunk_shift: u32,
    pub chunk_div: usize,
    pub chunk_mask: usize,
    pub tnode_width: u32,
    pub chunk_grp_bits: u32,
    pub chunk_grp_size: usize,
    pub n_blocks: usize,
    pub wr_attempts: usize,
    pub skip_checkpt_wr: bool,
    pub always_check_erased: bool,
    pub disable_soft_del: bool,
    pub defered_dir_update: bool,
    pub cache_bypass_aligned: bool,
}

impl DeviceConfig {
    pub fn validate(&self) -> YaffsResult<Geometry> {
        let min_chunk = if self.is_yaffs2 && !self.inband_tags {
            MIN_CHUNK_SIZE_V2_NO_INBAND
        } else {
            MIN_CHUNK_SIZE_V1
        };
        if self.total_bytes_per_chunk < min_chunk {
            return Err(YaffsError::BadGeometry {
                reason: format!(
                    "chunk size {} below minimum {}",
                    self.total_bytes_per_chunk, min_chunk
                ),
            });
        }
        if self.chunks_per_block < 2 {
            return Err(YaffsError::BadGeometry {
                reason: "chunks_per_block must be >= 2".into(),
            });
        }
        if self.n_reserved_blocks < 2 {
            return Err(YaffsError::BadGeometry {
                reason: "n_reserved_blocks must be >= 2".into(),
            });
        }
        if self.end_block < self.start_block {
            return Err(YaffsError::BadGeometry {
                reason: "end_block before start_block".into(),
            });
        }
        let n_blocks = self.end_block - self.start_block + 1;
        if n_blocks < self.n_reserved_blocks + 2 {
            return Err(YaffsError::BadGeometry {
                reason: format!(
                    "only {} usable blocks, need at least {}",
                    n_blocks,
                    self.n_reserved_blocks + 2
                ),
            });
        }
        if self.n_caches > YAFFS_MAX_SHORT_OP_CACHES {
            return Err(YaffsError::BadGeometry {
                reason: format!(
                    "n_caches {} exceeds maximum {}",
                    self.n_caches, YAFFS_MAX_SHORT_OP_CACHES
                ),
            });
        }

        let chunk_shift = self.total_bytes_per_chunk.trailing_zeros();
        let is_pow2 = 1usize << chunk_shift == self.total_bytes_per_chunk;
        let (chunk_shift, chunk_div, chunk_mask) = if is_pow2 {
            (chunk_shift, 1, self.total_bytes_per_chunk - 1)
        } else {
            (0, self.total_bytes_per_chunk, 0)
        };

        let n_chunks = n_blocks * self.chunks_per_block;
        let mut tnode_width: u32 = 16;
        if !self.wide_tnodes_disabled {
            while (1u64 << tnode_width) < n_chunks as u64 && tnode_width < 32 {
                tnode_width += 2;
            }
        }
        let needed_bits = 64 - (n_chunks.max(1) as u64 - 1).leading_zeros();
        let chunk_grp_bits = needed_bits.saturating_sub(tnode_width);
        let chunk_grp_size = 1usize << chunk_grp_bits;

        Ok(Geometry {
            total_bytes_per_chunk: self.total_bytes_per_chunk,
            chunks_per_block: self.chunks_per_block,
            start_block: self.start_block,
            end_block: self.end_block,
            n_reserved_blocks: self.n_reserved_blocks,
            n_caches: self.n_caches,
            is_yaffs2: self.is_yaffs2,
            inband_tags: self.inband_tags,
            chunk_shift,
            chunk_div,
            chunk_mask,
            tnode_width,
            chunk_grp_bits: chunk_grp_bits as u32,
            chunk_grp_size,
            n_blocks,
            wr_attempts: self.wr_attempts,
            skip_checkpt_wr: self.skip_checkpt_wr,
            always_check_erased: self.always_check_erased,
            disable_soft_del: self.disable_soft_del,
            defered_dir_update: self.defered_dir_update,
            cache_bypass_aligned: self.cache_bypass_aligned,
        })
    }
}

impl Geometry {
    /// `(chunk, offset) = (addr >> shift, addr & mask)` with a divisor
    /// fallback when the chunk size isn't a power of two.
    pub fn addr_to_chunk_offset(&self, addr: u64) -> (usize, usize) {
        if self.chunk_div == 1 {
            (
                (addr >> self.chunk_shift) as usize,
                (addr as usize) & self.chunk_mask,
            )
        } else {
            (
                (addr / self.chunk_div as u64) as usize,
                (addr % self.chunk_div as u64) as usize,
            )
        }
    }

    pub fn data_bytes_per_chunk(&self) -> usize {
        if self.inband_tags {
            self.total_bytes_per_chunk - crate::tags::INBAND_TAG_BYTES
        } else {
            self.total_bytes_per_chunk
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let g = DeviceConfig::default().validate().unwrap();
        assert_eq!(g.n_blocks, 1000);
    }

    #[test]
    fn rejects_tiny_chunk_size_for_v2() {
        let mut cfg = DeviceConfig::default();
        cfg.total_bytes_per_chunk = 512;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_insufficient_blocks() {
        let mut cfg = DeviceConfig::default();
        cfg.end_block = cfg.start_block + cfg.n_reserved_blocks;
        assert!(cfg.validate().is_err());
    }
}
