//! In-RAM NAND simulator used by the engine's own tests and by the
//! `yaffsctl` CLI for quick experiments. Holds real backing storage,
//! since mount-scan tests depend on reading back exactly what was
//! written.

use crate::{EccResult, NandDriver, NandGeometry, NandStats};
use anyhow::{bail, Result};

pub struct MemNandDriver {
    geometry: NandGeometry,
    data: Vec<u8>,
    spare: Vec<u8>,
    /// Per-chunk programmed flag; cleared on erase. Writing an already
    /// programmed chunk without an intervening erase is a driver bug in
    /// a real NAND and is rejected here rather than silently allowed,
    /// so tests catch allocator mistakes instead of masking them.
    programmed: Vec<bool>,
    bad_blocks: Vec<bool>,
    stats: NandStats,
}

impl MemNandDriver {
    pub fn new(geometry: NandGeometry) -> Self {
        let n_chunks = geometry.chunks_per_block * geometry.n_blocks;
        Self {
            data: vec![0xFFu8; n_chunks * geometry.total_bytes_per_chunk],
            spare: vec![0xFFu8; n_chunks * geometry.spare_bytes_per_chunk],
            programmed: vec![false; n_chunks],
            bad_blocks: vec![false; geometry.n_blocks],
            stats: NandStats::default(),
            geometry,
        }
    }

    fn data_range(&self, chunk: usize) -> std::ops::Range<usize> {
        let sz = self.geometry.total_bytes_per_chunk;
        chunk * sz..(chunk + 1) * sz
    }

    fn spare_range(&self, chunk: usize) -> std::ops::Range<usize> {
        let sz = self.geometry.spare_bytes_per_chunk;
        chunk * sz..(chunk + 1) * sz
    }

    /// Test hook: corrupt a chunk's data in place without going through
    /// the driver interface, simulating an ECC-unfixable bit flip.
    pub fn corrupt_chunk(&mut self, chunk: usize) {
        let range = self.data_range(chunk);
        for b in &mut self.data[range] {
            *b ^= 0xFF;
        }
    }
}

impl NandDriver for MemNandDriver {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn stats(&self) -> NandStats {
        self.stats
    }

    fn read_chunk(
        &mut self,
        phys_chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult> {
        self.stats.reads += 1;
        if let Some(buf) = data {
            buf.copy_from_slice(&self.data[self.data_range(phys_chunk)]);
        }
        if let Some(buf) = spare {
            buf.copy_from_slice(&self.spare[self.spare_range(phys_chunk)]);
        }
        Ok(EccResult::None)
    }

    fn write_chunk(&mut self, phys_chunk: usize, data: &[u8], spare: &[u8]) -> Result<()> {
        if self.programmed[phys_chunk] {
            bail!(
                "chunk {} programmed twice without an intervening erase",
                phys_chunk
            );
        }
        let dr = self.data_range(phys_chunk);
        let sr = self.spare_range(phys_chunk);
        self.data[dr].copy_from_slice(data);
        self.spare[sr].copy_from_slice(spare);
        self.programmed[phys_chunk] = true;
        self.stats.writes += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: usize) -> Result<()> {
        let cpb = self.geometry.chunks_per_block;
        for c in block * cpb..(block + 1) * cpb {
            let dr = self.data_range(c);
            let sr = self.spare_range(c);
            self.data[dr].fill(0xFF);
            self.spare[sr].fill(0xFF);
            self.programmed[c] = false;
        }
        self.stats.erases += 1;
        Ok(())
    }

    fn mark_bad(&mut self, block: usize) -> Result<()> {
        self.bad_blocks[block] = true;
        Ok(())
    }

    fn check_bad(&mut self, block: usize) -> Result<bool> {
        Ok(self.bad_blocks[block])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> NandGeometry {
        NandGeometry {
            total_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 16,
            chunks_per_block: 4,
            n_blocks: 4,
        }
    }

    #[test]
    fn write_then_read_round_trips() -> Result<()> {
        let mut drv = MemNandDriver::new(geom());
        let data = vec![0xABu8; 512];
        let spare = vec![0x01u8; 16];
        drv.write_chunk(0, &data, &spare)?;
        let mut rdata = vec![0u8; 512];
        let mut rspare = vec![0u8; 16];
        drv.read_chunk(0, Some(&mut rdata), Some(&mut rspare))?;
        assert_eq!(rdata, data);
        assert_eq!(rspare, spare);
        Ok(())
    }

    #[test]
    fn double_program_without_erase_fails() -> Result<()> {
        let mut drv = MemNandDriver::new(geom());
        let data = vec![0u8; 512];
        let spare = vec![0u8; 16];
        drv.write_chunk(0, &data, &spare)?;
        assert!(drv.write_chunk(0, &data, &spare).is_err());
        Ok(())
    }

    #[test]
    fn erase_resets_programmed_state() -> Result<()> {
        let mut drv = MemNandDriver::new(geom());
        let data = vec![0u8; 512];
        let spare = vec![0u8; 16];
        drv.write_chunk(0, &data, &spare)?;
        drv.erase_block(0)?;
        drv.write_chunk(0, &data, &spare)?;
        Ok(())
    }
}
