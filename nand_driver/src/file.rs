//! File-backed NAND simulator: one flat file holds the data region of
//! every chunk, a second holds the spare region, each addressed by
//! seek over a host file standing in for the device. Data and spare
//! are kept as separate extents rather than a single interleaved
//! stream, since tag marshalling needs to address them independently.

use crate::{EccResult, NandDriver, NandGeometry, NandStats};
use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct FileNandDriver {
    geometry: NandGeometry,
    data_file: File,
    spare_file: File,
    bad_blocks: Vec<bool>,
    stats: NandStats,
}

impl FileNandDriver {
    pub fn create(data_path: &Path, spare_path: &Path, geometry: NandGeometry) -> Result<Self> {
        let data_len =
            (geometry.n_blocks * geometry.chunks_per_block * geometry.total_bytes_per_chunk) as u64;
        let spare_len =
            (geometry.n_blocks * geometry.chunks_per_block * geometry.spare_bytes_per_chunk) as u64;
        let data_file = open_sized(data_path, data_len)?;
        let spare_file = open_sized(spare_path, spare_len)?;
        let mut drv = Self {
            geometry,
            data_file,
            spare_file,
            bad_blocks: vec![false; geometry.n_blocks],
            stats: NandStats::default(),
        };
        drv.fill(0xFF)?;
        Ok(drv)
    }

    fn fill(&mut self, byte: u8) -> Result<()> {
        let data_len = self.data_file.metadata()?.len();
        let spare_len = self.spare_file.metadata()?.len();
        self.data_file.seek(SeekFrom::Start(0))?;
        self.data_file.write_all(&vec![byte; data_len as usize])?;
        self.spare_file.seek(SeekFrom::Start(0))?;
        self.spare_file.write_all(&vec![byte; spare_len as usize])?;
        Ok(())
    }
}

fn open_sized(path: &Path, len: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    Ok(file)
}

impl NandDriver for FileNandDriver {
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
            let off = (phys_chunk * self.geometry.total_bytes_per_chunk) as u64;
            self.data_file.seek(SeekFrom::Start(off))?;
            self.data_file.read_exact(buf)?;
        }
        if let Some(buf) = spare {
            let off = (phys_chunk * self.geometry.spare_bytes_per_chunk) as u64;
            self.spare_file.seek(SeekFrom::Start(off))?;
            self.spare_file.read_exact(buf)?;
        }
        Ok(EccResult::None)
    }

    fn write_chunk(&mut self, phys_chunk: usize, data: &[u8], spare: &[u8]) -> Result<()> {
        let off = (phys_chunk * self.geometry.total_bytes_per_chunk) as u64;
        self.data_file.seek(SeekFrom::Start(off))?;
        self.data_file.write_all(data)?;
        let off = (phys_chunk * self.geometry.spare_bytes_per_chunk) as u64;
        self.spare_file.seek(SeekFrom::Start(off))?;
        self.spare_file.write_all(spare)?;
        self.stats.writes += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: usize) -> Result<()> {
        let cpb = self.geometry.chunks_per_block;
        let data_off = (block * cpb * self.geometry.total_bytes_per_chunk) as u64;
        let data_len = cpb * self.geometry.total_bytes_per_chunk;
        self.data_file.seek(SeekFrom::Start(data_off))?;
        self.data_file.write_all(&vec![0xFFu8; data_len])?;
        let spare_off = (block * cpb * self.geometry.spare_bytes_per_chunk) as u64;
        let spare_len = cpb * self.geometry.spare_bytes_per_chunk;
        self.spare_file.seek(SeekFrom::Start(spare_off))?;
        self.spare_file.write_all(&vec![0xFFu8; spare_len])?;
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
    use std::env::temp_dir;

    fn geom() -> NandGeometry {
        NandGeometry {
            total_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 16,
            chunks_per_block: 4,
            n_blocks: 4,
        }
    }

    fn scratch_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let base = temp_dir().join(format!("yaffs_core_test_{}_{}", tag, std::process::id()));
        (base.with_extension("data"), base.with_extension("spare"))
    }

    #[test]
    fn round_trips_through_file() -> Result<()> {
        let (data_path, spare_path) = scratch_paths("round_trip");
        let mut drv = FileNandDriver::create(&data_path, &spare_path, geom())?;
        let data = vec![0x42u8; 512];
        let spare = vec![0x07u8; 16];
        drv.write_chunk(2, &data, &spare)?;
        let mut rdata = vec![0u8; 512];
        drv.read_chunk(2, Some(&mut rdata), None)?;
        assert_eq!(rdata, data);
        let _ = std::fs::remove_file(&data_path);
        let _ = std::fs::remove_file(&spare_path);
        Ok(())
    }
}
