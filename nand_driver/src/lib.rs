//! NAND driver interface.
//!
//! A capability set over raw physical pages ("chunks") and physical
//! erase blocks, addressed relative to a device's `chunk_offset` /
//! `block_offset`. The engine never touches storage directly; it
//! always goes through this trait.

use anyhow::Result;

pub mod fault;
pub mod file;
pub mod memory;

/// Outcome of an ECC-checked read: a clean read, one the controller
/// corrected, or one it could not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccResult {
    None,
    Fixed,
    Unfixed,
}

/// Static geometry a driver reports about the medium it backs.
#[derive(Debug, Clone, Copy)]
pub struct NandGeometry {
    pub total_bytes_per_chunk: usize,
    pub spare_bytes_per_chunk: usize,
    pub chunks_per_block: usize,
    pub n_blocks: usize,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct NandStats {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
}

/// Capability set from the design, expressed as a trait so the
/// engine is generic over simulated and (eventually) real backing
/// stores. v2 callers additionally rely on `mark_bad`/`check_bad`.
pub trait NandDriver {
    fn geometry(&self) -> NandGeometry;

    fn stats(&self) -> NandStats {
        NandStats::default()
    }

    /// Read one physical chunk. `data` and `spare` are independently
    /// optional so a caller that only needs tags can skip the data
    /// copy.
    fn read_chunk(
        &mut self,
        phys_chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult>;

    /// Program one physical chunk. A chunk may be programmed exactly
    /// once between erasures; the driver is not required to detect a
    /// second program of the same chunk (the allocator is the
    /// invariant holder upstream), but simulated drivers do.
    fn write_chunk(&mut self, phys_chunk: usize, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Erase one physical block, returning every chunk in it to the
    /// erased (all-0xFF) state.
    fn erase_block(&mut self, block: usize) -> Result<()>;

    /// Mark a block permanently bad. Required for v2 drivers.
    fn mark_bad(&mut self, _block: usize) -> Result<()> {
        Ok(())
    }

    /// Query whether a block was previously marked bad. Required for
    /// v2 drivers.
    fn check_bad(&mut self, _block: usize) -> Result<bool> {
        Ok(false)
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn deinitialise(&mut self) -> Result<()> {
        Ok(())
    }
}
