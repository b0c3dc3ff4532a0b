//! Fault-injecting wrapper driver, used by crash/power-loss scenarios.
//! Delegates every call to an inner driver, injecting failures at
//! chosen operation counts instead of caching them.

use crate::{EccResult, NandDriver, NandGeometry, NandStats};
use anyhow::{bail, Result};
use log::warn;

/// A single injected fault, consumed the first time its trigger
/// condition is met.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Power loss during the write of the `n`th chunk issued to this
    /// driver (1-indexed). The spare is programmed but the data region
    /// is left half-written, simulating a page torn by power loss
    /// mid-program.
    PowerCutOnWrite { n: u64 },
    /// The `n`th erase silently fails to clear the block (simulates a
    /// controller that reported success without completing internal
    /// erase verify).
    SilentEraseFailure { n: u64 },
    /// Every chunk read in block `block` reports ECC as unfixable from
    /// this point on.
    PermanentEccFailure { block: usize },
}

/// Wraps any [`NandDriver`] and fires [`Fault`]s deterministically on
/// operation count, so a scenario can reproduce the exact point of
/// failure run after run.
pub struct FaultInjectingNandDriver<T: NandDriver> {
    inner: T,
    faults: Vec<Fault>,
    write_count: u64,
    erase_count: u64,
    tripped: bool,
}

impl<T: NandDriver> FaultInjectingNandDriver<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            faults: Vec::new(),
            write_count: 0,
            erase_count: 0,
            tripped: false,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// True once any fault has fired. A scenario remounting after an
    /// injected crash checks this to confirm the crash actually
    /// happened before asserting on recovery.
    pub fn tripped(&self) -> bool {
        self.tripped
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn permanent_ecc_failure_block(&self, phys_chunk: usize) -> bool {
        let cpb = self.inner.geometry().chunks_per_block;
        self.faults.iter().any(|f| match f {
            Fault::PermanentEccFailure { block } => phys_chunk / cpb == *block,
            _ => false,
        })
    }
}

impl<T: NandDriver> NandDriver for FaultInjectingNandDriver<T> {
    fn geometry(&self) -> NandGeometry {
        self.inner.geometry()
    }

    fn stats(&self) -> NandStats {
        self.inner.stats()
    }

    fn read_chunk(
        &mut self,
        phys_chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult> {
        if self.permanent_ecc_failure_block(phys_chunk) {
            self.tripped = true;
            let _ = self.inner.read_chunk(phys_chunk, data, spare)?;
            return Ok(EccResult::Unfixed);
        }
        self.inner.read_chunk(phys_chunk, data, spare)
    }

    fn write_chunk(&mut self, phys_chunk: usize, data: &[u8], spare: &[u8]) -> Result<()> {
        self.write_count += 1;
        for fault in self.faults.clone() {
            if let Fault::PowerCutOnWrite { n } = fault {
                if n == self.write_count {
                    self.tripped = true;
                    warn!("injected power cut on write of chunk {}", phys_chunk);
                    // The spare (tags) lands intact but only the first
                    // half of the data region gets programmed, as if
                    // power died mid-page.
                    let half = data.len() / 2;
                    self.inner.write_chunk(phys_chunk, &data[..half], spare)?;
                    bail!("simulated power cut during write of chunk {}", phys_chunk);
                }
            }
        }
        self.inner.write_chunk(phys_chunk, data, spare)
    }

    fn erase_block(&mut self, block: usize) -> Result<()> {
        self.erase_count += 1;
        for fault in self.faults.clone() {
            if let Fault::SilentEraseFailure { n } = fault {
                if n == self.erase_count {
                    self.tripped = true;
                    warn!("injected silent erase failure on block {}", block);
                    return Ok(());
                }
            }
        }
        self.inner.erase_block(block)
    }

    fn mark_bad(&mut self, block: usize) -> Result<()> {
        self.inner.mark_bad(block)
    }

    fn check_bad(&mut self, block: usize) -> Result<bool> {
        self.inner.check_bad(block)
    }

    fn initialise(&mut self) -> Result<()> {
        self.inner.initialise()
    }

    fn deinitialise(&mut self) -> Result<()> {
        self.inner.deinitialise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemNandDriver;

    fn geom() -> NandGeometry {
        NandGeometry {
            total_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 16,
            chunks_per_block: 4,
            n_blocks: 4,
        }
    }

    #[test]
    fn power_cut_fires_once_on_nth_write() {
        let mut drv = FaultInjectingNandDriver::new(MemNandDriver::new(geom()))
            .with_fault(Fault::PowerCutOnWrite { n: 2 });
        let data = vec![0xAAu8; 512];
        let spare = vec![0x00u8; 16];
        assert!(drv.write_chunk(0, &data, &spare).is_ok());
        assert!(!drv.tripped());
        assert!(drv.write_chunk(1, &data, &spare).is_err());
        assert!(drv.tripped());
    }

    #[test]
    fn silent_erase_failure_leaves_block_untouched() -> Result<()> {
        let mut drv = FaultInjectingNandDriver::new(MemNandDriver::new(geom()))
            .with_fault(Fault::SilentEraseFailure { n: 1 });
        let data = vec![0x11u8; 512];
        let spare = vec![0x00u8; 16];
        drv.inner.write_chunk(0, &data, &spare)?;
        drv.erase_block(0)?;
        assert!(drv.tripped());
        let mut rdata = vec![0u8; 512];
        drv.inner.read_chunk(0, Some(&mut rdata), None)?;
        assert_eq!(rdata, data, "erase should have been swallowed");
        Ok(())
    }
}
