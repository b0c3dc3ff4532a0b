//! Mount scan and power-loss recovery. `format`
//! erases every block; `mount` runs low-level init then either
//! restores from a checkpoint or scans. v2 scans blocks in descending
//! `seq_number` order so the first `(obj_id, chunk_id)` pair seen is,
//! by construction, the most recent live copy.

use crate::block::BlockState;
use crate::device::Device;
use crate::error::YaffsResult;
use crate::geometry::DeviceConfig;
use crate::header::ObjectHeader;
use crate::object::{FileState, Object, ObjectFlags, ObjectType, VariantState, ROOT_OBJ_ID, UNLINKED_OBJ_ID};
use log::{info, warn};
use nand_driver::NandDriver;

const HANG_FIXUP_MAX_HOPS: usize = 100;

impl<T: NandDriver> Device<T> {
    /// Erases every block in range and resets RAM state to empty.
    pub fn format(&mut self) -> YaffsResult<()> {
        let ckpt_start = self.geometry.n_blocks - self.checkpoint_blocks_required;
        for block in 0..self.geometry.n_blocks {
            self.driver.erase_block(block).map_err(crate::error::YaffsError::from)?;
            self.bitmap.clear_all_chunk_bits(block);
            *self.blocks.get_mut(block) = crate::block::BlockInfo::default();
            if block >= ckpt_start {
                self.blocks.get_mut(block).state = BlockState::Checkpoint;
            }
        }
        self.allocator.restore(
            0,
            ckpt_start * self.geometry.chunks_per_block,
            ckpt_start,
        );
        self.checkpoint_valid = false;
        info!("formatted {} blocks", self.geometry.n_blocks);
        Ok(())
    }

    /// Full mount sequence: low-level init already done by
    /// `Device::new`; this runs the scan (checkpoint restore is not
    /// attempted here — see `crate::checkpoint` — callers try that
    /// first and fall back to this).
    pub fn scan_mount(&mut self) -> YaffsResult<()> {
        if self.geometry.is_yaffs2 {
            self.scan_v2()
        } else {
            self.scan_v1()
        }
    }

    fn block_seq_sample(&mut self, block: usize) -> (u32, bool) {
        let first_chunk = block * self.geometry.chunks_per_block;
        match self.read_chunk(first_chunk, None) {
            Ok(Some(tag)) => (tag.seq_number, true),
            _ => (0, false),
        }
    }

    fn scan_v1(&mut self) -> YaffsResult<()> {
        let mut n_erased = 0usize;
        let mut n_free = 0usize;
        for block in 0..self.geometry.n_blocks {
            if self.blocks.get(block).state == BlockState::Checkpoint {
                continue;
            }
            let mut any_live = false;
            for chunk_in_block in 0..self.geometry.chunks_per_block {
                let phys_chunk = block * self.geometry.chunks_per_block + chunk_in_block;
                let mut data = vec![0u8; self.geometry.data_bytes_per_chunk()];
                let tag = match self.read_chunk(phys_chunk, Some(&mut data)) {
                    Ok(Some(t)) => t,
                    _ => {
                        n_free += 1;
                        continue;
                    }
                };
                any_live = true;
                self.bitmap.set_chunk_bit(block, chunk_in_block);
                self.blocks.get_mut(block).pages_in_use += 1;
                self.apply_scanned_chunk(tag, &data, phys_chunk)?;
            }
            if any_live {
                self.blocks.get_mut(block).state = BlockState::Full;
            } else {
                self.blocks.get_mut(block).state = BlockState::Empty;
                n_erased += 1;
            }
        }
        self.allocator.restore(0, n_free, n_erased);
        self.post_scan_fixup()
    }

    fn scan_v2(&mut self) -> YaffsResult<()> {
        let candidate_blocks: Vec<usize> = (0..self.geometry.n_blocks)
            .filter(|&b| self.blocks.get(b).state != BlockState::Checkpoint)
            .collect();
        let mut samples: Vec<(usize, u32, bool)> = candidate_blocks
            .into_iter()
            .map(|b| {
                let (seq, has_data) = self.block_seq_sample(b);
                (b, seq, has_data)
            })
            .collect();
        samples.sort_by(|a, b| b.1.cmp(&a.1));

        let mut max_seq = 0u32;
        let mut n_erased = 0usize;
        let mut bound: std::collections::HashSet<(u32, u32)> = std::collections::HashSet::new();

        for (block, seq, has_data) in samples {
            if !has_data {
                self.blocks.get_mut(block).state = BlockState::Empty;
                n_erased += 1;
                continue;
            }
            max_seq = max_seq.max(seq);
            self.blocks.get_mut(block).seq_number = seq;
            let mut any_live = false;
            for chunk_in_block in 0..self.geometry.chunks_per_block {
                let phys_chunk = block * self.geometry.chunks_per_block + chunk_in_block;
                let mut data = vec![0u8; self.geometry.data_bytes_per_chunk()];
                let tag = match self.read_chunk(phys_chunk, Some(&mut data)) {
                    Ok(Some(t)) => t,
                    _ => continue,
                };
                if bound.contains(&(tag.obj_id, tag.chunk_id)) {
                    continue;
                }
                bound.insert((tag.obj_id, tag.chunk_id));
                any_live = true;
                self.bitmap.set_chunk_bit(block, chunk_in_block);
                self.blocks.get_mut(block).pages_in_use += 1;
                self.apply_scanned_chunk(tag, &data, phys_chunk)?;
            }
            self.blocks.get_mut(block).state = if any_live {
                BlockState::Full
            } else {
                BlockState::Dirty
            };
        }

        let usable_blocks = self.geometry.n_blocks - self.checkpoint_blocks_required;
        let total_chunks = usable_blocks * self.geometry.chunks_per_block;
        let used_chunks: usize = (0..self.geometry.n_blocks)
            .map(|b| self.blocks.get(b).pages_in_use)
            .sum();
        self.allocator
            .restore(max_seq, total_chunks - used_chunks, n_erased);
        self.post_scan_fixup()
    }

    fn apply_scanned_chunk(
        &mut self,
        tag: crate::tags::ChunkTag,
        data: &[u8],
        phys_chunk: usize,
    ) -> YaffsResult<()> {
        if tag.is_header() {
            if !self.objects.contains(tag.obj_id) {
                let obj_type = ObjectType::try_from(tag.extra.obj_type)
                    .unwrap_or(ObjectType::File);
                let variant = match obj_type {
                    ObjectType::Directory => {
                        VariantState::Directory(crate::object::DirectoryState::default())
                    }
                    ObjectType::Symlink => {
                        VariantState::Symlink(crate::object::SymlinkState::default())
                    }
                    ObjectType::Hardlink => VariantState::Hardlink(crate::object::HardlinkState {
                        equiv_id: tag.extra.equiv_id,
                    }),
                    ObjectType::Special => VariantState::Special,
                    ObjectType::File => VariantState::File(FileState {
                        file_size: tag.extra.file_size,
                        stored_size: tag.extra.file_size,
                        ..Default::default()
                    }),
                };
                self.objects.insert(Object {
                    obj_id: tag.obj_id,
                    parent: tag.extra.parent_id,
                    name: String::new(),
                    mode: 0,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    hdr_chunk: phys_chunk,
                    serial: tag.serial,
                    flags: ObjectFlags {
                        lazy_loaded: true,
                        ..Default::default()
                    },
                    variant,
                });
            }
            if let Some(header) = ObjectHeader::from_bytes(data) {
                if let Some(obj) = self.objects.get_mut(tag.obj_id) {
                    obj.name = header.name.clone();
                    obj.parent = header.parent_obj_id;
                    obj.mode = header.mode;
                    obj.uid = header.uid;
                    obj.gid = header.gid;
                    obj.atime = header.atime;
                    obj.mtime = header.mtime;
                    obj.ctime = header.ctime;
                    obj.hdr_chunk = phys_chunk;
                    obj.flags.lazy_loaded = false;
                    if let VariantState::Symlink(s) = &mut obj.variant {
                        s.alias = header.alias.clone();
                    }
                    if let VariantState::File(f) = &mut obj.variant {
                        f.file_size = header.file_size;
                        f.stored_size = header.file_size;
                    }
                }
                self.headers.insert(tag.obj_id, header);
            }
        } else {
            if !self.objects.contains(tag.obj_id) {
                self.objects.insert(Object {
                    obj_id: tag.obj_id,
                    parent: UNLINKED_OBJ_ID,
                    name: String::new(),
                    mode: 0,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    hdr_chunk: 0,
                    serial: 0,
                    flags: ObjectFlags {
                        lazy_loaded: true,
                        ..Default::default()
                    },
                    variant: VariantState::File(FileState::default()),
                });
            }
            if let Some(file) = self.objects.get_mut(tag.obj_id).and_then(|o| o.as_file_mut()) {
                file.tnode.add_find(tag.chunk_id as u64, Some(phys_chunk as u32));
                file.n_data_chunks += 1;
            }
        }
        Ok(())
    }

    /// Hang fix-up + strip: any object whose parent chain
    /// doesn't terminate at a root directory within
    /// `HANG_FIXUP_MAX_HOPS` hops is relocated to lost+found.
    fn post_scan_fixup(&mut self) -> YaffsResult<()> {
        let ids: Vec<u32> = self.objects.iter().map(|(id, _)| *id).collect();
        for id in ids {
            if id <= crate::object::DELETED_OBJ_ID {
                continue;
            }
            let mut cur = id;
            let mut hops = 0;
            let mut rooted = false;
            loop {
                hops += 1;
                if hops > HANG_FIXUP_MAX_HOPS {
                    break;
                }
                match self.objects.get(cur) {
                    Some(o) if o.obj_id == ROOT_OBJ_ID || o.flags.fake => {
                        rooted = true;
                        break;
                    }
                    Some(o) => cur = o.parent,
                    None => break,
                }
            }
            if !rooted {
                warn!("relocating orphan object {} to lost+found", id);
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.parent = crate::object::LOST_N_FOUND_OBJ_ID;
                }
                if let Some(dir) = self
                    .objects
                    .get_mut(crate::object::LOST_N_FOUND_OBJ_ID)
                    .and_then(|o| o.as_dir_mut())
                {
                    dir.children.push(id);
                }
            } else if let Some(obj) = self.objects.get(id) {
                let parent = obj.parent;
                if self.objects.contains(parent) {
                    if let Some(dir) = self.objects.get_mut(parent).and_then(|o| o.as_dir_mut()) {
                        if !dir.children.contains(&id) {
                            dir.children.push(id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Full mount entry point: low-level init, then checkpoint restore if
/// valid (deferred to `crate::checkpoint::try_restore`), else scan.
pub fn mount<T: NandDriver>(driver: T, config: &DeviceConfig) -> YaffsResult<Device<T>> {
    let mut dev = Device::new(driver, config)?;
    if !config.skip_checkpt_rd && crate::checkpoint::try_restore(&mut dev)? {
        info!("mounted from checkpoint");
    } else {
        dev.scan_mount()?;
        info!("mounted via scan");
    }
    if config.empty_lost_n_found {
        dev.empty_lost_n_found()?;
    }
    Ok(dev)
}
