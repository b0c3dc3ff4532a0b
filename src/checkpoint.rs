//! Checkpointing: serializes enough RAM state to
//! remount in O(objects) instead of O(chunks), into a fixed range of
//! blocks carved out of the ordinary allocation pool at mount time and
//! marked [`BlockState::Checkpoint`] so the allocator and scan both
//! leave them alone.

use crate::block::BlockState;
use crate::device::Device;
use crate::error::{YaffsError, YaffsResult};
use crate::geometry::Geometry;
use crate::header::ObjectHeader;
use crate::object::{
    DirectoryState, FileState, HardlinkState, Object, ObjectFlags, ObjectType, SymlinkState,
    VariantState,
};
use crate::tags::ChunkTag;
use log::info;
use nand_driver::NandDriver;
use std::collections::HashMap;

const MAGIC: u32 = 0x5946_4332; // "YFC2"
const VERSION: u16 = 1;
const MIN_CHECKPOINT_BLOCKS: usize = 2;

/// How many blocks to reserve for checkpoint data, sized off
/// `max_objects` so a fuller device gets more room without the caller
/// having to guess.
pub fn reserve_block_count(max_objects: usize, geometry: &Geometry) -> usize {
    let per_object_bytes = 128usize;
    let bytes_needed = 64 + max_objects * per_object_bytes;
    let chunk_bytes = geometry.data_bytes_per_chunk().max(1);
    let block_bytes = (chunk_bytes * geometry.chunks_per_block).max(1);
    let blocks = (bytes_needed + block_bytes - 1) / block_bytes;
    blocks.max(MIN_CHECKPOINT_BLOCKS).min(geometry.n_blocks / 4)
}

struct ByteWriter(Vec<u8>);

impl ByteWriter {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.0.extend_from_slice(b);
    }
    fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn u8(&mut self) -> YaffsResult<u8> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| YaffsError::BadGeometry { reason: "truncated checkpoint".into() })?;
        self.pos += 1;
        Ok(v)
    }
    fn take(&mut self, n: usize) -> YaffsResult<&'a [u8]> {
        let s = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| YaffsError::BadGeometry { reason: "truncated checkpoint".into() })?;
        self.pos += n;
        Ok(s)
    }
    fn u32(&mut self) -> YaffsResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> YaffsResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> YaffsResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn bytes(&mut self) -> YaffsResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn string(&mut self) -> YaffsResult<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).to_string())
    }
}

fn serialize<T: NandDriver>(dev: &Device<T>) -> Vec<u8> {
    let mut w = ByteWriter(Vec::new());
    w.u32(MAGIC);
    w.0.extend_from_slice(&VERSION.to_le_bytes());
    w.u32(dev.allocator.seq_number);
    w.u64(dev.allocator.n_free_chunks as u64);
    w.u64(dev.allocator.n_erased_blocks as u64);
    w.u64(dev.geometry.n_blocks as u64);

    let usable_blocks = dev.geometry.n_blocks - dev.checkpoint_blocks_required;
    w.u32(usable_blocks as u32);
    for block in 0..usable_blocks {
        let info = dev.blocks.get(block);
        w.u8(match info.state {
            BlockState::Empty => 0,
            BlockState::Allocating => 1,
            BlockState::Full => 2,
            BlockState::Collecting => 3,
            BlockState::Dirty => 4,
            BlockState::NeedsScan => 5,
            BlockState::Dead => 6,
            BlockState::Checkpoint => 7,
        });
        w.u32(info.seq_number);
        w.u32(info.pages_in_use as u32);
        w.u32(info.soft_del_pages as u32);
        w.u8(info.has_shrink_hdr as u8);
        w.u8(info.needs_retiring as u8);
    }

    let objects: Vec<&Object> = dev.objects.iter().map(|(_, o)| o).collect();
    w.u32(objects.len() as u32);
    for obj in objects {
        w.u32(obj.obj_id);
        w.u32(obj.parent);
        w.string(&obj.name);
        w.u32(obj.mode);
        w.u32(obj.uid);
        w.u32(obj.gid);
        w.i64(obj.atime);
        w.i64(obj.mtime);
        w.i64(obj.ctime);
        w.u32(obj.hdr_chunk as u32);
        w.u8(obj.serial);
        let mut flags = 0u8;
        flags |= (obj.flags.deleted as u8) << 0;
        flags |= (obj.flags.unlinked as u8) << 1;
        flags |= (obj.flags.soft_del as u8) << 2;
        flags |= (obj.flags.fake as u8) << 3;
        flags |= (obj.flags.is_shadowed as u8) << 4;
        flags |= (obj.flags.has_xattr as u8) << 5;
        w.u8(flags);
        w.u8(obj.obj_type().into());
        match &obj.variant {
            VariantState::File(f) => {
                w.u64(f.file_size);
                w.u64(f.stored_size);
                w.u32(f.n_data_chunks as u32);
                let entries = f.tnode.entries();
                w.u32(entries.len() as u32);
                for (logical, phys) in entries {
                    w.u64(logical);
                    w.u32(phys);
                }
            }
            VariantState::Directory(d) => {
                w.u32(d.children.len() as u32);
                for &c in &d.children {
                    w.u32(c);
                }
            }
            VariantState::Symlink(s) => w.string(&s.alias),
            VariantState::Hardlink(h) => w.u32(h.equiv_id),
            VariantState::Special => {}
        }
    }

    w.u32(dev.headers.len() as u32);
    for (obj_id, header) in dev.headers.iter() {
        w.u32(*obj_id);
        w.bytes(&header.to_bytes());
    }

    let checksum = w.0.iter().fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));
    w.u32(checksum);

    let mut out = Vec::with_capacity(w.0.len() + 8);
    out.extend_from_slice(&(w.0.len() as u64).to_le_bytes());
    out.extend_from_slice(&w.0);
    out
}

fn deserialize<T: NandDriver>(dev: &mut Device<T>, blob: &[u8]) -> YaffsResult<bool> {
    let mut r = ByteReader::new(blob);
    if r.u32()? != MAGIC {
        return Ok(false);
    }
    let version = u16::from_le_bytes(r.take(2)?.try_into().unwrap());
    if version != VERSION {
        return Ok(false);
    }
    let checksum_at = blob.len() - 4;
    let expected = u32::from_le_bytes(blob[checksum_at..].try_into().unwrap());
    let actual = blob[..checksum_at]
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));
    if actual != expected {
        return Ok(false);
    }

    let seq_number = r.u32()?;
    let n_free_chunks = r.u64()? as usize;
    let n_erased_blocks = r.u64()? as usize;
    let saved_n_blocks = r.u64()? as usize;
    if saved_n_blocks != dev.geometry.n_blocks {
        return Ok(false);
    }

    let n_blocks = r.u32()? as usize;
    for block in 0..n_blocks {
        let state = match r.u8()? {
            0 => BlockState::Empty,
            1 => BlockState::Allocating,
            2 => BlockState::Full,
            3 => BlockState::Collecting,
            4 => BlockState::Dirty,
            5 => BlockState::NeedsScan,
            6 => BlockState::Dead,
            _ => BlockState::Checkpoint,
        };
        let seq = r.u32()?;
        let pages_in_use = r.u32()? as usize;
        let soft_del_pages = r.u32()? as usize;
        let has_shrink_hdr = r.u8()? != 0;
        let needs_retiring = r.u8()? != 0;
        let info = dev.blocks.get_mut(block);
        info.state = state;
        info.seq_number = seq;
        info.pages_in_use = pages_in_use;
        info.soft_del_pages = soft_del_pages;
        info.has_shrink_hdr = has_shrink_hdr;
        info.needs_retiring = needs_retiring;
    }

    let n_objects = r.u32()?;
    for _ in 0..n_objects {
        let obj_id = r.u32()?;
        let parent = r.u32()?;
        let name = r.string()?;
        let mode = r.u32()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let atime = r.i64()?;
        let mtime = r.i64()?;
        let ctime = r.i64()?;
        let hdr_chunk = r.u32()? as usize;
        let serial = r.u8()?;
        let flag_bits = r.u8()?;
        let obj_type = ObjectType::try_from(r.u8()?)
            .map_err(|_| YaffsError::BadGeometry { reason: "bad obj_type in checkpoint".into() })?;
        let variant = match obj_type {
            ObjectType::File => {
                let file_size = r.u64()?;
                let stored_size = r.u64()?;
                let n_data_chunks = r.u32()? as usize;
                let n_entries = r.u32()?;
                let mut tnode = crate::tnode::TnodeTree::new();
                for _ in 0..n_entries {
                    let logical = r.u64()?;
                    let phys = r.u32()?;
                    tnode.add_find(logical, Some(phys));
                    let (block, chunk_in_block) = (
                        phys as usize / dev.geometry.chunks_per_block,
                        phys as usize % dev.geometry.chunks_per_block,
                    );
                    dev.bitmap.set_chunk_bit(block, chunk_in_block);
                }
                VariantState::File(FileState {
                    file_size,
                    stored_size,
                    shrink_size: 0,
                    tnode,
                    n_data_chunks,
                })
            }
            ObjectType::Directory => {
                let n_children = r.u32()?;
                let mut children = Vec::with_capacity(n_children as usize);
                for _ in 0..n_children {
                    children.push(r.u32()?);
                }
                VariantState::Directory(DirectoryState { children, is_dirty_dir: false })
            }
            ObjectType::Symlink => VariantState::Symlink(SymlinkState { alias: r.string()? }),
            ObjectType::Hardlink => VariantState::Hardlink(HardlinkState { equiv_id: r.u32()? }),
            ObjectType::Special => VariantState::Special,
        };
        dev.objects.insert(Object {
            obj_id,
            parent,
            name,
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            hdr_chunk,
            serial,
            flags: ObjectFlags {
                deleted: flag_bits & 1 != 0,
                unlinked: flag_bits & 2 != 0,
                soft_del: flag_bits & 4 != 0,
                fake: flag_bits & 8 != 0,
                is_shadowed: flag_bits & 16 != 0,
                has_xattr: flag_bits & 32 != 0,
                dirty: false,
                lazy_loaded: false,
            },
            variant,
        });
        if hdr_chunk != 0 {
            let (block, chunk_in_block) = (
                hdr_chunk / dev.geometry.chunks_per_block,
                hdr_chunk % dev.geometry.chunks_per_block,
            );
            dev.bitmap.set_chunk_bit(block, chunk_in_block);
        }
    }

    let n_headers = r.u32()?;
    let mut headers = HashMap::new();
    for _ in 0..n_headers {
        let obj_id = r.u32()?;
        let bytes = r.bytes()?;
        if let Some(header) = ObjectHeader::from_bytes(&bytes) {
            headers.insert(obj_id, header);
        }
    }
    dev.headers = headers;

    dev.allocator.restore(seq_number, n_free_chunks, n_erased_blocks);
    Ok(true)
}

fn checkpoint_chunk_tag(seq: u32, n_bytes: u32) -> ChunkTag {
    ChunkTag {
        obj_id: 0,
        chunk_id: seq,
        n_bytes,
        serial: 0,
        seq_number: 0,
        extra: Default::default(),
    }
}

/// Writes a fresh checkpoint, erasing the reserved blocks first. A
/// no-op when the in-memory state already matches the last write
/// (`checkpoint_valid`).
pub fn write_checkpoint<T: NandDriver>(dev: &mut Device<T>) -> YaffsResult<()> {
    if dev.read_only {
        return Err(YaffsError::ReadOnly);
    }
    if dev.checkpoint_valid {
        return Ok(());
    }
    let blob = serialize(dev);
    let chunk_size = dev.geometry.data_bytes_per_chunk();
    let ckpt_start = dev.geometry.n_blocks - dev.checkpoint_blocks_required;
    let capacity = dev.checkpoint_blocks_required * dev.geometry.chunks_per_block * chunk_size;
    if blob.len() > capacity {
        return Err(YaffsError::BadGeometry {
            reason: format!(
                "checkpoint payload {} exceeds reserved capacity {}",
                blob.len(),
                capacity
            ),
        });
    }

    for block in ckpt_start..dev.geometry.n_blocks {
        dev.driver.erase_block(block).map_err(YaffsError::from)?;
    }

    let mut seq = 0u32;
    for (i, chunk_data) in blob.chunks(chunk_size).enumerate() {
        let phys_chunk = ckpt_start * dev.geometry.chunks_per_block + i;
        let mut padded = vec![0u8; chunk_size];
        padded[..chunk_data.len()].copy_from_slice(chunk_data);
        let tag = checkpoint_chunk_tag(seq, chunk_data.len() as u32);
        let mut spare = vec![0u8; dev.driver.geometry().spare_bytes_per_chunk];
        dev.marshaller.write_chunk_tags(&tag, &mut spare);
        dev.driver
            .write_chunk(phys_chunk, &padded, &spare)
            .map_err(|e| YaffsError::Driver(e))?;
        seq += 1;
    }
    dev.checkpoint_valid = true;
    info!("wrote checkpoint ({} bytes, {} chunks)", blob.len(), seq);
    Ok(())
}

/// Attempts to restore device state from a checkpoint. Returns
/// `Ok(false)` (not `Err`) on anything that looks like "no valid
/// checkpoint present" so callers fall back to a full scan.
pub fn try_restore<T: NandDriver>(dev: &mut Device<T>) -> YaffsResult<bool> {
    let chunk_size = dev.geometry.data_bytes_per_chunk();
    let ckpt_start = dev.geometry.n_blocks - dev.checkpoint_blocks_required;
    let first_chunk = ckpt_start * dev.geometry.chunks_per_block;

    let mut header_buf = vec![0u8; chunk_size];
    let first_tag = match dev.read_chunk(first_chunk, Some(&mut header_buf)) {
        Ok(Some(t)) => t,
        _ => return Ok(false),
    };
    if first_tag.obj_id != 0 {
        return Ok(false);
    }

    let total_len = u64::from_le_bytes(header_buf[..8].try_into().unwrap()) as usize;
    let max_chunks = dev.checkpoint_blocks_required * dev.geometry.chunks_per_block;
    let mut blob = Vec::with_capacity(total_len);
    blob.extend_from_slice(&header_buf[8..first_tag.n_bytes as usize]);

    let mut i = 1;
    while blob.len() < total_len {
        if i >= max_chunks {
            return Ok(false);
        }
        let phys_chunk = first_chunk + i;
        let mut buf = vec![0u8; chunk_size];
        let tag = match dev.read_chunk(phys_chunk, Some(&mut buf)) {
            Ok(Some(t)) => t,
            _ => return Ok(false),
        };
        blob.extend_from_slice(&buf[..tag.n_bytes as usize]);
        i += 1;
    }
    if blob.len() != total_len {
        return Ok(false);
    }

    match deserialize(dev, &blob) {
        Ok(true) => {
            dev.checkpoint_valid = true;
            Ok(true)
        }
        _ => Ok(false),
    }
}

impl<T: NandDriver> Device<T> {
    /// `sync()`: flush every dirty cache line then write a fresh
    /// checkpoint.
    pub fn sync(&mut self) -> YaffsResult<()> {
        for (idx, _, _) in self.cache.occupied() {
            if self.cache.line(idx).dirty {
                self.writeback_cache_line(idx)?;
            }
        }
        self.flush_dirty_dirs()?;
        if !self.geometry.skip_checkpt_wr {
            write_checkpoint(self)?;
        }
        Ok(())
    }

    /// `unmount()`: sync, then drop the device's registry entry if any.
    pub fn unmount(mut self) -> YaffsResult<()> {
        self.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DeviceConfig;
    use nand_driver::memory::MemNandDriver;
    use nand_driver::NandGeometry;

    fn small_config() -> DeviceConfig {
        let mut cfg = DeviceConfig::default();
        cfg.total_bytes_per_chunk = 1024;
        cfg.chunks_per_block = 8;
        cfg.start_block = 0;
        cfg.end_block = 19;
        cfg.n_reserved_blocks = 2;
        cfg.max_objects = 64;
        cfg
    }

    #[test]
    fn checkpoint_round_trips_object_graph() {
        let cfg = small_config();
        let driver = MemNandDriver::new(NandGeometry {
            total_bytes_per_chunk: cfg.total_bytes_per_chunk,
            spare_bytes_per_chunk: 64,
            chunks_per_block: cfg.chunks_per_block,
            n_blocks: cfg.end_block - cfg.start_block + 1,
        });
        let mut dev = crate::scan::mount(driver, &cfg).unwrap();
        let file_id = dev.create_file(crate::object::ROOT_OBJ_ID, "a.txt", 0o100644).unwrap();
        dev.wr_file(file_id, 0, b"hello checkpoint", true).unwrap();
        dev.sync().unwrap();
        let driver = dev.driver;

        let mut dev2 = Device::new(driver, &cfg).unwrap();
        let restored = try_restore(&mut dev2).unwrap();
        assert!(restored);
        assert!(dev2.objects.contains(file_id));
        let mut buf = vec![0u8; 17];
        let n = dev2.file_rd(file_id, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello checkpoint");
    }
}
