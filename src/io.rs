//! Data I/O path: file read/write with hole handling and size
//! accounting, plus resize. Kept in its own `impl<T: NandDriver>
//! Device<T>` block so the aggregate struct's definition in
//! `device.rs` isn't crowded by the read/write loop logic.

use crate::device::Device;
use crate::error::{YaffsError, YaffsResult};
use nand_driver::NandDriver;

impl<T: NandDriver> Device<T> {
    fn data_bytes_per_chunk(&self) -> usize {
        self.geometry.data_bytes_per_chunk()
    }

    /// `file_rd(obj, buf, offset, n)`. A missing tnode entry
    /// yields zeros: holes are semantically valid, not an error.
    pub fn file_rd(&mut self, obj_id: u32, offset: u64, buf: &mut [u8]) -> YaffsResult<usize> {
        let chunk_size = self.data_bytes_per_chunk() as u64;
        let mut done = 0usize;
        let n = buf.len();
        while done < n {
            let pos = offset + done as u64;
            let logical = pos / chunk_size + 1;
            let offset_in_chunk = (pos % chunk_size) as usize;
            let n_copy = (n - done).min(chunk_size as usize - offset_in_chunk);

            let phys = {
                let object = self
                    .objects
                    .get(obj_id)
                    .ok_or_else(|| YaffsError::NotFound(format!("object {}", obj_id)))?;
                object
                    .as_file()
                    .ok_or_else(|| YaffsError::InvalidArgument("not a file".into()))?
                    .tnode
                    .find(logical)
            };

            match phys {
                None => {
                    buf[done..done + n_copy].fill(0);
                }
                Some(phys_chunk) => {
                    if let Some(idx) = self.cache.find(obj_id, logical as u32) {
                        self.cache.touch(idx);
                        let line = self.cache.line(idx);
                        let avail = line.n_bytes.saturating_sub(offset_in_chunk);
                        let take = n_copy.min(avail);
                        buf[done..done + take]
                            .copy_from_slice(&line.data[offset_in_chunk..offset_in_chunk + take]);
                        if take < n_copy {
                            buf[done + take..done + n_copy].fill(0);
                        }
                    } else {
                        let mut chunk_buf = vec![0u8; chunk_size as usize];
                        self.read_chunk(phys_chunk as usize, Some(&mut chunk_buf))?;
                        buf[done..done + n_copy]
                            .copy_from_slice(&chunk_buf[offset_in_chunk..offset_in_chunk + n_copy]);
                    }
                }
            }
            done += n_copy;
        }
        Ok(done)
    }

    /// `wr_data_obj(obj, logical, buf, n, use_reserve)`:
    /// locate the prior physical chunk, allocate and write the new
    /// one, point the tnode at it, delete the prior.
    pub fn wr_data_obj_chunk(
        &mut self,
        obj_id: u32,
        logical: u64,
        buf: &[u8],
        use_reserve: bool,
    ) -> YaffsResult<()> {
        let prior = self
            .objects
            .get(obj_id)
            .and_then(|o| o.as_file())
            .and_then(|f| f.tnode.find(logical));

        let mut padded = vec![0u8; self.data_bytes_per_chunk()];
        padded[..buf.len()].copy_from_slice(buf);

        let serial = prior.map(|_| 1u8).unwrap_or(0).wrapping_add(1);
        let mut tag = crate::tags::ChunkTag {
            obj_id,
            chunk_id: logical as u32,
            n_bytes: buf.len() as u32,
            serial,
            seq_number: 0,
            extra: Default::default(),
        };
        let new_chunk = self.alloc_and_write_chunk(&mut tag, &padded, use_reserve)?;

        if let Some(file) = self
            .objects
            .get_mut(obj_id)
            .and_then(|o| o.as_file_mut())
        {
            file.tnode.add_find(logical, Some(new_chunk as u32));
            if prior.is_none() {
                file.n_data_chunks += 1;
            }
        }
        if let Some(prior_chunk) = prior {
            self.delete_chunk(prior_chunk as usize);
        }
        Ok(())
    }

    /// `do_file_wr(obj, buf, offset, n, write_through)`.
    pub fn do_file_wr(
        &mut self,
        obj_id: u32,
        offset: u64,
        buf: &[u8],
        write_through: bool,
    ) -> YaffsResult<usize> {
        let chunk_size = self.data_bytes_per_chunk() as u64;
        let mut done = 0usize;
        let n = buf.len();
        while done < n {
            let pos = offset + done as u64;
            let logical = pos / chunk_size + 1;
            let offset_in_chunk = (pos % chunk_size) as usize;
            let n_copy = (n - done).min(chunk_size as usize - offset_in_chunk);
            let full_chunk_write = offset_in_chunk == 0 && n_copy == chunk_size as usize;

            let cache_unusable = self.cache.capacity() == 0;
            if full_chunk_write
                && !self.geometry.inband_tags
                && (self.geometry.cache_bypass_aligned || cache_unusable)
            {
                self.cache.invalidate(obj_id, logical as u32);
                self.wr_data_obj_chunk(obj_id, logical, &buf[done..done + n_copy], true)?;
            } else {
                let prior_valid = {
                    let object = self.objects.get(obj_id).and_then(|o| o.as_file());
                    object
                        .and_then(|f| f.tnode.find(logical))
                        .map(|phys| self.prior_chunk_valid_bytes(phys as usize))
                        .transpose()?
                        .unwrap_or(0)
                };
                let n_writeback = if offset_in_chunk > 0 || n_copy < chunk_size as usize {
                    (n_copy + offset_in_chunk).max(prior_valid)
                } else {
                    n_copy
                };

                let idx = match self.cache.find(obj_id, logical as u32) {
                    Some(idx) => idx,
                    None => {
                        let idx = self.cache.grab().ok_or(YaffsError::OutOfSpace)?;
                        if self.cache.line(idx).dirty {
                            self.writeback_cache_line(idx)?;
                        }
                        self.cache.install(idx, obj_id, logical as u32);
                        self.load_chunk_into_cache(obj_id, logical, idx)?;
                        idx
                    }
                };
                self.cache.touch(idx);
                let line = self.cache.line_mut(idx);
                line.data[offset_in_chunk..offset_in_chunk + n_copy]
                    .copy_from_slice(&buf[done..done + n_copy]);
                line.n_bytes = line.n_bytes.max(n_writeback);
                line.dirty = true;
                if write_through {
                    self.writeback_cache_line(idx)?;
                }
            }
            done += n_copy;
        }

        if let Some(file) = self
            .objects
            .get_mut(obj_id)
            .and_then(|o| o.as_file_mut())
        {
            let end = offset + done as u64;
            if end > file.file_size {
                file.file_size = end;
            }
            if end > file.stored_size {
                file.stored_size = end;
            }
        }
        Ok(done)
    }

    fn prior_chunk_valid_bytes(&mut self, phys_chunk: usize) -> YaffsResult<usize> {
        let mut buf = vec![0u8; self.data_bytes_per_chunk()];
        let tag = self.read_chunk(phys_chunk, Some(&mut buf))?;
        Ok(tag.map(|t| t.n_bytes as usize).unwrap_or(0))
    }

    fn load_chunk_into_cache(&mut self, obj_id: u32, logical: u64, idx: usize) -> YaffsResult<()> {
        let phys = self
            .objects
            .get(obj_id)
            .and_then(|o| o.as_file())
            .and_then(|f| f.tnode.find(logical));
        if let Some(phys_chunk) = phys {
            let mut buf = vec![0u8; self.data_bytes_per_chunk()];
            let tag = self.read_chunk(phys_chunk as usize, Some(&mut buf))?;
            let line = self.cache.line_mut(idx);
            let n = tag.map(|t| t.n_bytes as usize).unwrap_or(0);
            line.data[..n].copy_from_slice(&buf[..n]);
            line.n_bytes = n;
        }
        Ok(())
    }

    /// `wr_file`: hole handler then delegate to `do_file_wr`. Growing
    /// past the current logical end without intervening writes is the
    /// hole case; nothing needs writing for the gap itself, `file_size`
    /// simply advances.
    pub fn wr_file(
        &mut self,
        obj_id: u32,
        offset: u64,
        buf: &[u8],
        write_through: bool,
    ) -> YaffsResult<usize> {
        {
            let file = self
                .objects
                .get(obj_id)
                .and_then(|o| o.as_file())
                .ok_or_else(|| YaffsError::InvalidArgument("not a file".into()))?;
            if offset > file.file_size {
                // hole: no data written for the gap, file_size alone
                // advances once the real write below records its end.
            }
        }
        self.do_file_wr(obj_id, offset, buf, write_through)
    }

    /// Resize: shrink deletes obsolete chunks in descending
    /// order so a crash mid-truncate leaves a valid prefix, never a
    /// hole mid-file.
    pub fn resize_file(&mut self, obj_id: u32, new_size: u64) -> YaffsResult<()> {
        self.cache.invalidate_object(obj_id);
        let chunk_size = self.data_bytes_per_chunk() as u64;
        let old_size = self
            .objects
            .get(obj_id)
            .and_then(|o| o.as_file())
            .ok_or_else(|| YaffsError::InvalidArgument("not a file".into()))?
            .file_size;

        if new_size >= old_size {
            if let Some(file) = self.objects.get_mut(obj_id).and_then(|o| o.as_file_mut()) {
                file.file_size = new_size;
            }
            return self.update_oh(obj_id, None, false, 0);
        }

        let old_last_logical = if old_size == 0 { 0 } else { (old_size - 1) / chunk_size + 1 };
        let new_last_logical = if new_size == 0 { 0 } else { (new_size - 1) / chunk_size + 1 };

        for logical in (new_last_logical as u64 + 1..=old_last_logical as u64).rev() {
            let phys = self
                .objects
                .get(obj_id)
                .and_then(|o| o.as_file())
                .and_then(|f| f.tnode.find(logical));
            if let Some(phys_chunk) = phys {
                self.delete_chunk(phys_chunk as usize);
                if let Some(file) = self.objects.get_mut(obj_id).and_then(|o| o.as_file_mut()) {
                    file.tnode.add_find(logical, Some(0));
                    file.n_data_chunks = file.n_data_chunks.saturating_sub(1);
                }
            }
        }

        if new_size % chunk_size != 0 {
            let logical = new_size / chunk_size + 1;
            let phys = self
                .objects
                .get(obj_id)
                .and_then(|o| o.as_file())
                .and_then(|f| f.tnode.find(logical));
            if let Some(phys_chunk) = phys {
                let keep = (new_size % chunk_size) as usize;
                let mut buf = vec![0u8; chunk_size as usize];
                self.read_chunk(phys_chunk as usize, Some(&mut buf))?;
                buf[keep..].fill(0);
                self.wr_data_obj_chunk(obj_id, logical, &buf[..keep], true)?;
            }
        }

        if let Some(file) = self.objects.get_mut(obj_id).and_then(|o| o.as_file_mut()) {
            file.file_size = new_size;
            file.stored_size = file.stored_size.min(new_size);
            file.tnode.prune();
        }

        let is_shrink = true;
        let unlinked = self
            .objects
            .get(obj_id)
            .map(|o| o.flags.deleted || o.flags.is_shadowed)
            .unwrap_or(false);
        if unlinked {
            Ok(())
        } else {
            self.update_oh(obj_id, None, is_shrink, 0)
        }
    }
}

/// Free function wrapper `device.rs`'s `writeback_cache_line` calls,
/// so the cache-line-to-flash path has one definition.
pub fn wr_data_obj<T: NandDriver>(
    dev: &mut Device<T>,
    obj_id: u32,
    logical: u64,
    buf: &[u8],
    use_reserve: bool,
) -> YaffsResult<()> {
    dev.wr_data_obj_chunk(obj_id, logical, buf, use_reserve)
}
