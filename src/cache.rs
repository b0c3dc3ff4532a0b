//! Short-op cache: a pool of write-back cache
//! lines keyed by `(obj_id, logical_chunk)`, LRU by a monotonic
//! `last_use` counter.

#[derive(Debug, Clone)]
pub struct CacheLine {
    pub obj_id: u32,
    pub chunk_id: u32,
    pub data: Vec<u8>,
    pub n_bytes: usize,
    pub dirty: bool,
    pub locked: bool,
    pub last_use: u64,
}

#[derive(Debug)]
pub struct ShortOpCache {
    lines: Vec<Option<CacheLine>>,
    clock: u64,
    chunk_size: usize,
}

impl ShortOpCache {
    pub fn new(n_caches: usize, chunk_size: usize) -> Self {
        Self {
            lines: (0..n_caches).map(|_| None).collect(),
            clock: 0,
            chunk_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.lines.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        if self.clock == u64::MAX {
            for line in self.lines.iter_mut().flatten() {
                line.last_use = 0;
            }
            self.clock = 1;
        }
        self.clock
    }

    pub fn find(&self, obj_id: u32, chunk_id: u32) -> Option<usize> {
        self.lines.iter().position(|l| {
            l.as_ref()
                .map(|l| l.obj_id == obj_id && l.chunk_id == chunk_id)
                .unwrap_or(false)
        })
    }

    pub fn touch(&mut self, idx: usize) {
        let t = self.tick();
        if let Some(line) = self.lines[idx].as_mut() {
            line.last_use = t;
        }
    }

    /// Grab policy: an unused line first, otherwise the unlocked LRU
    /// line. Returns `None` only if every line is locked.
    /// If the chosen victim is dirty, the caller must write it back
    /// (via the line's data, read with [`ShortOpCache::line`]) before
    /// calling [`ShortOpCache::install`] — left to the caller rather
    /// than a callback here so flushing (which needs the whole
    /// `Device`, not just the cache) doesn't require re-entrant
    /// borrows of `self`.
    pub fn grab(&mut self) -> Option<usize> {
        if let Some(idx) = self.lines.iter().position(|l| l.is_none()) {
            return Some(idx);
        }
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.as_ref().unwrap().locked)
            .min_by_key(|(_, l)| l.as_ref().unwrap().last_use)
            .map(|(i, _)| i)
    }

    pub fn install(&mut self, idx: usize, obj_id: u32, chunk_id: u32) {
        let t = self.tick();
        self.lines[idx] = Some(CacheLine {
            obj_id,
            chunk_id,
            data: vec![0u8; self.chunk_size],
            n_bytes: 0,
            dirty: false,
            locked: false,
            last_use: t,
        });
    }

    pub fn line(&self, idx: usize) -> &CacheLine {
        self.lines[idx].as_ref().unwrap()
    }

    pub fn line_mut(&mut self, idx: usize) -> &mut CacheLine {
        self.lines[idx].as_mut().unwrap()
    }

    /// Lists occupied lines as `(index, obj_id, chunk_id)`, used by
    /// `flush_file` to find every line belonging to one object without
    /// needing to know cache internals.
    pub fn occupied(&self) -> Vec<(usize, u32, u32)> {
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|l| (i, l.obj_id, l.chunk_id)))
            .collect()
    }

    pub fn invalidate(&mut self, obj_id: u32, chunk_id: u32) {
        if let Some(idx) = self.find(obj_id, chunk_id) {
            self.lines[idx] = None;
        }
    }

    pub fn invalidate_object(&mut self, obj_id: u32) {
        for line in self.lines.iter_mut() {
            if line.as_ref().map(|l| l.obj_id == obj_id).unwrap_or(false) {
                *line = None;
            }
        }
    }

    pub fn mark_clean(&mut self, idx: usize) {
        if let Some(line) = self.lines[idx].as_mut() {
            line.dirty = false;
        }
    }

    pub fn evict(&mut self, idx: usize) {
        self.lines[idx] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_prefers_unused_line() {
        let mut cache = ShortOpCache::new(2, 64);
        let idx = cache.grab().unwrap();
        cache.install(idx, 1, 1);
        let idx2 = cache.grab().unwrap();
        assert_ne!(idx, idx2);
    }

    #[test]
    fn grab_returns_lru_victim_when_full() {
        let mut cache = ShortOpCache::new(1, 64);
        let idx = cache.grab().unwrap();
        cache.install(idx, 1, 1);
        cache.line_mut(idx).dirty = true;
        let idx2 = cache.grab().unwrap();
        assert_eq!(idx, idx2);
        assert!(cache.line(idx2).dirty);
    }

    #[test]
    fn locked_line_blocks_eviction_when_sole_occupant() {
        let mut cache = ShortOpCache::new(1, 64);
        let idx = cache.grab().unwrap();
        cache.install(idx, 1, 1);
        cache.line_mut(idx).locked = true;
        assert!(cache.grab().is_none());
    }
}
