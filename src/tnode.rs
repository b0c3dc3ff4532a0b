//! Tnode tree: the per-file radix index from logical chunk to
//! physical chunk. Implemented as a safe owned tree (`Box<Tnode>`
//! children) rather than packed bitfield arrays — level-0 slots are
//! modeled conceptually as `tnode_width`-bit values, but a plain `u32`
//! per slot keeps the tree logic legible on a host with RAM to spare;
//! `tnode_width` still bounds what value a slot may legally hold.

pub const TNODES_PER_LEVEL: usize = 16;

#[derive(Debug, Clone)]
enum Tnode {
    Leaf(Box<[u32; TNODES_PER_LEVEL]>),
    Internal(Box<[Option<Tnode>; TNODES_PER_LEVEL]>),
}

impl Tnode {
    fn new_leaf() -> Self {
        Tnode::Leaf(Box::new([0u32; TNODES_PER_LEVEL]))
    }

    fn new_internal() -> Self {
        Tnode::Internal(Box::new(Default::default()))
    }

    fn is_empty(&self) -> bool {
        match self {
            Tnode::Leaf(slots) => slots.iter().all(|&s| s == 0),
            Tnode::Internal(children) => children.iter().all(|c| c.is_none()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TnodeTree {
    root: Option<Tnode>,
    height: u32,
}

fn capacity_at_height(height: u32) -> u64 {
    (TNODES_PER_LEVEL as u64).pow(height.max(1))
}

impl TnodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// `find(logical) -> Option<phys_chunk>`. Height-checks first: a
    /// shorter tree than the logical index requires means "no data
    /// beneath it", not an error.
    pub fn find(&self, logical: u64) -> Option<u32> {
        let root = self.root.as_ref()?;
        if self.height == 0 || logical >= capacity_at_height(self.height) {
            return None;
        }
        let mut node = root;
        let mut level = self.height;
        let mut idx = logical;
        loop {
            let digit = (idx / (TNODES_PER_LEVEL as u64).pow(level - 1)) % TNODES_PER_LEVEL as u64;
            idx %= (TNODES_PER_LEVEL as u64).pow(level - 1);
            match node {
                Tnode::Leaf(slots) => return Some(slots[digit as usize]).filter(|&v| v != 0),
                Tnode::Internal(children) => {
                    node = children[digit as usize].as_ref()?;
                    level -= 1;
                    if level == 0 {
                        unreachable!("leaf level must terminate via Tnode::Leaf");
                    }
                }
            }
        }
    }

    /// Grows height as needed, creates missing internal nodes, and at
    /// level 1 optionally replaces the leaf slot. Idempotent for
    /// nonzero existing values when `replacement` is `None`.
    pub fn add_find(&mut self, logical: u64, replacement: Option<u32>) -> u32 {
        while self.root.is_none() || logical >= capacity_at_height(self.height.max(1)) {
            let old_root = self.root.take();
            let old_height = self.height;
            if old_root.is_none() {
                self.root = Some(Tnode::new_leaf());
                self.height = 1;
                continue;
            }
            let mut new_children: [Option<Tnode>; TNODES_PER_LEVEL] = Default::default();
            new_children[0] = old_root;
            self.root = Some(Tnode::Internal(Box::new(new_children)));
            self.height = old_height + 1;
        }

        let mut level = self.height;
        let mut idx = logical;
        let mut node = self.root.as_mut().unwrap();
        loop {
            let digit = (idx / (TNODES_PER_LEVEL as u64).pow(level - 1)) % TNODES_PER_LEVEL as u64;
            idx %= (TNODES_PER_LEVEL as u64).pow(level - 1);
            match node {
                Tnode::Leaf(slots) => {
                    if let Some(new_val) = replacement {
                        slots[digit as usize] = new_val;
                    }
                    return slots[digit as usize];
                }
                Tnode::Internal(children) => {
                    if children[digit as usize].is_none() {
                        children[digit as usize] = Some(if level == 2 {
                            Tnode::new_leaf()
                        } else {
                            Tnode::new_internal()
                        });
                    }
                    node = children[digit as usize].as_mut().unwrap();
                    level -= 1;
                }
            }
        }
    }

    /// Bottom-up free of empty subtrees, then shrink height while the
    /// root's only nonzero content lives in slot 0.
    pub fn prune(&mut self) {
        fn prune_rec(node: &mut Tnode) -> bool {
            if let Tnode::Internal(children) = node {
                for child in children.iter_mut() {
                    if let Some(c) = child {
                        if prune_rec(c) {
                            *child = None;
                        }
                    }
                }
            }
            node.is_empty()
        }

        if let Some(root) = self.root.as_mut() {
            if prune_rec(root) {
                self.root = None;
                self.height = 0;
                return;
            }
        }

        while self.height > 1 {
            let collapse = match self.root.as_ref().unwrap() {
                Tnode::Internal(children) => {
                    children.iter().skip(1).all(|c| c.is_none()) && children[0].is_some()
                }
                Tnode::Leaf(_) => false,
            };
            if !collapse {
                break;
            }
            if let Some(Tnode::Internal(mut children)) = self.root.take() {
                self.root = children[0].take();
                self.height -= 1;
            }
        }
    }

    /// Depth-first reverse walk crediting each live leaf slot to the
    /// caller via `on_chunk`, then zeroing it; frees finished subtrees.
    /// Partial progress is safe: a restart re-walks and resumes because
    /// already-zeroed slots are simply skipped.
    pub fn soft_del(&mut self, mut on_chunk: impl FnMut(u32)) {
        fn walk(node: &mut Tnode, on_chunk: &mut impl FnMut(u32)) {
            match node {
                Tnode::Leaf(slots) => {
                    for slot in slots.iter_mut().rev() {
                        if *slot != 0 {
                            on_chunk(*slot);
                            *slot = 0;
                        }
                    }
                }
                Tnode::Internal(children) => {
                    for child in children.iter_mut().rev() {
                        if let Some(c) = child {
                            walk(c, on_chunk);
                        }
                    }
                }
            }
        }
        if let Some(root) = self.root.as_mut() {
            walk(root, &mut on_chunk);
        }
        self.prune();
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Flattens every live leaf into `(logical, phys)` pairs, used by
    /// checkpoint serialization to avoid saving the tree shape itself.
    pub fn entries(&self) -> Vec<(u64, u32)> {
        fn walk(node: &Tnode, prefix: u64, level: u32, out: &mut Vec<(u64, u32)>) {
            match node {
                Tnode::Leaf(slots) => {
                    for (digit, &slot) in slots.iter().enumerate() {
                        if slot != 0 {
                            out.push((prefix + digit as u64, slot));
                        }
                    }
                }
                Tnode::Internal(children) => {
                    for (digit, child) in children.iter().enumerate() {
                        if let Some(c) = child {
                            let next_prefix =
                                prefix + digit as u64 * (TNODES_PER_LEVEL as u64).pow(level - 1);
                            walk(c, next_prefix, level - 1, out);
                        }
                    }
                }
            }
        }
        let mut out = Vec::new();
        if let Some(root) = self.root.as_ref() {
            walk(root, 0, self.height, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_on_empty_tree_is_none() {
        let t = TnodeTree::new();
        assert_eq!(t.find(0), None);
        assert_eq!(t.find(1000), None);
    }

    #[test]
    fn add_find_then_find_round_trips() {
        let mut t = TnodeTree::new();
        t.add_find(0, Some(100));
        t.add_find(5, Some(105));
        assert_eq!(t.find(0), Some(100));
        assert_eq!(t.find(5), Some(105));
        assert_eq!(t.find(6), None);
    }

    #[test]
    fn grows_height_for_large_logical_index() {
        let mut t = TnodeTree::new();
        t.add_find(10_000, Some(42));
        assert!(t.height() >= 2);
        assert_eq!(t.find(10_000), Some(42));
        assert_eq!(t.find(0), None);
    }

    #[test]
    fn prune_collapses_tree_after_all_zeroed() {
        let mut t = TnodeTree::new();
        t.add_find(0, Some(1));
        t.add_find(10_000, Some(2));
        t.add_find(10_000, Some(0));
        t.prune();
        assert_eq!(t.find(0), Some(1));
    }

    #[test]
    fn soft_del_visits_every_live_chunk_and_clears_tree() {
        let mut t = TnodeTree::new();
        t.add_find(0, Some(1));
        t.add_find(1, Some(2));
        t.add_find(300, Some(3));
        let mut seen = vec![];
        t.soft_del(|c| seen.push(c));
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(t.find(0), None);
        assert_eq!(t.find(300), None);
    }
}
