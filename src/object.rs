//! Object store: the object graph node type and a hash-bucketed arena
//! holding every live object. Objects own their entry in a dense slab
//! keyed by a stable id; parent and hardlink-target references are
//! weak lookups into the same arena, never ownership, so cycles in
//! the graph (child -> parent, hardlink -> target) never become
//! ownership cycles.

use crate::tnode::TnodeTree;
use std::collections::HashMap;

pub const N_BUCKETS: usize = 256;
pub const ROOT_OBJ_ID: u32 = 1;
pub const LOST_N_FOUND_OBJ_ID: u32 = 2;
pub const UNLINKED_OBJ_ID: u32 = 3;
pub const DELETED_OBJ_ID: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Hardlink = 3,
    Special = 4,
}

#[derive(Debug, Clone, Default)]
pub struct FileState {
    pub file_size: u64,
    pub stored_size: u64,
    pub shrink_size: u64,
    pub tnode: TnodeTree,
    pub n_data_chunks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryState {
    pub children: Vec<u32>,
    pub is_dirty_dir: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SymlinkState {
    pub alias: String,
}

#[derive(Debug, Clone, Default)]
pub struct HardlinkState {
    pub equiv_id: u32,
}

#[derive(Debug, Clone)]
pub enum VariantState {
    File(FileState),
    Directory(DirectoryState),
    Symlink(SymlinkState),
    Hardlink(HardlinkState),
    Special,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectFlags {
    pub deleted: bool,
    pub unlinked: bool,
    pub soft_del: bool,
    pub dirty: bool,
    pub fake: bool,
    pub is_shadowed: bool,
    pub lazy_loaded: bool,
    pub has_xattr: bool,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub obj_id: u32,
    pub parent: u32,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub hdr_chunk: usize,
    pub serial: u8,
    pub flags: ObjectFlags,
    pub variant: VariantState,
}

impl Object {
    pub fn obj_type(&self) -> ObjectType {
        match &self.variant {
            VariantState::File(_) => ObjectType::File,
            VariantState::Directory(_) => ObjectType::Directory,
            VariantState::Symlink(_) => ObjectType::Symlink,
            VariantState::Hardlink(_) => ObjectType::Hardlink,
            VariantState::Special => ObjectType::Special,
        }
    }

    pub fn as_file(&self) -> Option<&FileState> {
        match &self.variant {
            VariantState::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileState> {
        match &mut self.variant {
            VariantState::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirectoryState> {
        match &self.variant {
            VariantState::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirectoryState> {
        match &mut self.variant {
            VariantState::Directory(d) => Some(d),
            _ => None,
        }
    }

    /// Precomputed case-insensitive 16-bit name sum used as a cheap
    /// filter before a full string compare during lookup.
    pub fn name_sum(name: &str) -> u16 {
        let mut sum: u16 = 0;
        for c in name.chars() {
            sum = sum
                .wrapping_shl(3)
                .wrapping_add(c.to_ascii_lowercase() as u16);
        }
        sum
    }
}

/// Hash-bucketed object arena. New ids avoid collisions by probing
/// `bucket + k*N_BUCKETS`.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<u32, Object>,
    next_probe: HashMap<u32, u32>,
    max_objects: usize,
}

impl ObjectStore {
    pub fn new(max_objects: usize) -> Self {
        Self {
            objects: HashMap::new(),
            next_probe: HashMap::new(),
            max_objects,
        }
    }

    pub fn bucket_of(id: u32) -> u32 {
        id % N_BUCKETS as u32
    }

    pub fn allocate_id(&mut self) -> Option<u32> {
        if self.objects.len() >= self.max_objects {
            return None;
        }
        for bucket in 0..N_BUCKETS as u32 {
            let start = self.next_probe.get(&bucket).copied().unwrap_or(0);
            for k in 0..=self.max_objects as u32 {
                let candidate = bucket + k * N_BUCKETS as u32;
                if candidate == 0 {
                    continue;
                }
                if candidate >= start && !self.objects.contains_key(&candidate) {
                    self.next_probe.insert(bucket, candidate + N_BUCKETS as u32);
                    return Some(candidate);
                }
            }
        }
        None
    }

    pub fn insert(&mut self, object: Object) {
        self.objects.insert(object.obj_id, object);
    }

    pub fn get(&self, id: u32) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Object> {
        self.objects.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Object)> {
        self.objects.iter()
    }

    /// Lookup by name within a directory's child list, filtering first
    /// by the cheap name-sum before a full compare.
    pub fn lookup_child(&self, parent: u32, name: &str) -> Option<u32> {
        let sum = Object::name_sum(name);
        let dir = self.objects.get(&parent)?.as_dir()?;
        dir.children
            .iter()
            .find(|&&id| {
                self.objects
                    .get(&id)
                    .map(|o| Object::name_sum(&o.name) == sum && o.name == name)
                    .unwrap_or(false)
            })
            .copied()
    }

    pub fn make_fake_dir(&mut self, obj_id: u32, name: &str, parent: u32) {
        self.insert(Object {
            obj_id,
            parent,
            name: name.to_string(),
            mode: 0o40755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            hdr_chunk: 0,
            serial: 0,
            flags: ObjectFlags {
                fake: true,
                ..Default::default()
            },
            variant: VariantState::Directory(DirectoryState::default()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_id_avoids_collisions_in_bucket() {
        let mut store = ObjectStore::new(1000);
        let a = store.allocate_id().unwrap();
        store.insert(Object {
            obj_id: a,
            parent: 0,
            name: String::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            hdr_chunk: 0,
            serial: 0,
            flags: ObjectFlags::default(),
            variant: VariantState::Special,
        });
        let b = store.allocate_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn lookup_child_finds_by_name() {
        let mut store = ObjectStore::new(1000);
        store.make_fake_dir(ROOT_OBJ_ID, "", 0);
        let child_id = 10;
        store.insert(Object {
            obj_id: child_id,
            parent: ROOT_OBJ_ID,
            name: "hello.txt".into(),
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            hdr_chunk: 5,
            serial: 0,
            flags: ObjectFlags::default(),
            variant: VariantState::File(FileState::default()),
        });
        store
            .get_mut(ROOT_OBJ_ID)
            .unwrap()
            .as_dir_mut()
            .unwrap()
            .children
            .push(child_id);
        assert_eq!(store.lookup_child(ROOT_OBJ_ID, "hello.txt"), Some(child_id));
        assert_eq!(store.lookup_child(ROOT_OBJ_ID, "nope"), None);
    }
}
