//! Object-header protocol. An object header is the chunk at logical
//! index 0 of an object, holding enough state to reconstruct the
//! object without any other chunk. `update_oh` writes a fresh header
//! chunk, retires the stale one, and keeps parent/name/size in sync.

use crate::object::{Object, ObjectType, VariantState};
use crate::tags::{ChunkTag, ExtraHeaderInfo};

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ALIAS_LEN: usize = 160;

/// Fixed-size record serialized into the head of a header chunk's data
/// region. The xattr trailer is kept separately as a
/// raw byte buffer preserved verbatim across unrelated updates.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub obj_type: ObjectType,
    pub parent_obj_id: u32,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub rdev: u32,
    pub alias: String,
    pub equiv_id: u32,
    pub file_size: u64,
    pub is_shrink: bool,
    pub shadows_obj: u32,
    pub xattr: Vec<u8>,
}

impl ObjectHeader {
    /// `update_oh` steps 3-5: build a header snapshot from the current
    /// object state, preserving the previous name/xattr when the
    /// caller supplies no new name (step 3) and this isn't a rename.
    pub fn build(
        object: &Object,
        new_name: Option<&str>,
        is_shrink: bool,
        shadows: u32,
        previous: Option<&ObjectHeader>,
    ) -> Self {
        let name = new_name
            .map(|s| s.to_string())
            .or_else(|| previous.map(|p| p.name.clone()))
            .unwrap_or_else(|| object.name.clone());

        let (file_size, equiv_id, alias) = match &object.variant {
            VariantState::File(f) => {
                let size = if object.flags.deleted || object.flags.unlinked {
                    previous.map(|p| p.file_size).unwrap_or(f.stored_size)
                } else {
                    f.stored_size
                };
                (size, 0, String::new())
            }
            VariantState::Symlink(s) => (0, 0, s.alias.clone()),
            VariantState::Hardlink(h) => (0, h.equiv_id, String::new()),
            _ => (0, 0, String::new()),
        };

        ObjectHeader {
            obj_type: object.obj_type(),
            parent_obj_id: object.parent,
            name,
            mode: object.mode,
            uid: object.uid,
            gid: object.gid,
            atime: object.atime,
            mtime: object.mtime,
            ctime: object.ctime,
            rdev: 0,
            alias,
            equiv_id,
            file_size,
            is_shrink,
            shadows_obj: shadows,
            xattr: previous.map(|p| p.xattr.clone()).unwrap_or_default(),
        }
    }

    /// Step 6: build the tag this header will be written with.
    pub fn build_tag(&self, obj_id: u32, serial: u8) -> ChunkTag {
        ChunkTag {
            obj_id,
            chunk_id: 0,
            n_bytes: 0,
            serial,
            seq_number: 0,
            extra: ExtraHeaderInfo {
                available: true,
                parent_id: self.parent_obj_id,
                file_size: self.file_size,
                is_shrink: self.is_shrink,
                equiv_id: self.equiv_id,
                shadows: self.shadows_obj,
                obj_type: self.obj_type.into(),
            },
        }
    }

    /// Serializes into a flat byte buffer, name truncated to
    /// `MAX_NAME_LEN` and alias to `MAX_ALIAS_LEN`, xattr
    /// trailer appended verbatim.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(u8::from(self.obj_type));
        out.extend_from_slice(&self.parent_obj_id.to_le_bytes());
        let mut name_bytes = vec![0u8; MAX_NAME_LEN];
        let n = self.name.as_bytes();
        let take = n.len().min(MAX_NAME_LEN - 1);
        name_bytes[..take].copy_from_slice(&n[..take]);
        out.extend_from_slice(&name_bytes);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.atime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.rdev.to_le_bytes());
        let mut alias_bytes = vec![0u8; MAX_ALIAS_LEN];
        let a = self.alias.as_bytes();
        let take = a.len().min(MAX_ALIAS_LEN - 1);
        alias_bytes[..take].copy_from_slice(&a[..take]);
        out.extend_from_slice(&alias_bytes);
        out.extend_from_slice(&self.equiv_id.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.push(self.is_shrink as u8);
        out.extend_from_slice(&self.shadows_obj.to_le_bytes());
        out.extend_from_slice(&self.xattr);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let mut p = 0usize;
        let take = |p: &mut usize, n: usize| -> Option<&[u8]> {
            let s = buf.get(*p..*p + n)?;
            *p += n;
            Some(s)
        };
        let obj_type = ObjectType::try_from(*take(&mut p, 1)?.first()?).ok()?;
        let parent_obj_id = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let name_raw = take(&mut p, MAX_NAME_LEN)?;
        let name_len = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let name = String::from_utf8_lossy(&name_raw[..name_len]).to_string();
        let mode = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let uid = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let gid = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let atime = i64::from_le_bytes(take(&mut p, 8)?.try_into().ok()?);
        let mtime = i64::from_le_bytes(take(&mut p, 8)?.try_into().ok()?);
        let ctime = i64::from_le_bytes(take(&mut p, 8)?.try_into().ok()?);
        let rdev = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let alias_raw = take(&mut p, MAX_ALIAS_LEN)?;
        let alias_len = alias_raw.iter().position(|&b| b == 0).unwrap_or(alias_raw.len());
        let alias = String::from_utf8_lossy(&alias_raw[..alias_len]).to_string();
        let equiv_id = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let file_size = u64::from_le_bytes(take(&mut p, 8)?.try_into().ok()?);
        let is_shrink = *take(&mut p, 1)?.first()? != 0;
        let shadows_obj = u32::from_le_bytes(take(&mut p, 4)?.try_into().ok()?);
        let xattr = buf[p..].to_vec();
        Some(ObjectHeader {
            obj_type,
            parent_obj_id,
            name,
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            rdev,
            alias,
            equiv_id,
            file_size,
            is_shrink,
            shadows_obj,
            xattr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{FileState, ObjectFlags};

    fn file_obj() -> Object {
        Object {
            obj_id: 10,
            parent: 1,
            name: "a.txt".into(),
            mode: 0o100644,
            uid: 0,
            gid: 0,
            atime: 1,
            mtime: 2,
            ctime: 3,
            hdr_chunk: 0,
            serial: 0,
            flags: ObjectFlags::default(),
            variant: VariantState::File(FileState {
                stored_size: 42,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let obj = file_obj();
        let hdr = ObjectHeader::build(&obj, None, false, 0, None);
        let bytes = hdr.to_bytes();
        let back = ObjectHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.name, "a.txt");
        assert_eq!(back.file_size, 42);
        assert_eq!(back.parent_obj_id, 1);
    }

    #[test]
    fn rename_preserves_xattr_when_no_new_name() {
        let obj = file_obj();
        let mut prev = ObjectHeader::build(&obj, None, false, 0, None);
        prev.xattr = b"user.foo=bar".to_vec();
        let next = ObjectHeader::build(&obj, None, false, 0, Some(&prev));
        assert_eq!(next.xattr, prev.xattr);
        assert_eq!(next.name, "a.txt");
    }
}
