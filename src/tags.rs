//! Tag marshalling. Packs and unpacks the per-chunk metadata record to
//! the NAND spare area (v1, v2-spare) or to an inband trailer inside
//! the data region (v2-inband), using `zerocopy` to reinterpret a
//! `#[repr(C)]` struct as bytes without manual pointer casts.

use nand_driver::EccResult;
use zerocopy::{AsBytes, FromBytes};

pub const BAD_BLOCK_SENTINEL: u32 = u32::MAX;

/// Trailer length when tags are stored inband rather than in spare.
pub const INBAND_TAG_BYTES: usize = std::mem::size_of::<PackedTagsV2>();

/// Extra fields carried only on object-header chunks (`chunk_id == 0`),
/// present in v2 tags to let scan reconstruct state without reading
/// the header body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraHeaderInfo {
    pub available: bool,
    pub parent_id: u32,
    pub file_size: u64,
    pub is_shrink: bool,
    pub equiv_id: u32,
    pub shadows: u32,
    pub obj_type: u8,
}

/// In-RAM representation of a chunk's tag, flavor-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkTag {
    pub obj_id: u32,
    pub chunk_id: u32,
    pub n_bytes: u32,
    pub serial: u8,
    pub seq_number: u32,
    pub extra: ExtraHeaderInfo,
}

impl ChunkTag {
    pub fn is_header(&self) -> bool {
        self.chunk_id == 0
    }
}

/// Wire layout for v1 tags (spare area, no seq_number / extra fields).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct PackedTagsV1 {
    obj_id: u32,
    chunk_id: u32,
    n_bytes: u32,
    serial: u8,
    _pad: [u8; 3],
}

/// Wire layout for v2 tags (spare or inband trailer).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct PackedTagsV2 {
    extra_file_size: u64,
    obj_id: u32,
    chunk_id: u32,
    n_bytes: u32,
    seq_number: u32,
    extra_parent_id: u32,
    extra_equiv_id: u32,
    extra_shadows: u32,
    serial: u8,
    extra_available: u8,
    extra_is_shrink: u8,
    extra_obj_type: u8,
}

/// `V1`/`V2` are interchangeable tag-layout implementations; `Device`
/// picks one at mount time based on `Geometry::is_yaffs2`. An enum
/// dispatch stands in for the function-pointer table a C
/// implementation would use for the same interchangeable-behavior
/// idea.
#[derive(Debug, Clone, Copy)]
pub enum TagMarshaller {
    V1,
    V2,
}

impl TagMarshaller {
    pub fn write_chunk_tags(&self, tag: &ChunkTag, spare: &mut [u8]) {
        match self {
            TagMarshaller::V1 => {
                let packed = PackedTagsV1 {
                    obj_id: tag.obj_id,
                    chunk_id: tag.chunk_id,
                    n_bytes: tag.n_bytes,
                    serial: tag.serial,
                    _pad: [0; 3],
                };
                let bytes = packed.as_bytes();
                spare[..bytes.len()].copy_from_slice(bytes);
            }
            TagMarshaller::V2 => {
                let packed = PackedTagsV2 {
                    extra_file_size: tag.extra.file_size,
                    obj_id: tag.obj_id,
                    chunk_id: tag.chunk_id,
                    n_bytes: tag.n_bytes,
                    seq_number: tag.seq_number,
                    extra_parent_id: tag.extra.parent_id,
                    extra_equiv_id: tag.extra.equiv_id,
                    extra_shadows: tag.extra.shadows,
                    serial: tag.serial,
                    extra_available: tag.extra.available as u8,
                    extra_is_shrink: tag.extra.is_shrink as u8,
                    extra_obj_type: tag.extra.obj_type,
                };
                let bytes = packed.as_bytes();
                spare[..bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    /// Returns `None` when the region is all-0xFF (an erased, never
    /// written chunk) so callers treat it as absent rather than a
    /// spuriously all-zero tag.
    pub fn read_chunk_tags(&self, spare: &[u8], ecc: EccResult) -> Option<ChunkTag> {
        if ecc == EccResult::Unfixed {
            return None;
        }
        if spare.iter().all(|&b| b == 0xFF) {
            return None;
        }
        match self {
            TagMarshaller::V1 => {
                let packed = PackedTagsV1::read_from_prefix(spare)?;
                Some(ChunkTag {
                    obj_id: packed.obj_id,
                    chunk_id: packed.chunk_id,
                    n_bytes: packed.n_bytes,
                    serial: packed.serial,
                    seq_number: 0,
                    extra: ExtraHeaderInfo::default(),
                })
            }
            TagMarshaller::V2 => {
                let packed = PackedTagsV2::read_from_prefix(spare)?;
                if packed.seq_number == BAD_BLOCK_SENTINEL {
                    return None;
                }
                Some(ChunkTag {
                    obj_id: packed.obj_id,
                    chunk_id: packed.chunk_id,
                    n_bytes: packed.n_bytes,
                    serial: packed.serial,
                    seq_number: packed.seq_number,
                    extra: ExtraHeaderInfo {
                        available: packed.extra_available != 0,
                        parent_id: packed.extra_parent_id,
                        file_size: packed.extra_file_size,
                        is_shrink: packed.extra_is_shrink != 0,
                        equiv_id: packed.extra_equiv_id,
                        obj_type: packed.extra_obj_type,
                        shadows: packed.extra_shadows,
                    },
                })
            }
        }
    }

    /// Bad-block marker: v1 writes a zeroed tag with
    /// `seq_number = BAD_BLOCK`; v2 prefers the driver's `mark_bad`,
    /// this is the fallback encoding.
    pub fn write_bad_block_marker(&self, spare: &mut [u8]) {
        spare.fill(0);
        if let TagMarshaller::V2 = self {
            let packed = PackedTagsV2 {
                extra_file_size: 0,
                obj_id: 0,
                chunk_id: 0,
                n_bytes: 0,
                seq_number: BAD_BLOCK_SENTINEL,
                extra_parent_id: 0,
                extra_equiv_id: 0,
                extra_shadows: 0,
                serial: 0,
                extra_available: 0,
                extra_is_shrink: 0,
                extra_obj_type: 0,
            };
            let bytes = packed.as_bytes();
            spare[..bytes.len()].copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_round_trips_through_spare() {
        let tag = ChunkTag {
            obj_id: 7,
            chunk_id: 3,
            n_bytes: 2048,
            serial: 1,
            seq_number: 42,
            extra: ExtraHeaderInfo::default(),
        };
        let mut spare = vec![0u8; INBAND_TAG_BYTES];
        TagMarshaller::V2.write_chunk_tags(&tag, &mut spare);
        let back = TagMarshaller::V2
            .read_chunk_tags(&spare, EccResult::None)
            .unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn erased_spare_reads_as_absent() {
        let spare = vec![0xFFu8; INBAND_TAG_BYTES];
        assert!(TagMarshaller::V2
            .read_chunk_tags(&spare, EccResult::None)
            .is_none());
    }

    #[test]
    fn unfixable_ecc_reads_as_absent() {
        let tag = ChunkTag {
            obj_id: 1,
            chunk_id: 0,
            n_bytes: 0,
            serial: 0,
            seq_number: 1,
            extra: ExtraHeaderInfo::default(),
        };
        let mut spare = vec![0u8; INBAND_TAG_BYTES];
        TagMarshaller::V2.write_chunk_tags(&tag, &mut spare);
        assert!(TagMarshaller::V2
            .read_chunk_tags(&spare, EccResult::Unfixed)
            .is_none());
    }

    #[test]
    fn bad_block_marker_round_trips_as_sentinel() {
        let mut spare = vec![0u8; INBAND_TAG_BYTES];
        TagMarshaller::V2.write_bad_block_marker(&mut spare);
        assert!(TagMarshaller::V2
            .read_chunk_tags(&spare, EccResult::None)
            .is_none());
    }
}
