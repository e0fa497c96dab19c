//! Whole-asset assembly.
//!
//! Lays out a header followed by each present block, back to back, in
//! header block order.

use crate::decomposition::{Decomposition, encode_decomposition};
use crate::error::{DecodeError, DecodeResult};
use crate::header::{BlockInfo, BlockKind, MeshHeader, NUM_LODS};
use crate::skin::{SkinInfo, encode_skin};
use crate::volume::{MeshVolume, encode_volume};

/// Current container format version.
pub const FORMAT_VERSION: i32 = 1;

/// In-memory contents of an asset prior to encoding.
#[derive(Debug, Clone, Default)]
pub struct AssetBlocks {
    /// Indexed by LOD, lowest first.
    pub lods: [Option<MeshVolume>; NUM_LODS],
    pub skin: Option<SkinInfo>,
    pub decomposition: Option<Decomposition>,
    pub physics_shape: Option<MeshVolume>,
}

/// An encoded asset and the header describing it.
#[derive(Debug, Clone)]
pub struct EncodedAsset {
    pub header: MeshHeader,
    pub bytes: Vec<u8>,
}

/// Encode every present block and assemble the asset.
pub fn write_asset(blocks: &AssetBlocks) -> DecodeResult<EncodedAsset> {
    let mut raw = Vec::new();
    for (lod, volume) in blocks.lods.iter().enumerate() {
        if let (Some(volume), Some(kind)) = (volume, BlockKind::from_lod(lod)) {
            raw.push((kind, encode_volume(volume)?));
        }
    }
    if let Some(skin) = &blocks.skin {
        raw.push((BlockKind::Skin, encode_skin(skin)?));
    }
    if let Some(decomposition) = &blocks.decomposition {
        raw.push((BlockKind::PhysicsConvex, encode_decomposition(decomposition)?));
    }
    if let Some(shape) = &blocks.physics_shape {
        raw.push((BlockKind::PhysicsMesh, encode_volume(shape)?));
    }
    write_raw_asset(FORMAT_VERSION, &raw)
}

/// Assemble an asset from already-encoded block bytes.
///
/// Empty byte strings produce no header entry.
pub fn write_raw_asset(version: i32, blocks: &[(BlockKind, Vec<u8>)]) -> DecodeResult<EncodedAsset> {
    let mut header = MeshHeader::new(version);
    let mut body = Vec::new();

    for (kind, bytes) in blocks {
        if bytes.is_empty() {
            continue;
        }
        let offset = u32::try_from(body.len())
            .map_err(|_| DecodeError::invalid("asset writer", "asset exceeds 4 GiB"))?;
        let size = u32::try_from(bytes.len())
            .map_err(|_| DecodeError::invalid("asset writer", "block exceeds 4 GiB"))?;
        header.set_block(*kind, BlockInfo::new(offset, size));
        body.extend_from_slice(bytes);
    }

    let mut bytes = header.encode();
    header.header_size = u32::try_from(bytes.len())
        .map_err(|_| DecodeError::invalid("asset writer", "header exceeds 4 GiB"))?;
    bytes.extend_from_slice(&body);

    Ok(EncodedAsset { header, bytes })
}
