//! Mesh asset header.
//!
//! The header is a binary structured-data map at the start of every asset. It
//! carries the format version and, per named block, an `offset` and `size`
//! relative to the end of the header itself.

use crate::error::{DecodeError, DecodeResult};
use crate::llsd::Llsd;

/// Number of geometry detail levels.
pub const NUM_LODS: usize = 4;

/// Deprecated plain-text tag that may precede the header, followed by a newline.
pub const LEGACY_PREFIX: &[u8] = b"<? LLSD/Binary ?>";

/// Named block within a mesh asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockKind {
    LowestLod,
    LowLod,
    MediumLod,
    HighLod,
    Skin,
    /// Server-provided convex decomposition.
    PhysicsConvex,
    /// Lightweight collision mesh.
    PhysicsMesh,
}

impl BlockKind {
    pub const ALL: [BlockKind; 7] = [
        BlockKind::LowestLod,
        BlockKind::LowLod,
        BlockKind::MediumLod,
        BlockKind::HighLod,
        BlockKind::Skin,
        BlockKind::PhysicsConvex,
        BlockKind::PhysicsMesh,
    ];

    /// The key used for this block in the header map.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::LowestLod => "lowest_lod",
            Self::LowLod => "low_lod",
            Self::MediumLod => "medium_lod",
            Self::HighLod => "high_lod",
            Self::Skin => "skin",
            Self::PhysicsConvex => "physics_convex",
            Self::PhysicsMesh => "physics_mesh",
        }
    }

    /// Block for a geometry LOD in `0..NUM_LODS`.
    #[must_use]
    pub fn from_lod(lod: usize) -> Option<Self> {
        match lod {
            0 => Some(Self::LowestLod),
            1 => Some(Self::LowLod),
            2 => Some(Self::MediumLod),
            3 => Some(Self::HighLod),
            _ => None,
        }
    }

    #[must_use]
    pub fn lod(self) -> Option<usize> {
        match self {
            Self::LowestLod => Some(0),
            Self::LowLod => Some(1),
            Self::MediumLod => Some(2),
            Self::HighLod => Some(3),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Location of one block relative to the end of the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u32,
    pub size: u32,
}

impl BlockInfo {
    #[must_use]
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// A zero size means the block is absent.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.size > 0
    }

    /// End of the block, relative to the end of the header.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// Parsed header of one mesh asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshHeader {
    pub version: i32,
    /// Bytes occupied by the header, including any legacy prefix line.
    pub header_size: u32,
    /// The asset is known not to exist.
    pub not_found: bool,
    blocks: [BlockInfo; 7],
}

impl MeshHeader {
    #[must_use]
    pub fn new(version: i32) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Header recorded for an asset the server reported as nonexistent.
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            not_found: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn block(&self, kind: BlockKind) -> BlockInfo {
        self.blocks[kind.index()]
    }

    pub fn set_block(&mut self, kind: BlockKind, info: BlockInfo) {
        self.blocks[kind.index()] = info;
    }

    /// Declared byte size of a geometry LOD, zero when absent or out of range.
    #[must_use]
    pub fn lod_size(&self, lod: usize) -> u32 {
        BlockKind::from_lod(lod).map_or(0, |kind| self.block(kind).size)
    }

    /// Whether any geometry LOD declares data.
    #[must_use]
    pub fn has_geometry(&self) -> bool {
        (0..NUM_LODS).any(|lod| self.lod_size(lod) > 0)
    }

    /// Version is accepted and the asset is not marked missing.
    #[must_use]
    pub fn is_usable(&self, max_version: i32) -> bool {
        !self.not_found && self.version <= max_version
    }

    /// Absolute `(start, len)` of a block within the asset, or `None` if absent.
    #[must_use]
    pub fn absolute_range(&self, kind: BlockKind) -> Option<(u64, u32)> {
        let info = self.block(kind);
        info.is_present()
            .then(|| (u64::from(self.header_size) + u64::from(info.offset), info.size))
    }

    /// Largest `offset + size` over every declared block.
    #[must_use]
    pub fn max_block_extent(&self) -> u64 {
        self.blocks.iter().map(BlockInfo::end).max().unwrap_or(0)
    }

    /// Total bytes needed to hold the header plus every declared block.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        u64::from(self.header_size) + self.max_block_extent()
    }

    /// Slice a block out of a complete asset buffer.
    #[must_use]
    pub fn block_slice<'a>(&self, asset: &'a [u8], kind: BlockKind) -> Option<&'a [u8]> {
        let (start, len) = self.absolute_range(kind)?;
        let start = usize::try_from(start).ok()?;
        let end = start.checked_add(len as usize)?;
        asset.get(start..end)
    }

    /// Structured-data form of the header. Absent blocks are omitted.
    #[must_use]
    pub fn to_llsd(&self) -> Llsd {
        let mut map = Llsd::map().with("version", self.version);
        if self.not_found {
            map.insert("404", true);
        }
        for kind in BlockKind::ALL {
            let info = self.block(kind);
            if info.is_present() {
                map.insert(
                    kind.name(),
                    Llsd::map()
                        .with("offset", info.offset)
                        .with("size", info.size),
                );
            }
        }
        map
    }

    /// Binary encoding without the legacy prefix.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_llsd().to_binary()
    }
}

fn read_u32_field(block: &Llsd, key: &str, context: &'static str) -> DecodeResult<u32> {
    match block.get(key).and_then(Llsd::as_integer) {
        None => Ok(0),
        Some(v) => u32::try_from(v)
            .map_err(|_| DecodeError::invalid(context, format!("negative {key}: {v}"))),
    }
}

/// Parse a header from the start of an asset.
///
/// An empty input is the server's way of saying the asset does not exist
/// and yields [`MeshHeader::not_found`]. Bytes after the header map are
/// ignored, so the input may be the first few kilobytes of the asset.
pub fn parse_header(data: &[u8]) -> DecodeResult<MeshHeader> {
    if data.is_empty() {
        return Ok(MeshHeader::not_found());
    }

    let mut prefix_len = 0;
    if data.starts_with(LEGACY_PREFIX) {
        // Tag plus its trailing newline.
        prefix_len = LEGACY_PREFIX.len() + 1;
        if data.len() < prefix_len {
            return Err(DecodeError::UnexpectedEof {
                context: "header prefix",
            });
        }
    }

    let (value, consumed) = Llsd::parse_binary(&data[prefix_len..])?;
    if value.as_map().is_none() {
        return Err(DecodeError::invalid("header", "top-level value is not a map"));
    }

    let header_size = u32::try_from(prefix_len + consumed)
        .map_err(|_| DecodeError::invalid("header", "header larger than 4 GiB"))?;

    let mut header = MeshHeader {
        version: value.get("version").and_then(Llsd::as_integer).unwrap_or(0),
        header_size,
        not_found: value.has("404"),
        blocks: [BlockInfo::default(); 7],
    };

    for kind in BlockKind::ALL {
        if let Some(block) = value.get(kind.name()) {
            let info = BlockInfo {
                offset: read_u32_field(block, "offset", "header block offset")?,
                size: read_u32_field(block, "size", "header block size")?,
            };
            header.set_block(kind, info);
        }
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> MeshHeader {
        let mut header = MeshHeader::new(1);
        header.set_block(BlockKind::LowestLod, BlockInfo::new(0, 100));
        header.set_block(BlockKind::HighLod, BlockInfo::new(100, 400));
        header.set_block(BlockKind::Skin, BlockInfo::new(500, 50));
        header
    }

    #[test]
    fn test_parse_header_basic() {
        let header = sample_header();
        let encoded = header.encode();
        let parsed = parse_header(&encoded).unwrap();

        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.header_size as usize, encoded.len());
        assert_eq!(parsed.block(BlockKind::HighLod), BlockInfo::new(100, 400));
        assert!(!parsed.block(BlockKind::MediumLod).is_present());
        assert!(!parsed.not_found);
    }

    #[test]
    fn test_parse_header_ignores_trailing_block_data() {
        let header = sample_header();
        let mut data = header.encode();
        let header_len = data.len();
        data.extend_from_slice(&[7; 550]);

        let parsed = parse_header(&data).unwrap();
        assert_eq!(parsed.header_size as usize, header_len);
        assert_eq!(parsed.absolute_range(BlockKind::Skin), Some((header_len as u64 + 500, 50)));
    }

    #[test]
    fn test_parse_header_legacy_prefix() {
        let header = sample_header();
        let mut data = LEGACY_PREFIX.to_vec();
        data.push(b'\n');
        data.extend_from_slice(&header.encode());

        let parsed = parse_header(&data).unwrap();
        assert_eq!(
            parsed.header_size as usize,
            LEGACY_PREFIX.len() + 1 + header.encode().len()
        );
        assert_eq!(parsed.block(BlockKind::LowestLod).size, 100);
    }

    #[test]
    fn test_empty_body_is_not_found() {
        let parsed = parse_header(&[]).unwrap();
        assert!(parsed.not_found);
        assert!(!parsed.is_usable(999));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_header(b"not a mesh").is_err());
        // A valid value that is not a map.
        assert!(parse_header(&Llsd::Integer(3).to_binary()).is_err());
    }

    #[test]
    fn test_negative_size_rejected() {
        let data = Llsd::map()
            .with("version", 1)
            .with("high_lod", Llsd::map().with("offset", 0).with("size", -5))
            .to_binary();
        assert!(parse_header(&data).is_err());
    }

    #[test]
    fn test_extent_and_slice() {
        let mut header = sample_header();
        header.header_size = 10;
        assert_eq!(header.max_block_extent(), 550);
        assert_eq!(header.total_size(), 560);

        let asset: Vec<u8> = (0..560u32).map(|i| (i % 251) as u8).collect();
        let skin = header.block_slice(&asset, BlockKind::Skin).unwrap();
        assert_eq!(skin.len(), 50);
        assert_eq!(skin[0], asset[510]);
        assert!(header.block_slice(&asset, BlockKind::PhysicsMesh).is_none());
    }

    #[test]
    fn test_unsupported_version() {
        let header = MeshHeader::new(1000);
        assert!(!header.is_usable(999));
        assert!(MeshHeader::new(999).is_usable(999));
    }

    proptest! {
        #[test]
        fn prop_header_blocks_survive_encoding(
            version in 0i32..1000,
            blocks in proptest::collection::vec((0u32..1 << 20, 0u32..1 << 20), 7),
        ) {
            let mut header = MeshHeader::new(version);
            for (kind, (offset, size)) in BlockKind::ALL.into_iter().zip(blocks) {
                header.set_block(kind, BlockInfo::new(offset, size));
            }
            let parsed = parse_header(&header.encode()).unwrap();
            prop_assert_eq!(parsed.version, version);
            for kind in BlockKind::ALL {
                let expected = header.block(kind);
                if expected.is_present() {
                    prop_assert_eq!(parsed.block(kind), expected);
                } else {
                    prop_assert!(!parsed.block(kind).is_present());
                }
            }
        }
    }
}
