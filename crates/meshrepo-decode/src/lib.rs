//! Decode and encode chunked binary mesh assets.
//!
//! A mesh asset is a binary structured-data header followed by a series of
//! independently compressed blocks: four geometry LODs, skin bind data, a
//! convex decomposition and an optional physics collision mesh. The header
//! declares where each block lives relative to its own end.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **User-controlled parallelism**: Callers decide where decoding runs
//! - **Symmetric**: Every block decoder has an encoder, used for uploads and fixtures

pub mod decomposition;
mod error;
pub mod header;
pub mod llsd;
mod quantize;
pub mod skin;
pub mod volume;
pub mod writer;

pub use decomposition::{
    Decomposition, PhysicsMesh, decode_decomposition, decode_physics_shape, encode_decomposition,
};
pub use error::{DecodeError, DecodeResult};
pub use header::{BlockInfo, BlockKind, LEGACY_PREFIX, MeshHeader, NUM_LODS, parse_header};
pub use llsd::{Llsd, unzip_llsd, zip_llsd};
pub use skin::{SkinInfo, decode_skin, encode_skin};
pub use volume::{MeshVolume, VolumeFace, decode_volume, encode_volume};
pub use writer::{AssetBlocks, EncodedAsset, write_asset, write_raw_asset};
