//! LOD geometry blocks.
//!
//! A geometry block is a zlib-compressed array of face maps. Each face carries
//! quantized positions, optional normals and texture coordinates, and a
//! triangle list of `u16` indices.

use glam::{Vec2, Vec3};

use crate::error::{DecodeError, DecodeResult};
use crate::llsd::{Llsd, unzip_llsd, zip_llsd};
use crate::quantize::{
    DEFAULT_POSITION_MAX, DEFAULT_POSITION_MIN, bounds, domain_vec3, pack_u16, pack_vec2,
    pack_vec3, unpack_u16, unpack_vec2, unpack_vec3, vec2_from_llsd, vec2_to_llsd, vec3_to_llsd,
};

/// One material face group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeFace {
    pub positions: Vec<Vec3>,
    /// Empty, or one per position.
    pub normals: Vec<Vec3>,
    /// Empty, or one per position.
    pub tex_coords: Vec<Vec2>,
    /// Triangle list.
    pub indices: Vec<u16>,
}

impl VolumeFace {
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// A face with no geometry, kept as a placeholder for its material slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() || self.indices.is_empty()
    }
}

/// Decoded geometry for one LOD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshVolume {
    pub faces: Vec<VolumeFace>,
}

impl MeshVolume {
    #[must_use]
    pub fn new(faces: Vec<VolumeFace>) -> Self {
        Self { faces }
    }

    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.faces.iter().map(VolumeFace::triangle_count).sum()
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.faces.iter().map(|f| f.positions.len()).sum()
    }

    /// True when there is nothing to render.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triangle_count() == 0
    }
}

fn decode_face(face: &Llsd) -> DecodeResult<VolumeFace> {
    if face.as_map().is_none() {
        return Err(DecodeError::invalid("volume face", "face is not a map"));
    }
    if face.get("NoGeometry").and_then(Llsd::as_bool) == Some(true) {
        return Ok(VolumeFace::default());
    }

    let packed_positions = face
        .get("Position")
        .and_then(Llsd::as_binary)
        .ok_or_else(|| DecodeError::invalid("volume face", "missing Position"))?;
    let (min, max) = domain_vec3(
        face.get("PositionDomain"),
        (DEFAULT_POSITION_MIN, DEFAULT_POSITION_MAX),
    );
    let positions = unpack_vec3(packed_positions, min, max, "face positions")?;

    let normals = match face.get("Normal").and_then(Llsd::as_binary) {
        Some(packed) => unpack_vec3(packed, Vec3::NEG_ONE, Vec3::ONE, "face normals")?,
        None => Vec::new(),
    };
    if !normals.is_empty() && normals.len() != positions.len() {
        return Err(DecodeError::invalid(
            "volume face",
            format!("{} normals for {} positions", normals.len(), positions.len()),
        ));
    }

    let tex_coords = match face.get("TexCoord0").and_then(Llsd::as_binary) {
        Some(packed) => {
            let domain = face.get("TexCoord0Domain");
            let min = domain
                .and_then(|d| d.get("Min"))
                .and_then(vec2_from_llsd)
                .unwrap_or(Vec2::ZERO);
            let max = domain
                .and_then(|d| d.get("Max"))
                .and_then(vec2_from_llsd)
                .unwrap_or(Vec2::ONE);
            unpack_vec2(packed, min, max, "face texcoords")?
        }
        None => Vec::new(),
    };
    if !tex_coords.is_empty() && tex_coords.len() != positions.len() {
        return Err(DecodeError::invalid(
            "volume face",
            format!(
                "{} texcoords for {} positions",
                tex_coords.len(),
                positions.len()
            ),
        ));
    }

    let packed_indices = face
        .get("TriangleList")
        .and_then(Llsd::as_binary)
        .ok_or_else(|| DecodeError::invalid("volume face", "missing TriangleList"))?;
    let indices = unpack_u16(packed_indices, "face indices")?;
    if !indices.len().is_multiple_of(3) {
        return Err(DecodeError::invalid(
            "volume face",
            format!("index count {} is not a multiple of 3", indices.len()),
        ));
    }
    if let Some(&bad) = indices.iter().find(|&&i| usize::from(i) >= positions.len()) {
        return Err(DecodeError::IndexOutOfBounds {
            index: usize::from(bad),
            len: positions.len(),
        });
    }

    Ok(VolumeFace {
        positions,
        normals,
        tex_coords,
        indices,
    })
}

/// Decode a compressed geometry block.
///
/// # Errors
///
/// Returns an error if the block cannot be inflated, is not an array of
/// faces, or a face references a vertex that does not exist.
pub fn decode_volume(block: &[u8]) -> DecodeResult<MeshVolume> {
    let value = unzip_llsd(block)?;
    volume_from_llsd(&value)
}

pub(crate) fn volume_from_llsd(value: &Llsd) -> DecodeResult<MeshVolume> {
    let faces = value
        .as_array()
        .ok_or_else(|| DecodeError::invalid("volume", "top-level value is not an array"))?;
    let faces = faces.iter().map(decode_face).collect::<DecodeResult<_>>()?;
    Ok(MeshVolume { faces })
}

fn encode_face(face: &VolumeFace) -> Llsd {
    if face.is_empty() {
        return Llsd::map().with("NoGeometry", true);
    }

    let (min, max) = bounds(&face.positions);
    let mut map = Llsd::map()
        .with(
            "PositionDomain",
            Llsd::map()
                .with("Min", vec3_to_llsd(min))
                .with("Max", vec3_to_llsd(max)),
        )
        .with("Position", pack_vec3(&face.positions, min, max))
        .with("TriangleList", pack_u16(&face.indices));

    if !face.normals.is_empty() {
        map.insert("Normal", pack_vec3(&face.normals, Vec3::NEG_ONE, Vec3::ONE));
    }
    if !face.tex_coords.is_empty() {
        let (min, max) = face.tex_coords.iter().fold(
            (Vec2::splat(f32::MAX), Vec2::splat(f32::MIN)),
            |(lo, hi), t| (lo.min(*t), hi.max(*t)),
        );
        map.insert(
            "TexCoord0Domain",
            Llsd::map()
                .with("Min", vec2_to_llsd(min))
                .with("Max", vec2_to_llsd(max)),
        );
        map.insert("TexCoord0", pack_vec2(&face.tex_coords, min, max));
    }
    map
}

pub(crate) fn volume_to_llsd(volume: &MeshVolume) -> Llsd {
    Llsd::Array(volume.faces.iter().map(encode_face).collect())
}

/// Encode geometry into a compressed block.
pub fn encode_volume(volume: &MeshVolume) -> DecodeResult<Vec<u8>> {
    zip_llsd(&volume_to_llsd(volume))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> VolumeFace {
        VolumeFace {
            positions: vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
            tex_coords: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(0.0, 1.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    #[test]
    fn test_volume_counts() {
        let volume = MeshVolume::new(vec![quad(), VolumeFace::default()]);
        assert_eq!(volume.triangle_count(), 2);
        assert_eq!(volume.vertex_count(), 4);
        assert!(!volume.is_empty());
        assert!(MeshVolume::default().is_empty());
    }

    #[test]
    fn test_decode_encoded_quad() {
        let volume = MeshVolume::new(vec![quad(), VolumeFace::default()]);
        let block = encode_volume(&volume).unwrap();
        let decoded = decode_volume(&block).unwrap();

        assert_eq!(decoded.faces.len(), 2);
        let face = &decoded.faces[0];
        assert_eq!(face.indices, vec![0, 1, 2, 0, 2, 3]);
        for (a, b) in face.positions.iter().zip(&quad().positions) {
            assert!((*a - *b).abs().max_element() < 1e-3);
        }
        assert!((face.normals[0] - Vec3::Z).length() < 1e-3);
        assert!(decoded.faces[1].is_empty());
    }

    #[test]
    fn test_default_position_domain() {
        // No PositionDomain: positions land inside [-0.5, 0.5].
        let face = Llsd::map()
            .with("Position", vec![0xFF, 0xFF, 0, 0, 0xFF, 0xFF])
            .with("TriangleList", Vec::<u8>::new());
        let decoded = decode_face(&face).unwrap();
        assert!((decoded.positions[0] - Vec3::new(0.5, -0.5, 0.5)).length() < 1e-6);
    }

    #[test]
    fn test_index_out_of_bounds() {
        let face = Llsd::map()
            .with("Position", vec![0; 6])
            .with("TriangleList", pack_u16(&[0, 0, 5]));
        assert_eq!(
            decode_face(&face),
            Err(DecodeError::IndexOutOfBounds { index: 5, len: 1 })
        );
    }

    #[test]
    fn test_missing_triangle_list() {
        let face = Llsd::map().with("Position", vec![0; 6]);
        assert!(decode_face(&face).is_err());
    }

    #[test]
    fn test_not_an_array() {
        let block = zip_llsd(&Llsd::map()).unwrap();
        assert!(decode_volume(&block).is_err());
    }

    #[test]
    fn test_uncompressed_block_rejected() {
        let raw = volume_to_llsd(&MeshVolume::new(vec![quad()])).to_binary();
        assert!(decode_volume(&raw).is_err());
    }
}
