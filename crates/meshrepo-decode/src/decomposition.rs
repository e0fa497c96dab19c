//! Convex decomposition and physics shape blocks.

use glam::Vec3;

use crate::error::{DecodeError, DecodeResult};
use crate::llsd::{Llsd, unzip_llsd, zip_llsd};
use crate::quantize::{
    DEFAULT_POSITION_MAX, DEFAULT_POSITION_MIN, bounds, domain_vec3, pack_vec3, unpack_vec3,
    vec3_from_llsd, vec3_to_llsd,
};
use crate::volume::{MeshVolume, decode_volume};

/// Largest point count a single hull can declare.
pub const MAX_HULL_POINTS: usize = 256;

/// A triangle soup with one face normal per vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicsMesh {
    /// Three entries per triangle.
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

impl PhysicsMesh {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.normals.clear();
    }

    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Append one triangle, deriving its face normal.
    pub fn push_triangle(&mut self, a: Vec3, b: Vec3, c: Vec3) {
        let normal = (b - a).cross(c - a).normalize_or_zero();
        self.positions.extend_from_slice(&[a, b, c]);
        self.normals.extend_from_slice(&[normal, normal, normal]);
    }

    /// Flatten every face of a volume into a triangle soup.
    #[must_use]
    pub fn from_volume(volume: &MeshVolume) -> Self {
        let mut mesh = Self::default();
        for face in &volume.faces {
            for tri in face.indices.chunks_exact(3) {
                mesh.push_triangle(
                    face.positions[usize::from(tri[0])],
                    face.positions[usize::from(tri[1])],
                    face.positions[usize::from(tri[2])],
                );
            }
        }
        mesh
    }
}

/// Convex hull approximation of a mesh, plus its collision-only mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    /// Point cloud of each hull.
    pub hulls: Vec<Vec<Vec3>>,
    /// Renderable mesh per hull, parallel to `hulls` once built.
    pub hull_meshes: Vec<PhysicsMesh>,
    /// Single-hull approximation of the whole mesh.
    pub base_hull: Vec<Vec3>,
    pub base_hull_mesh: PhysicsMesh,
    /// Collision mesh from the physics shape block.
    pub physics_shape_mesh: PhysicsMesh,
}

impl Decomposition {
    #[must_use]
    pub fn has_hulls(&self) -> bool {
        !self.hulls.is_empty()
    }

    /// Fill in whatever parts `other` has and `self` lacks.
    ///
    /// Server decompositions and physics shapes arrive separately for the
    /// same asset and are combined into one record.
    pub fn merge(&mut self, other: Decomposition) {
        if !other.hulls.is_empty() {
            self.hulls = other.hulls;
            self.hull_meshes = other.hull_meshes;
        }
        if !other.base_hull.is_empty() {
            self.base_hull = other.base_hull;
            self.base_hull_mesh = other.base_hull_mesh;
        }
        if !other.physics_shape_mesh.is_empty() {
            self.physics_shape_mesh = other.physics_shape_mesh;
        }
    }

    pub fn from_llsd(value: &Llsd) -> DecodeResult<Self> {
        let mut decomposition = Self::default();

        if let Some(hull_list) = value.get("HullList").and_then(Llsd::as_binary) {
            let positions = value
                .get("Positions")
                .and_then(Llsd::as_binary)
                .ok_or_else(|| DecodeError::invalid("decomposition", "missing Positions"))?;
            let domain = (
                value
                    .get("Min")
                    .and_then(vec3_from_llsd)
                    .unwrap_or(DEFAULT_POSITION_MIN),
                value
                    .get("Max")
                    .and_then(vec3_from_llsd)
                    .unwrap_or(DEFAULT_POSITION_MAX),
            );
            let points = unpack_vec3(positions, domain.0, domain.1, "decomposition positions")?;

            // A zero count stands for a full 256-point hull.
            let counts: Vec<usize> = hull_list
                .iter()
                .map(|&c| if c == 0 { MAX_HULL_POINTS } else { usize::from(c) })
                .collect();
            let declared: usize = counts.iter().sum();
            if declared != points.len() {
                return Err(DecodeError::invalid(
                    "decomposition",
                    format!(
                        "hull list declares {declared} points, found {}",
                        points.len()
                    ),
                ));
            }

            let mut start = 0;
            for count in counts {
                decomposition.hulls.push(points[start..start + count].to_vec());
                start += count;
            }
        }

        if let Some(packed) = value.get("BoundingVerts").and_then(Llsd::as_binary) {
            let (min, max) = domain_vec3(
                value.get("BoundingDomain"),
                (DEFAULT_POSITION_MIN, DEFAULT_POSITION_MAX),
            );
            decomposition.base_hull = unpack_vec3(packed, min, max, "decomposition base hull")?;
        }

        Ok(decomposition)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_llsd(&self) -> DecodeResult<Llsd> {
        let mut map = Llsd::map();

        if !self.hulls.is_empty() {
            let mut hull_list = Vec::with_capacity(self.hulls.len());
            for hull in &self.hulls {
                if hull.is_empty() || hull.len() > MAX_HULL_POINTS {
                    return Err(DecodeError::invalid(
                        "decomposition",
                        format!("hull with {} points cannot be encoded", hull.len()),
                    ));
                }
                // 256 wraps to the zero marker.
                hull_list.push((hull.len() % MAX_HULL_POINTS) as u8);
            }
            let all_points: Vec<Vec3> = self.hulls.iter().flatten().copied().collect();
            let (min, max) = bounds(&all_points);
            map.insert("HullList", hull_list);
            map.insert("Positions", pack_vec3(&all_points, min, max));
            map.insert("Min", vec3_to_llsd(min));
            map.insert("Max", vec3_to_llsd(max));
        }

        if !self.base_hull.is_empty() {
            let (min, max) = bounds(&self.base_hull);
            map.insert("BoundingVerts", pack_vec3(&self.base_hull, min, max));
            map.insert(
                "BoundingDomain",
                Llsd::map()
                    .with("Min", vec3_to_llsd(min))
                    .with("Max", vec3_to_llsd(max)),
            );
        }

        Ok(map)
    }
}

/// Decode a compressed decomposition block.
///
/// Hull meshes are left empty; building them needs a hull triangulator.
pub fn decode_decomposition(block: &[u8]) -> DecodeResult<Decomposition> {
    Decomposition::from_llsd(&unzip_llsd(block)?)
}

pub fn encode_decomposition(decomposition: &Decomposition) -> DecodeResult<Vec<u8>> {
    zip_llsd(&decomposition.to_llsd()?)
}

/// Decode a physics shape block into a triangle soup.
///
/// The block uses the geometry encoding; an empty block means the asset has
/// no physics shape, which is not an error.
pub fn decode_physics_shape(block: &[u8]) -> DecodeResult<PhysicsMesh> {
    if block.is_empty() {
        return Ok(PhysicsMesh::default());
    }
    Ok(PhysicsMesh::from_volume(&decode_volume(block)?))
}
