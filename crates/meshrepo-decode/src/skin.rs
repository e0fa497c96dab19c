//! Skin (rig bind) blocks.

use glam::Mat4;

use crate::error::{DecodeError, DecodeResult};
use crate::llsd::{Llsd, unzip_llsd, zip_llsd};

/// Joint names and bind matrices for a rigged mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct SkinInfo {
    pub joint_names: Vec<String>,
    /// One per joint, in joint order.
    pub inverse_bind_matrices: Vec<Mat4>,
    /// Optional override set, one per joint when present.
    pub alternate_bind_matrices: Vec<Mat4>,
    pub bind_shape_matrix: Mat4,
    pub pelvis_offset: f32,
}

impl Default for SkinInfo {
    fn default() -> Self {
        Self {
            joint_names: Vec::new(),
            inverse_bind_matrices: Vec::new(),
            alternate_bind_matrices: Vec::new(),
            bind_shape_matrix: Mat4::IDENTITY,
            pelvis_offset: 0.0,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn matrix_from_llsd(value: &Llsd, context: &'static str) -> DecodeResult<Mat4> {
    let items = value
        .as_array()
        .ok_or_else(|| DecodeError::invalid(context, "matrix is not an array"))?;
    if items.len() != 16 {
        return Err(DecodeError::invalid(
            context,
            format!("matrix has {} elements, expected 16", items.len()),
        ));
    }
    let mut cols = [0.0f32; 16];
    for (slot, item) in cols.iter_mut().zip(items) {
        *slot = item
            .as_real()
            .ok_or_else(|| DecodeError::invalid(context, "matrix element is not a number"))?
            as f32;
    }
    Ok(Mat4::from_cols_array(&cols))
}

fn matrix_to_llsd(matrix: &Mat4) -> Llsd {
    Llsd::Array(matrix.to_cols_array().iter().map(|&v| v.into()).collect())
}

fn matrices_from_llsd(value: &Llsd, context: &'static str) -> DecodeResult<Vec<Mat4>> {
    value
        .as_array()
        .ok_or_else(|| DecodeError::invalid(context, "expected an array of matrices"))?
        .iter()
        .map(|m| matrix_from_llsd(m, context))
        .collect()
}

impl SkinInfo {
    /// Build from the decompressed block map.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_llsd(value: &Llsd) -> DecodeResult<Self> {
        let joint_names = value
            .get("joint_names")
            .and_then(Llsd::as_array)
            .ok_or_else(|| DecodeError::invalid("skin", "missing joint_names"))?
            .iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DecodeError::invalid("skin", "joint name is not a string"))
            })
            .collect::<DecodeResult<Vec<_>>>()?;

        let inverse_bind_matrices = match value.get("inverse_bind_matrix") {
            Some(v) => matrices_from_llsd(v, "skin inverse bind matrices")?,
            None => Vec::new(),
        };
        if inverse_bind_matrices.len() != joint_names.len() {
            return Err(DecodeError::invalid(
                "skin",
                format!(
                    "{} inverse bind matrices for {} joints",
                    inverse_bind_matrices.len(),
                    joint_names.len()
                ),
            ));
        }

        let alternate_bind_matrices = match value.get("alt_inverse_bind_matrix") {
            Some(v) => matrices_from_llsd(v, "skin alternate bind matrices")?,
            None => Vec::new(),
        };

        let bind_shape_matrix = match value.get("bind_shape_matrix") {
            Some(v) => matrix_from_llsd(v, "skin bind shape matrix")?,
            None => Mat4::IDENTITY,
        };

        let pelvis_offset = value
            .get("pelvis_offset")
            .and_then(Llsd::as_real)
            .unwrap_or(0.0) as f32;

        Ok(Self {
            joint_names,
            inverse_bind_matrices,
            alternate_bind_matrices,
            bind_shape_matrix,
            pelvis_offset,
        })
    }

    #[must_use]
    pub fn to_llsd(&self) -> Llsd {
        let mut map = Llsd::map()
            .with(
                "joint_names",
                Llsd::Array(self.joint_names.iter().map(|n| n.as_str().into()).collect()),
            )
            .with(
                "inverse_bind_matrix",
                Llsd::Array(self.inverse_bind_matrices.iter().map(matrix_to_llsd).collect()),
            )
            .with("bind_shape_matrix", matrix_to_llsd(&self.bind_shape_matrix));
        if !self.alternate_bind_matrices.is_empty() {
            map.insert(
                "alt_inverse_bind_matrix",
                Llsd::Array(
                    self.alternate_bind_matrices
                        .iter()
                        .map(matrix_to_llsd)
                        .collect(),
                ),
            );
        }
        if self.pelvis_offset.abs() > f32::EPSILON {
            map.insert("pelvis_offset", self.pelvis_offset);
        }
        map
    }
}

/// Decode a compressed skin block.
pub fn decode_skin(block: &[u8]) -> DecodeResult<SkinInfo> {
    SkinInfo::from_llsd(&unzip_llsd(block)?)
}

/// Encode a skin into a compressed block.
pub fn encode_skin(skin: &SkinInfo) -> DecodeResult<Vec<u8>> {
    zip_llsd(&skin.to_llsd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_skin_block() {
        let skin = SkinInfo {
            joint_names: vec!["mPelvis".to_string(), "mTorso".to_string()],
            inverse_bind_matrices: vec![
                Mat4::IDENTITY,
                Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0)),
            ],
            alternate_bind_matrices: Vec::new(),
            bind_shape_matrix: Mat4::from_scale(Vec3::splat(2.0)),
            pelvis_offset: 0.25,
        };
        let decoded = decode_skin(&encode_skin(&skin).unwrap()).unwrap();
        assert_eq!(decoded, skin);
    }

    #[test]
    fn test_mismatched_matrix_count() {
        let value = Llsd::map()
            .with("joint_names", Llsd::Array(vec!["mPelvis".into()]))
            .with("inverse_bind_matrix", Llsd::Array(Vec::new()));
        assert!(SkinInfo::from_llsd(&value).is_err());
    }

    #[test]
    fn test_short_matrix() {
        let value = Llsd::Array(vec![Llsd::Real(1.0); 12]);
        assert!(matrix_from_llsd(&value, "test").is_err());
    }

    #[test]
    fn test_defaults() {
        let value = Llsd::map().with("joint_names", Llsd::Array(Vec::new()));
        let skin = SkinInfo::from_llsd(&value).unwrap();
        assert_eq!(skin.bind_shape_matrix, Mat4::IDENTITY);
        assert_eq!(skin.pelvis_offset, 0.0);
    }
}
