//! Quantized vector packing.
//!
//! Geometry is stored as little-endian `u16` components mapped linearly onto a
//! per-block domain `[min, max]`.

use glam::{Vec2, Vec3};

use crate::error::{DecodeError, DecodeResult};
use crate::llsd::Llsd;

/// Default position domain when a block omits one.
pub const DEFAULT_POSITION_MIN: Vec3 = Vec3::splat(-0.5);
pub const DEFAULT_POSITION_MAX: Vec3 = Vec3::splat(0.5);

const U16_MAX: f32 = 65535.0;

fn read_u16s(packed: &[u8], components: usize, context: &'static str) -> DecodeResult<Vec<u16>> {
    let stride = components * 2;
    if !packed.len().is_multiple_of(stride) {
        return Err(DecodeError::invalid(
            context,
            format!(
                "packed data length {} is not divisible by {stride}",
                packed.len()
            ),
        ));
    }
    Ok(packed
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect())
}

fn dequantize(value: u16, min: f32, max: f32) -> f32 {
    min + f32::from(value) / U16_MAX * (max - min)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize(value: f32, min: f32, max: f32) -> u16 {
    let range = max - min;
    if range <= f32::EPSILON {
        return 0;
    }
    ((value - min) / range).clamp(0.0, 1.0).mul_add(U16_MAX, 0.5) as u16
}

/// Unpack `u16` triples into points inside `[min, max]`.
pub fn unpack_vec3(
    packed: &[u8],
    min: Vec3,
    max: Vec3,
    context: &'static str,
) -> DecodeResult<Vec<Vec3>> {
    let values = read_u16s(packed, 3, context)?;
    Ok(values
        .chunks_exact(3)
        .map(|c| {
            Vec3::new(
                dequantize(c[0], min.x, max.x),
                dequantize(c[1], min.y, max.y),
                dequantize(c[2], min.z, max.z),
            )
        })
        .collect())
}

/// Unpack `u16` pairs into points inside `[min, max]`.
pub fn unpack_vec2(
    packed: &[u8],
    min: Vec2,
    max: Vec2,
    context: &'static str,
) -> DecodeResult<Vec<Vec2>> {
    let values = read_u16s(packed, 2, context)?;
    Ok(values
        .chunks_exact(2)
        .map(|c| Vec2::new(dequantize(c[0], min.x, max.x), dequantize(c[1], min.y, max.y)))
        .collect())
}

/// Unpack raw little-endian `u16` indices.
pub fn unpack_u16(packed: &[u8], context: &'static str) -> DecodeResult<Vec<u16>> {
    read_u16s(packed, 1, context)
}

pub fn pack_vec3(points: &[Vec3], min: Vec3, max: Vec3) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 6);
    for p in points {
        out.extend_from_slice(&quantize(p.x, min.x, max.x).to_le_bytes());
        out.extend_from_slice(&quantize(p.y, min.y, max.y).to_le_bytes());
        out.extend_from_slice(&quantize(p.z, min.z, max.z).to_le_bytes());
    }
    out
}

pub fn pack_vec2(points: &[Vec2], min: Vec2, max: Vec2) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 4);
    for p in points {
        out.extend_from_slice(&quantize(p.x, min.x, max.x).to_le_bytes());
        out.extend_from_slice(&quantize(p.y, min.y, max.y).to_le_bytes());
    }
    out
}

pub fn pack_u16(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Bounding box of a point set, or the default domain when empty.
pub fn bounds(points: &[Vec3]) -> (Vec3, Vec3) {
    if points.is_empty() {
        return (DEFAULT_POSITION_MIN, DEFAULT_POSITION_MAX);
    }
    points.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(lo, hi), p| (lo.min(*p), hi.max(*p)),
    )
}

/// Read a three-real array such as a domain bound.
#[allow(clippy::cast_possible_truncation)]
pub fn vec3_from_llsd(value: &Llsd) -> Option<Vec3> {
    let items = value.as_array()?;
    if items.len() < 3 {
        return None;
    }
    Some(Vec3::new(
        items[0].as_real()? as f32,
        items[1].as_real()? as f32,
        items[2].as_real()? as f32,
    ))
}

#[allow(clippy::cast_possible_truncation)]
pub fn vec2_from_llsd(value: &Llsd) -> Option<Vec2> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    Some(Vec2::new(items[0].as_real()? as f32, items[1].as_real()? as f32))
}

pub fn vec3_to_llsd(v: Vec3) -> Llsd {
    Llsd::Array(vec![v.x.into(), v.y.into(), v.z.into()])
}

pub fn vec2_to_llsd(v: Vec2) -> Llsd {
    Llsd::Array(vec![v.x.into(), v.y.into()])
}

/// Read a `{Min, Max}` domain map, falling back to `default`.
pub fn domain_vec3(value: Option<&Llsd>, default: (Vec3, Vec3)) -> (Vec3, Vec3) {
    let Some(domain) = value else {
        return default;
    };
    let min = domain.get("Min").and_then(vec3_from_llsd);
    let max = domain.get("Max").and_then(vec3_from_llsd);
    (min.unwrap_or(default.0), max.unwrap_or(default.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_empty() {
        let result = unpack_vec3(&[], Vec3::ZERO, Vec3::ONE, "test").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_unpack_extremes() {
        // (0, 65535, 32767) inside [-1, 1].
        let packed = [0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x7F];
        let result = unpack_vec3(&packed, Vec3::splat(-1.0), Vec3::splat(1.0), "test").unwrap();
        assert_eq!(result.len(), 1);
        assert!((result[0].x + 1.0).abs() < 1e-6);
        assert!((result[0].y - 1.0).abs() < 1e-6);
        assert!(result[0].z.abs() < 1e-4);
    }

    #[test]
    fn test_unpack_bad_length() {
        assert!(unpack_vec3(&[0; 7], Vec3::ZERO, Vec3::ONE, "test").is_err());
        assert!(unpack_u16(&[0; 3], "test").is_err());
    }

    #[test]
    fn test_pack_precision() {
        let min = Vec3::new(-2.0, 0.0, 10.0);
        let max = Vec3::new(2.0, 1.0, 20.0);
        let points = vec![Vec3::new(0.3, 0.75, 12.5), min, max];
        let packed = pack_vec3(&points, min, max);
        let unpacked = unpack_vec3(&packed, min, max, "test").unwrap();
        for (a, b) in points.iter().zip(&unpacked) {
            assert!((*a - *b).abs().max_element() < 1e-3);
        }
    }

    #[test]
    fn test_flat_domain_packs_to_zero() {
        let packed = pack_vec3(&[Vec3::ONE], Vec3::ONE, Vec3::ONE);
        assert_eq!(packed, vec![0; 6]);
    }

    #[test]
    fn test_domain_fallback() {
        let domain = Llsd::map().with("Min", vec3_to_llsd(Vec3::splat(-3.0)));
        let (min, max) = domain_vec3(Some(&domain), (Vec3::ZERO, Vec3::ONE));
        assert_eq!(min, Vec3::splat(-3.0));
        assert_eq!(max, Vec3::ONE);
    }
}
