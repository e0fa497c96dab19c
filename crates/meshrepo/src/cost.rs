//! Streaming cost estimates derived from header block sizes.
//!
//! Nothing here needs geometry: triangle counts are estimated from the byte
//! size of each LOD, and the cost of showing an object is a weighted blend of
//! those estimates over the distance bands in which each LOD is visible.

use std::f32::consts::PI;

use meshrepo_decode::{BlockKind, MeshHeader, NUM_LODS};

use crate::config::RepositoryConfig;

/// Cost charged for an animated object on top of its geometry.
pub const ANIMATED_OBJECT_BASE_COST: f32 = 15.0;

/// Radius-based cost of an object that exhausts the triangle budget.
const MAX_RADIUS_COST: f32 = 15_000.0;

/// Furthest distance at which a LOD switch is considered.
const MAX_DISTANCE: f32 = 512.0;

/// Area of the visible region, capping the area weights.
const MAX_AREA: f32 = 102_944.0;

/// Distance-to-radius ratios at which each coarser LOD takes over.
const LOWEST_SWITCH: f32 = 0.03;
const LOW_SWITCH: f32 = 0.06;
const MEDIUM_SWITCH: f32 = 0.24;

/// Fewest triangles any LOD is assumed to have when charging for streaming.
const MIN_STREAMING_TRIANGLES: f32 = 64.0;

/// Triangle-based cost per streamed triangle.
const TRIANGLE_COST: f32 = 1.5 * 0.001;

/// Byte-to-triangle conversion constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostParams {
    pub metadata_discount: u32,
    pub minimum_size: u32,
    pub bytes_per_triangle: u32,
    pub triangle_budget: u32,
}

impl Default for CostParams {
    fn default() -> Self {
        Self::from(&RepositoryConfig::default())
    }
}

impl From<&RepositoryConfig> for CostParams {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            metadata_discount: config.metadata_discount,
            minimum_size: config.minimum_size,
            bytes_per_triangle: config.bytes_per_triangle.max(1),
            triangle_budget: config.triangle_budget.max(1),
        }
    }
}

/// Per-LOD byte sizes and triangle estimates of one asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostData {
    sizes: [u32; NUM_LODS],
    est_tris: [f32; NUM_LODS],
    triangle_budget: u32,
}

impl CostData {
    /// Build cost data from a header, or `None` if the header is unusable.
    ///
    /// A header is unusable when the asset is missing, its version is too
    /// new, or it has no lowest LOD.
    #[must_use]
    pub fn from_header(header: &MeshHeader, max_version: i32, params: &CostParams) -> Option<Self> {
        if !header.is_usable(max_version) || !header.block(BlockKind::LowestLod).is_present() {
            return None;
        }
        let mut sizes = [0; NUM_LODS];
        for (lod, size) in sizes.iter_mut().enumerate() {
            *size = header.lod_size(lod);
        }
        Some(Self::new(sizes, params))
    }

    /// Build cost data from raw LOD sizes, lowest first.
    ///
    /// A missing LOD inherits the size of the next finer one, so the medium
    /// LOD falls back to the high size, the low to the medium and the lowest
    /// to the low.
    #[must_use]
    pub fn new(mut sizes: [u32; NUM_LODS], params: &CostParams) -> Self {
        for lod in (0..NUM_LODS - 1).rev() {
            if sizes[lod] == 0 {
                sizes[lod] = sizes[lod + 1];
            }
        }

        let discount = params.metadata_discount;
        let mut est_tris = [0.0; NUM_LODS];
        for (est, &size) in est_tris.iter_mut().zip(&sizes) {
            let bytes = size.saturating_sub(discount).max(params.minimum_size);
            *est = bytes as f32 / params.bytes_per_triangle as f32;
        }

        Self {
            sizes,
            est_tris,
            triangle_budget: params.triangle_budget,
        }
    }

    /// Size of a LOD after fallback, zero out of range.
    #[must_use]
    pub fn size_by_lod(&self, lod: usize) -> u32 {
        self.sizes.get(lod).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn size_total(&self) -> u64 {
        self.sizes.iter().map(|&s| u64::from(s)).sum()
    }

    /// Estimated triangles of a LOD, zero out of range.
    #[must_use]
    pub fn est_tris_by_lod(&self, lod: usize) -> f32 {
        self.est_tris.get(lod).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn est_tris_max(&self) -> f32 {
        self.est_tris.iter().copied().fold(0.0, f32::max)
    }

    /// Triangle estimate blended by how much of the visible area each LOD
    /// is shown in, for an object of the given radius.
    #[must_use]
    pub fn radius_weighted_tris(&self, radius: f32) -> f32 {
        let dlowest = (radius / LOWEST_SWITCH).min(MAX_DISTANCE);
        let dlow = (radius / LOW_SWITCH).min(MAX_DISTANCE);
        let dmid = (radius / MEDIUM_SWITCH).min(MAX_DISTANCE);

        let high_area = (PI * dmid * dmid).min(MAX_AREA);
        let mut mid_area = (PI * dlow * dlow).min(MAX_AREA);
        let mut low_area = (PI * dlowest * dlowest).min(MAX_AREA);
        let mut lowest_area = MAX_AREA;

        // Each LOD owns the ring between its switch distance and the next.
        lowest_area -= low_area;
        low_area -= mid_area;
        mid_area -= high_area;

        let areas = [lowest_area, low_area, mid_area, high_area].map(|a| a.clamp(1.0, MAX_AREA));
        let total: f32 = areas.iter().sum();

        areas
            .iter()
            .zip(&self.est_tris)
            .map(|(area, tris)| area / total * tris)
            .sum()
    }

    /// Triangles charged for streaming every LOD.
    ///
    /// Each coarser LOD is expected to have at most half the triangles of the
    /// next finer one, with a floor of 64; triangles beyond that allowance
    /// are charged on top of the highest LOD.
    #[must_use]
    pub fn est_tris_for_streaming_cost(&self) -> f32 {
        let mut charged = self.est_tris[NUM_LODS - 1];
        let mut allowed = charged;
        for lod in (0..NUM_LODS - 1).rev() {
            let est = self.est_tris[lod];
            allowed = (allowed / 2.0).max(MIN_STREAMING_TRIANGLES).min(est);
            let excess = est - allowed;
            if excess > 0.0 {
                charged += excess;
            }
        }
        charged
    }

    #[must_use]
    pub fn radius_based_streaming_cost(&self, radius: f32) -> f32 {
        self.radius_weighted_tris(radius) / self.triangle_budget as f32 * MAX_RADIUS_COST
    }

    #[must_use]
    pub fn triangle_based_streaming_cost(&self) -> f32 {
        TRIANGLE_COST * self.est_tris_for_streaming_cost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrepo_decode::BlockInfo;
    use proptest::prelude::*;

    fn params() -> CostParams {
        CostParams::default()
    }

    #[test]
    fn test_sizes_cascade_from_finer_lods() {
        let data = CostData::new([0, 0, 0, 4000], &params());
        assert_eq!(data.size_by_lod(0), 4000);
        assert_eq!(data.size_by_lod(2), 4000);

        let data = CostData::new([100, 0, 2000, 4000], &params());
        assert_eq!(data.size_by_lod(1), 2000);
        assert_eq!(data.size_by_lod(0), 100);
        assert_eq!(data.size_by_lod(7), 0);
        assert_eq!(data.size_total(), 100 + 2000 + 2000 + 4000);
    }

    #[test]
    fn test_minimum_size_floor() {
        // 100 bytes minus a 384 byte discount floors at 16 bytes, one triangle.
        let data = CostData::new([100, 100, 100, 100], &params());
        assert!((data.est_tris_by_lod(0) - 1.0).abs() < f32::EPSILON);
        assert!((data.est_tris_max() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_triangle_estimate() {
        let data = CostData::new([400, 800, 1600, 16_384], &params());
        assert!((data.est_tris_by_lod(3) - 1000.0).abs() < 1e-3);
        assert!((data.est_tris_max() - 1000.0).abs() < 1e-3);
        assert!(data.est_tris_by_lod(9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_streaming_cost_charges_oversized_lower_lods() {
        // All LODs equal: each lower LOD exceeds half of the one above it.
        let data = CostData::new([16_384; 4], &params());
        let charged = data.est_tris_for_streaming_cost();
        // 1000 + (1000 - 500) + (1000 - 250) + (1000 - 125)
        assert!((charged - 3125.0).abs() < 1e-2);
        assert!((data.triangle_based_streaming_cost() - 3125.0 * 1.5e-3).abs() < 1e-4);
    }

    #[test]
    fn test_from_header_requires_lowest_lod() {
        let mut header = MeshHeader::new(1);
        header.header_size = 64;
        header.set_block(BlockKind::HighLod, BlockInfo::new(0, 1000));
        assert!(CostData::from_header(&header, 999, &params()).is_none());

        header.set_block(BlockKind::LowestLod, BlockInfo::new(1000, 200));
        assert!(CostData::from_header(&header, 999, &params()).is_some());
        assert!(CostData::from_header(&header, 0, &params()).is_none());
        assert!(CostData::from_header(&MeshHeader::not_found(), 999, &params()).is_none());
    }

    #[test]
    fn test_small_radius_is_dominated_by_lowest_lod() {
        let data = CostData::new([400, 4000, 40_000, 400_000], &params());
        let tiny = data.radius_weighted_tris(0.01);
        let huge = data.radius_weighted_tris(200.0);
        assert!(tiny < data.est_tris_by_lod(1));
        assert!(huge > data.est_tris_by_lod(2));
        assert!(data.radius_based_streaming_cost(200.0) > data.radius_based_streaming_cost(0.01));
    }

    proptest! {
        #[test]
        fn test_weighted_tris_bounded(
            sizes in prop::array::uniform4(0u32..1_000_000),
            radius in 0.0f32..1000.0,
        ) {
            let data = CostData::new(sizes, &params());
            let weighted = data.radius_weighted_tris(radius);
            let min = data.est_tris.iter().copied().fold(f32::MAX, f32::min);
            prop_assert!(weighted >= min * 0.999);
            prop_assert!(weighted <= data.est_tris_max() * 1.001);
        }

        #[test]
        fn test_estimates_follow_lod_order(mut sizes in prop::array::uniform4(0u32..1_000_000)) {
            sizes.sort_unstable();
            let data = CostData::new(sizes, &params());
            for lod in 0..NUM_LODS - 1 {
                prop_assert!(data.size_by_lod(lod) <= data.size_by_lod(lod + 1));
                prop_assert!(data.est_tris_by_lod(lod) <= data.est_tris_by_lod(lod + 1));
            }
        }

        #[test]
        fn test_streaming_cost_at_least_highest_lod(sizes in prop::array::uniform4(0u32..1_000_000)) {
            let data = CostData::new(sizes, &params());
            prop_assert!(data.est_tris_for_streaming_cost() >= data.est_tris_by_lod(3));
        }
    }
}
