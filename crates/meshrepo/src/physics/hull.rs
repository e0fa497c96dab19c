//! Incremental 3-D convex hull.

use std::collections::HashSet;

use glam::Vec3;
use meshrepo_decode::{Decomposition, PhysicsMesh};
use meshrepo_decode::decomposition::MAX_HULL_POINTS;

/// Why a hull could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HullError {
    #[error("a hull needs at least four points, got {0}")]
    TooFewPoints(usize),
    /// All points are coincident, collinear or coplanar.
    #[error("points do not span a volume")]
    Degenerate,
}

/// A closed convex polyhedron.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvexHull {
    /// Hull vertices only; interior input points are dropped.
    pub points: Vec<Vec3>,
    /// Outward-facing triangles indexing `points`.
    pub triangles: Vec<[usize; 3]>,
}

impl ConvexHull {
    /// Triangle soup with face normals, for rendering and collision.
    #[must_use]
    pub fn to_mesh(&self) -> PhysicsMesh {
        let mut mesh = PhysicsMesh::default();
        for [a, b, c] in &self.triangles {
            mesh.push_triangle(self.points[*a], self.points[*b], self.points[*c]);
        }
        mesh
    }
}

#[derive(Debug, Clone)]
struct Face {
    v: [usize; 3],
    normal: Vec3,
    offset: f32,
}

impl Face {
    /// Build a face oriented away from `inside`.
    fn new(points: &[Vec3], a: usize, b: usize, c: usize, inside: Vec3) -> Self {
        let (pa, pb, pc) = (points[a], points[b], points[c]);
        let mut v = [a, b, c];
        let mut normal = (pb - pa).cross(pc - pa).normalize_or_zero();
        if normal.dot(inside - pa) > 0.0 {
            v.swap(1, 2);
            normal = -normal;
        }
        Self {
            v,
            normal,
            offset: normal.dot(pa),
        }
    }

    fn distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) - self.offset
    }
}

/// Compute the convex hull of a point cloud.
///
/// # Errors
///
/// Fails on fewer than four points or when the points do not span a volume.
pub fn convex_hull(points: &[Vec3]) -> Result<ConvexHull, HullError> {
    if points.len() < 4 {
        return Err(HullError::TooFewPoints(points.len()));
    }

    let (lo, hi) = points.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(lo, hi), p| (lo.min(*p), hi.max(*p)),
    );
    let eps = (hi - lo).max_element().max(f32::MIN_POSITIVE) * 1e-5;

    // Initial simplex: an extreme point, the farthest point from it, the
    // farthest from that line, and the farthest from that plane.
    let a = (0..points.len())
        .min_by(|&i, &j| points[i].x.total_cmp(&points[j].x))
        .ok_or(HullError::TooFewPoints(0))?;
    let b = farthest(points, |p| p.distance(points[a]));
    if points[b].distance(points[a]) <= eps {
        return Err(HullError::Degenerate);
    }
    let axis = (points[b] - points[a]).normalize();
    let c = farthest(points, |p| (p - points[a]).cross(axis).length());
    if (points[c] - points[a]).cross(axis).length() <= eps {
        return Err(HullError::Degenerate);
    }
    let plane = (points[b] - points[a])
        .cross(points[c] - points[a])
        .normalize();
    let d = farthest(points, |p| plane.dot(p - points[a]).abs());
    if plane.dot(points[d] - points[a]).abs() <= eps {
        return Err(HullError::Degenerate);
    }

    let inside = (points[a] + points[b] + points[c] + points[d]) / 4.0;
    let mut faces = vec![
        Face::new(points, a, b, c, inside),
        Face::new(points, a, b, d, inside),
        Face::new(points, a, c, d, inside),
        Face::new(points, b, c, d, inside),
    ];

    for (i, &p) in points.iter().enumerate() {
        if i == a || i == b || i == c || i == d {
            continue;
        }

        let (visible, hidden): (Vec<Face>, Vec<Face>) =
            faces.into_iter().partition(|f| f.distance(p) > eps);
        faces = hidden;
        if visible.is_empty() {
            continue;
        }

        // Horizon edges are directed edges of visible faces whose twin is not
        // also on a visible face.
        let edges: HashSet<(usize, usize)> = visible
            .iter()
            .flat_map(|f| [(f.v[0], f.v[1]), (f.v[1], f.v[2]), (f.v[2], f.v[0])])
            .collect();
        for &(e0, e1) in &edges {
            if !edges.contains(&(e1, e0)) {
                faces.push(Face::new(points, e0, e1, i, inside));
            }
        }
    }

    // Compact to the vertices actually used.
    let mut remap = vec![usize::MAX; points.len()];
    let mut hull = ConvexHull::default();
    for face in &faces {
        let mut tri = [0; 3];
        for (slot, &v) in tri.iter_mut().zip(&face.v) {
            if remap[v] == usize::MAX {
                remap[v] = hull.points.len();
                hull.points.push(points[v]);
            }
            *slot = remap[v];
        }
        hull.triangles.push(tri);
    }
    Ok(hull)
}

fn farthest(points: &[Vec3], metric: impl Fn(Vec3) -> f32) -> usize {
    let mut best = 0;
    let mut best_value = f32::MIN;
    for (i, p) in points.iter().enumerate() {
        let value = metric(*p);
        if value > best_value {
            best = i;
            best_value = value;
        }
    }
    best
}

/// The eight corners of an axis-aligned box.
#[must_use]
pub fn box_hull(min: Vec3, max: Vec3) -> Vec<Vec3> {
    (0..8)
        .map(|i| {
            Vec3::new(
                if i & 1 == 0 { min.x } else { max.x },
                if i & 2 == 0 { min.y } else { max.y },
                if i & 4 == 0 { min.z } else { max.z },
            )
        })
        .collect()
}

/// Thin a point set down to at most `limit` points by even striding.
#[must_use]
pub fn limit_points(points: Vec<Vec3>, limit: usize) -> Vec<Vec3> {
    if points.len() <= limit || limit == 0 {
        return points;
    }
    let step = points.len() as f32 / limit as f32;
    (0..limit)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = (i as f32 * step) as usize;
            points[index.min(points.len() - 1)]
        })
        .collect()
}

/// Fill in the renderable meshes of a decoded decomposition.
///
/// Hulls that cannot be triangulated get an empty mesh. A missing base hull
/// is replaced by the hull of every hull point.
pub fn build_hull_meshes(decomposition: &mut Decomposition) {
    decomposition.hull_meshes = decomposition
        .hulls
        .iter()
        .map(|hull| convex_hull(hull).map(|h| h.to_mesh()).unwrap_or_default())
        .collect();

    if decomposition.base_hull.is_empty() && decomposition.has_hulls() {
        let all: Vec<Vec3> = decomposition.hulls.iter().flatten().copied().collect();
        if let Ok(hull) = convex_hull(&all) {
            decomposition.base_hull = limit_points(hull.points, MAX_HULL_POINTS);
        }
    }

    decomposition.base_hull_mesh = convex_hull(&decomposition.base_hull)
        .map(|h| h.to_mesh())
        .unwrap_or_default();
}
