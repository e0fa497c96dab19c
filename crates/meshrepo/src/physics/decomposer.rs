//! Stage-based convex decomposition interface.

use std::collections::HashMap;

use glam::Vec3;
use meshrepo_decode::PhysicsMesh;
use meshrepo_decode::decomposition::MAX_HULL_POINTS;

use super::hull::{ConvexHull, HullError, convex_hull, limit_points};

/// Stage producing one hull per connected island of the mesh.
pub const STAGE_DECOMPOSE: &str = "decompose";
/// Stage producing a single hull around the whole mesh.
pub const STAGE_SINGLE_HULL: &str = "single_hull";

/// A named stage parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Enum(i32),
    Bool(bool),
}

impl ParamValue {
    fn type_name(self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Enum(_) => "enum",
            Self::Bool(_) => "bool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamDesc {
    pub name: &'static str,
    pub default: ParamValue,
}

/// A stage and the parameters it reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageDesc {
    pub name: &'static str,
    pub params: &'static [ParamDesc],
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecomposeError {
    #[error("no mesh has been set")]
    NoMesh,
    #[error("unknown stage {0:?}")]
    UnknownStage(String),
    #[error("unknown parameter {0:?}")]
    UnknownParam(String),
    #[error("parameter {name:?} expects a {expected} value")]
    WrongType { name: String, expected: &'static str },
    #[error(transparent)]
    Hull(#[from] HullError),
}

/// The call interface of a convex decomposition library.
///
/// One instance is owned by the worker thread and reused across requests:
/// set the mesh, apply parameters, execute a stage, then read back hulls.
pub trait ConvexDecomposer: Send {
    fn stages(&self) -> &[StageDesc];

    /// Load a triangle mesh, discarding the results of any previous stage.
    fn set_mesh(&mut self, positions: &[Vec3], indices: &[u32]);

    /// # Errors
    ///
    /// Fails for parameter names no stage knows, or a value of the wrong type.
    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), DecomposeError>;

    /// # Errors
    ///
    /// Fails for unknown stages, a missing mesh, or input that yields no hull.
    fn execute_stage(&mut self, stage: &str) -> Result<(), DecomposeError>;

    /// Point sets produced by the last successful stage.
    fn hulls(&self) -> &[Vec<Vec3>];

    /// Renderable mesh of one produced hull.
    fn hull_mesh(&self, index: usize) -> Option<PhysicsMesh>;
}

const SKIN_WIDTH: ParamDesc = ParamDesc {
    name: "skin_width",
    default: ParamValue::Float(0.0),
};

const DECOMPOSE_PARAMS: &[ParamDesc] = &[
    ParamDesc {
        name: "max_hulls",
        default: ParamValue::Int(8),
    },
    SKIN_WIDTH,
];

const SINGLE_HULL_PARAMS: &[ParamDesc] = &[SKIN_WIDTH];

const STAGES: &[StageDesc] = &[
    StageDesc {
        name: STAGE_DECOMPOSE,
        params: DECOMPOSE_PARAMS,
    },
    StageDesc {
        name: STAGE_SINGLE_HULL,
        params: SINGLE_HULL_PARAMS,
    },
];

/// Built-in decomposer based on [`convex_hull`].
///
/// `decompose` hulls each connected island of triangles separately, merging
/// the smallest islands when there are more than `max_hulls`.
#[derive(Debug, Default)]
pub struct HullDecomposer {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
    params: HashMap<&'static str, ParamValue>,
    points: Vec<Vec<Vec3>>,
    shapes: Vec<ConvexHull>,
}

impl HullDecomposer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn param(&self, desc: &ParamDesc) -> ParamValue {
        self.params.get(desc.name).copied().unwrap_or(desc.default)
    }

    fn max_hulls(&self) -> usize {
        match self.param(&DECOMPOSE_PARAMS[0]) {
            ParamValue::Int(n) => usize::try_from(n).unwrap_or(1).max(1),
            _ => 1,
        }
    }

    fn skin_width(&self) -> f32 {
        match self.param(&SKIN_WIDTH) {
            ParamValue::Float(w) => w,
            _ => 0.0,
        }
    }

    /// Vertex sets of triangles connected through shared indices, largest first.
    fn islands(&self) -> Vec<Vec<Vec3>> {
        fn root(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut parent: Vec<usize> = (0..self.positions.len()).collect();
        let mut used = vec![false; self.positions.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| i as usize);
            if a.max(b).max(c) >= self.positions.len() {
                continue;
            }
            for (x, y) in [(a, b), (b, c)] {
                let (rx, ry) = (root(&mut parent, x), root(&mut parent, y));
                parent[rx] = ry;
            }
            used[a] = true;
            used[b] = true;
            used[c] = true;
        }

        let mut groups: HashMap<usize, Vec<Vec3>> = HashMap::new();
        for (i, position) in self.positions.iter().enumerate() {
            if used[i] {
                groups.entry(root(&mut parent, i)).or_default().push(*position);
            }
        }
        let mut islands: Vec<Vec<Vec3>> = groups.into_values().collect();
        islands.sort_by_key(|island| std::cmp::Reverse(island.len()));
        islands
    }

    fn finish(&mut self, hulls: Vec<ConvexHull>) -> Result<(), DecomposeError> {
        if hulls.is_empty() {
            return Err(HullError::Degenerate.into());
        }
        let width = self.skin_width();
        for mut hull in hulls {
            if width > 0.0 || hull.points.len() > MAX_HULL_POINTS {
                let centre = hull.points.iter().copied().sum::<Vec3>() / hull.points.len() as f32;
                let grown: Vec<Vec3> = hull
                    .points
                    .iter()
                    .map(|p| *p + (*p - centre).normalize_or_zero() * width)
                    .collect();
                if let Ok(rebuilt) = convex_hull(&limit_points(grown, MAX_HULL_POINTS)) {
                    hull = rebuilt;
                }
            }
            self.points.push(hull.points.clone());
            self.shapes.push(hull);
        }
        Ok(())
    }
}

impl ConvexDecomposer for HullDecomposer {
    fn stages(&self) -> &[StageDesc] {
        STAGES
    }

    fn set_mesh(&mut self, positions: &[Vec3], indices: &[u32]) {
        self.positions = positions.to_vec();
        self.indices = indices.to_vec();
        self.points.clear();
        self.shapes.clear();
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), DecomposeError> {
        let desc = STAGES
            .iter()
            .flat_map(|stage| stage.params)
            .find(|desc| desc.name == name)
            .ok_or_else(|| DecomposeError::UnknownParam(name.to_string()))?;
        if std::mem::discriminant(&desc.default) != std::mem::discriminant(&value) {
            return Err(DecomposeError::WrongType {
                name: name.to_string(),
                expected: desc.default.type_name(),
            });
        }
        self.params.insert(desc.name, value);
        Ok(())
    }

    fn execute_stage(&mut self, stage: &str) -> Result<(), DecomposeError> {
        if self.positions.is_empty() {
            return Err(DecomposeError::NoMesh);
        }
        self.points.clear();
        self.shapes.clear();

        match stage {
            STAGE_SINGLE_HULL => {
                let hull = convex_hull(&self.positions)?;
                self.finish(vec![hull])
            }
            STAGE_DECOMPOSE => {
                let mut islands = self.islands();
                let max_hulls = self.max_hulls();
                if islands.len() > max_hulls {
                    let rest: Vec<Vec3> = islands.drain(max_hulls - 1..).flatten().collect();
                    islands.push(rest);
                }
                let hulls = islands
                    .iter()
                    .filter_map(|island| convex_hull(island).ok())
                    .collect();
                self.finish(hulls)
            }
            other => Err(DecomposeError::UnknownStage(other.to_string())),
        }
    }

    fn hulls(&self) -> &[Vec<Vec3>] {
        &self.points
    }

    fn hull_mesh(&self, index: usize) -> Option<PhysicsMesh> {
        self.shapes.get(index).map(ConvexHull::to_mesh)
    }
}
