//! Convex decomposition of triangle meshes.
//!
//! - [`hull`]: incremental 3-D convex hull and hull-mesh construction
//! - [`decomposer`]: the stage-based decomposition interface and the built-in
//!   [`HullDecomposer`]
//! - [`worker`]: the background thread that runs decomposition requests

pub mod decomposer;
pub mod hull;
pub mod worker;

pub use decomposer::{
    ConvexDecomposer, DecomposeError, HullDecomposer, ParamDesc, ParamValue, STAGE_DECOMPOSE,
    STAGE_SINGLE_HULL, StageDesc,
};
pub use hull::{ConvexHull, HullError, build_hull_meshes, convex_hull};
pub use worker::{DecompCallback, DecompRequest, PhysicsDecomposer};
