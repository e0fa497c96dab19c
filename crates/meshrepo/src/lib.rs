//! Background streaming, caching and decomposition of mesh assets.
//!
//! A [`MeshRepository`] sits between rendering consumers and a remote asset
//! service. Consumers ask for a level of detail; the repository fetches the
//! asset header and the needed block by HTTP byte range, keeps a local cache
//! of raw bytes, and tells each consumer when its mesh is ready. It also
//! fetches skin and physics blocks, runs convex decompositions on a worker
//! thread, estimates streaming cost from headers, and uploads authored
//! models.
//!
//! # Design principles
//!
//! - **Main-thread delivery**: Network and worker threads only enqueue
//!   results; everything consumers see happens in
//!   [`MeshRepository::notify_loaded_meshes`]
//! - **Pluggable edges**: [`Transport`], [`MeshCache`] and
//!   [`physics::ConvexDecomposer`] are traits
//! - **Bounded traffic**: Requests are rate-limited, capped in flight and
//!   deduplicated per asset
//!
//! # Example
//!
//! ```ignore
//! use meshrepo::{MeshRepository, RepositoryConfig};
//!
//! let repo = MeshRepository::from_config(RepositoryConfig::default(), "https://assets.example/mesh")?;
//! let shown = repo.load_mesh(&consumer, asset, 3, None);
//!
//! // Once per frame.
//! repo.notify_loaded_meshes();
//! ```

pub mod cache;
mod config;
pub mod cost;
mod error;
mod fetch;
pub mod physics;
mod repository;
mod stats;
mod transport;
mod types;
pub mod upload;

#[cfg(test)]
mod testing;

pub use cache::{FilesystemCache, MemoryCache, MeshCache, NoCache};
pub use config::RepositoryConfig;
pub use cost::{ANIMATED_OBJECT_BASE_COST, CostData, CostParams};
pub use error::{Error, Result};
pub use repository::{MeshRepository, actual_lod};
pub use stats::RepositoryStats;
pub use transport::{HttpResponse, HttpTransport, LLSD_BINARY_CONTENT_TYPE, ResponseFuture, Transport};
pub use types::{AssetId, ConsumerRef, MeshConsumer, NUM_LODS};
pub use upload::{
    FaceMaterial, FeeQuote, ModelInstance, Permissions, UploadError, UploadId, UploadModel,
    UploadObserver, UploadPhase, UploadReceipt, UploadRequest,
};

// Re-export decode types for convenience.
pub use meshrepo_decode::{
    BlockKind, Decomposition, MeshHeader, MeshVolume, PhysicsMesh, SkinInfo, VolumeFace,
};
