//! Identifiers and consumer-facing types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use meshrepo_decode::{BlockKind, Decomposition, MeshVolume, SkinInfo};
use uuid::Uuid;

pub use meshrepo_decode::NUM_LODS;

/// Opaque 128-bit identifier of one mesh asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(Uuid);

impl AssetId {
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// A fresh random identifier.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AssetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Something that renders meshes and wants to hear when they arrive.
///
/// Callbacks run on the thread that calls
/// [`crate::MeshRepository::notify_loaded_meshes`], never on a network or
/// worker thread, and never while repository locks are held.
pub trait MeshConsumer: Send + Sync {
    /// Bounding radius, used for request priority.
    fn bounding_radius(&self) -> f32;

    /// Distance from the viewer, used for request priority.
    fn distance_to_viewer(&self) -> f32;

    fn on_mesh_loaded(&self, asset: AssetId, lod: usize, volume: &Arc<MeshVolume>);

    /// The LOD could not be loaded; keep using whatever is already shown.
    fn on_mesh_unavailable(&self, asset: AssetId, lod: usize);

    fn on_skin_loaded(&self, asset: AssetId, skin: &Arc<SkinInfo>) {
        let _ = (asset, skin);
    }

    /// A server decomposition or physics shape was merged into the asset's
    /// decomposition record.
    fn on_decomposition_loaded(&self, asset: AssetId, decomposition: &Arc<Decomposition>) {
        let _ = (asset, decomposition);
    }

    /// A skin, decomposition or physics shape block could not be loaded.
    fn on_block_unavailable(&self, asset: AssetId, block: BlockKind) {
        let _ = (asset, block);
    }
}

/// Shared handle to a consumer. Identity is pointer identity.
pub type ConsumerRef = Arc<dyn MeshConsumer>;

pub(crate) fn same_consumer(a: &ConsumerRef, b: &ConsumerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
