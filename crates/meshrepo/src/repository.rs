//! The consumer-facing repository.
//!
//! [`MeshRepository`] is the single point of contact for consumers. It keeps
//! the long-lived in-memory caches (loaded LODs, skins, decompositions),
//! tracks which consumers wait on which `(asset, lod)`, and decides which
//! pending LOD requests the fetch engine sees each tick.
//!
//! All installation into those caches happens in
//! [`MeshRepository::notify_loaded_meshes`], which the host calls once per
//! tick. Consumer callbacks run at the end of that call with no repository
//! lock held, so a callback may call back into the repository.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use meshrepo_decode::{BlockKind, Decomposition, MeshHeader, MeshVolume, NUM_LODS, SkinInfo};
use parking_lot::Mutex;

use crate::cache::{FilesystemCache, MemoryCache, MeshCache};
use crate::config::RepositoryConfig;
use crate::cost::{ANIMATED_OBJECT_BASE_COST, CostData, CostParams};
use crate::error::Result;
use crate::fetch::{EngineResults, FetchEngine};
use crate::physics::{ConvexDecomposer, DecompRequest, HullDecomposer, PhysicsDecomposer};
use crate::stats::RepositoryStats;
use crate::transport::{HttpTransport, Transport};
use crate::types::{AssetId, ConsumerRef, same_consumer};
use crate::upload::{Delivery, UploadId, UploadObserver, UploadRequest, Uploads};

/// Resolve the LOD to actually load from a header.
///
/// The requested level is clamped to `0..=3`. If it has no data, lower
/// levels are searched first, then higher ones. Returns `None` when the
/// asset is missing, its version is unsupported, or no level has data.
#[must_use]
pub fn actual_lod(header: &MeshHeader, lod: usize, max_version: i32) -> Option<usize> {
    if !header.is_usable(max_version) {
        return None;
    }
    let lod = lod.min(NUM_LODS - 1);
    let has_data = |l: usize| header.lod_size(l) > 0;
    if has_data(lod) {
        return Some(lod);
    }
    (0..lod)
        .rev()
        .find(|&l| has_data(l))
        .or_else(|| (lod + 1..NUM_LODS).find(|&l| has_data(l)))
}

/// Request priority: how large an object appears to its closest consumer.
fn score(consumers: &[ConsumerRef]) -> f32 {
    consumers
        .iter()
        .map(|c| c.bounding_radius() / c.distance_to_viewer().max(1.0))
        .fold(0.0, f32::max)
}

fn add_listener(listeners: &mut Vec<ConsumerRef>, consumer: &ConsumerRef) {
    if !listeners.iter().any(|c| same_consumer(c, consumer)) {
        listeners.push(consumer.clone());
    }
}

/// A callback to make once the state lock is released.
enum Notification {
    Loaded {
        consumers: Vec<ConsumerRef>,
        asset: AssetId,
        lod: usize,
        volume: Arc<MeshVolume>,
    },
    Unavailable {
        consumers: Vec<ConsumerRef>,
        asset: AssetId,
        lod: usize,
    },
    Skin {
        consumers: Vec<ConsumerRef>,
        asset: AssetId,
        skin: Arc<SkinInfo>,
    },
    Decomposition {
        consumers: Vec<ConsumerRef>,
        asset: AssetId,
        decomposition: Arc<Decomposition>,
    },
    BlockUnavailable {
        consumers: Vec<ConsumerRef>,
        asset: AssetId,
        block: BlockKind,
    },
}

impl Notification {
    fn deliver(self) {
        match self {
            Self::Loaded {
                consumers,
                asset,
                lod,
                volume,
            } => {
                for consumer in consumers {
                    consumer.on_mesh_loaded(asset, lod, &volume);
                }
            }
            Self::Unavailable {
                consumers,
                asset,
                lod,
            } => {
                for consumer in consumers {
                    consumer.on_mesh_unavailable(asset, lod);
                }
            }
            Self::Skin {
                consumers,
                asset,
                skin,
            } => {
                for consumer in consumers {
                    consumer.on_skin_loaded(asset, &skin);
                }
            }
            Self::Decomposition {
                consumers,
                asset,
                decomposition,
            } => {
                for consumer in consumers {
                    consumer.on_decomposition_loaded(asset, &decomposition);
                }
            }
            Self::BlockUnavailable {
                consumers,
                asset,
                block,
            } => {
                for consumer in consumers {
                    consumer.on_block_unavailable(asset, block);
                }
            }
        }
    }
}

/// Main-thread bookkeeping, guarded by one lock.
#[derive(Default)]
struct State {
    /// Consumers waiting on each `(asset, lod)`.
    loading: HashMap<(AssetId, usize), Vec<ConsumerRef>>,
    /// Loads not yet handed to the fetch engine.
    pending: Vec<(AssetId, usize)>,
    volumes: HashMap<(AssetId, usize), Arc<MeshVolume>>,

    skins: HashMap<AssetId, Arc<SkinInfo>>,
    skin_listeners: HashMap<AssetId, Vec<ConsumerRef>>,
    loading_skins: HashSet<AssetId>,
    pending_skins: HashSet<AssetId>,

    decompositions: HashMap<AssetId, Arc<Decomposition>>,
    decomposition_listeners: HashMap<AssetId, Vec<ConsumerRef>>,
    loading_decompositions: HashSet<AssetId>,
    pending_decompositions: HashSet<AssetId>,
    loading_physics: HashSet<AssetId>,
    pending_physics: HashSet<AssetId>,

    /// Skin, decomposition and physics-shape fetches that finished, with or
    /// without data. These are not fetched again.
    settled: HashSet<(AssetId, BlockKind)>,

    /// Notifications for already-cached data, sent on the next tick.
    deferred: Vec<Notification>,
}

impl State {
    fn has_triangles(&self, asset: AssetId, lod: usize) -> bool {
        self.volumes
            .get(&(asset, lod))
            .is_some_and(|v| v.triangle_count() > 0)
    }

    fn decomposition_consumers(&mut self, asset: AssetId) -> Vec<ConsumerRef> {
        let still_loading =
            self.loading_decompositions.contains(&asset) || self.loading_physics.contains(&asset);
        if still_loading {
            self.decomposition_listeners
                .get(&asset)
                .cloned()
                .unwrap_or_default()
        } else {
            self.decomposition_listeners
                .remove(&asset)
                .unwrap_or_default()
        }
    }

    fn finish_block(&mut self, asset: AssetId, block: BlockKind) {
        self.settled.insert((asset, block));
        match block {
            BlockKind::Skin => {
                self.loading_skins.remove(&asset);
            }
            BlockKind::PhysicsConvex => {
                self.loading_decompositions.remove(&asset);
            }
            BlockKind::PhysicsMesh => {
                self.loading_physics.remove(&asset);
            }
            _ => {}
        }
    }
}

/// Streams, caches and decomposes mesh assets for registered consumers.
pub struct MeshRepository {
    engine: FetchEngine,
    results: EngineResults,
    physics: PhysicsDecomposer,
    state: Mutex<State>,
    uploads: Mutex<Uploads>,
    cost_params: CostParams,
}

impl MeshRepository {
    /// Create a repository with the built-in hull decomposer.
    pub fn new(
        config: RepositoryConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MeshCache>,
        asset_url: impl Into<String>,
    ) -> Result<Self> {
        Self::with_decomposer(
            config,
            transport,
            cache,
            asset_url,
            Box::new(HullDecomposer::new()),
        )
    }

    /// Create a repository whose worker runs `decomposer`.
    pub fn with_decomposer(
        config: RepositoryConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MeshCache>,
        asset_url: impl Into<String>,
        decomposer: Box<dyn ConvexDecomposer>,
    ) -> Result<Self> {
        let cost_params = CostParams::from(&config);
        let (engine, results) = FetchEngine::spawn(config, transport, cache, asset_url.into())?;
        let physics = PhysicsDecomposer::spawn(decomposer)?;
        let uploads = Uploads::new(engine.transport(), engine.runtime());
        tracing::info!("mesh repository started");

        Ok(Self {
            engine,
            results,
            physics,
            state: Mutex::new(State::default()),
            uploads: Mutex::new(uploads),
            cost_params,
        })
    }

    /// Create a repository with an HTTP transport and the cache named by the
    /// configuration: a directory cache when `cache_dir` is set, else a memory
    /// cache capped at `memory_cache_size` bytes.
    pub fn from_config(config: RepositoryConfig, asset_url: impl Into<String>) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.request_timeout)?);
        let cache: Arc<dyn MeshCache> = match &config.cache_dir {
            Some(dir) => Arc::new(FilesystemCache::new(dir)?),
            None => Arc::new(MemoryCache::with_max_size(config.memory_cache_size)),
        };
        Self::new(config, transport, cache, asset_url)
    }

    #[must_use]
    pub fn config(&self) -> &RepositoryConfig {
        self.engine.config()
    }

    /// Change the asset service base URL. An empty URL fails every fetch.
    pub fn set_asset_url(&self, url: &str) {
        self.engine.set_asset_url(url);
    }

    /// Register `consumer` for `lod` of `asset` and return the LOD to show now.
    ///
    /// The consumer is told through [`crate::MeshConsumer::on_mesh_loaded`] or
    /// [`crate::MeshConsumer::on_mesh_unavailable`] once the LOD resolves.
    /// Meanwhile the returned LOD is, in order of preference: the requested
    /// one if already loaded, `previous_lod` if loaded, the nearest loaded
    /// lower LOD, the nearest loaded higher LOD, or the requested LOD when
    /// nothing is loaded.
    pub fn load_mesh(
        &self,
        consumer: &ConsumerRef,
        asset: AssetId,
        lod: usize,
        previous_lod: Option<usize>,
    ) -> usize {
        let lod = lod.min(NUM_LODS - 1);
        let mut state = self.state.lock();

        if let Some(volume) = state.volumes.get(&(asset, lod)).cloned() {
            state.deferred.push(Notification::Loaded {
                consumers: vec![consumer.clone()],
                asset,
                lod,
                volume,
            });
            return lod;
        }

        if let Some(listeners) = state.loading.get_mut(&(asset, lod)) {
            add_listener(listeners, consumer);
        } else {
            state.loading.insert((asset, lod), vec![consumer.clone()]);
            state.pending.push((asset, lod));
        }

        if let Some(previous) = previous_lod
            && state.has_triangles(asset, previous)
        {
            return previous;
        }
        (0..lod)
            .rev()
            .chain(lod + 1..NUM_LODS)
            .find(|&l| state.has_triangles(asset, l))
            .unwrap_or(lod)
    }

    /// Remove `consumer` from every listener list.
    pub fn unregister_mesh(&self, consumer: &ConsumerRef) {
        let mut state = self.state.lock();
        let retain = |listeners: &mut Vec<ConsumerRef>| {
            listeners.retain(|c| !same_consumer(c, consumer));
            !listeners.is_empty()
        };
        state.loading.retain(|_, listeners| retain(listeners));
        state.skin_listeners.retain(|_, listeners| retain(listeners));
        state
            .decomposition_listeners
            .retain(|_, listeners| retain(listeners));
    }

    /// A loaded LOD, if present in the in-memory cache.
    #[must_use]
    pub fn get_mesh(&self, asset: AssetId, lod: usize) -> Option<Arc<MeshVolume>> {
        self.state.lock().volumes.get(&(asset, lod)).cloned()
    }

    /// Skin info for `asset`, fetching it if unknown.
    ///
    /// `consumer`, if given, hears about the skin when it arrives.
    pub fn get_skin_info(
        &self,
        asset: AssetId,
        consumer: Option<&ConsumerRef>,
    ) -> Option<Arc<SkinInfo>> {
        let mut state = self.state.lock();
        if let Some(skin) = state.skins.get(&asset) {
            return Some(skin.clone());
        }
        if state.settled.contains(&(asset, BlockKind::Skin)) {
            return None;
        }
        if let Some(consumer) = consumer {
            add_listener(state.skin_listeners.entry(asset).or_default(), consumer);
        }
        if !state.loading_skins.contains(&asset) {
            state.pending_skins.insert(asset);
        }
        None
    }

    /// The asset's decomposition record, fetching the server decomposition
    /// when no base hull is known yet.
    pub fn get_decomposition(
        &self,
        asset: AssetId,
        consumer: Option<&ConsumerRef>,
    ) -> Option<Arc<Decomposition>> {
        let mut state = self.state.lock();
        let current = state.decompositions.get(&asset).cloned();
        let needs_fetch = current.as_ref().is_none_or(|d| d.base_hull.is_empty())
            && !state.settled.contains(&(asset, BlockKind::PhysicsConvex));
        if needs_fetch {
            if let Some(consumer) = consumer {
                add_listener(
                    state.decomposition_listeners.entry(asset).or_default(),
                    consumer,
                );
            }
            if !state.loading_decompositions.contains(&asset) {
                state.pending_decompositions.insert(asset);
            }
        }
        current
    }

    /// Fetch the physics shape block if it has not been loaded.
    pub fn fetch_physics_shape(&self, asset: AssetId, consumer: Option<&ConsumerRef>) {
        let mut state = self.state.lock();
        let has_shape = state
            .decompositions
            .get(&asset)
            .is_some_and(|d| !d.physics_shape_mesh.is_empty());
        if has_shape || state.settled.contains(&(asset, BlockKind::PhysicsMesh)) {
            return;
        }
        if let Some(consumer) = consumer {
            add_listener(
                state.decomposition_listeners.entry(asset).or_default(),
                consumer,
            );
        }
        if !state.loading_physics.contains(&asset) {
            state.pending_physics.insert(asset);
        }
    }

    /// Whether the asset has a dedicated physics shape or convex hulls.
    pub fn has_physics_shape(&self, asset: AssetId) -> bool {
        if self
            .engine
            .header(asset)
            .is_some_and(|h| h.block(BlockKind::PhysicsMesh).size > 0)
        {
            return true;
        }
        self.get_decomposition(asset, None)
            .is_some_and(|d| d.has_hulls())
    }

    /// The parsed header, once known.
    #[must_use]
    pub fn get_mesh_header(&self, asset: AssetId) -> Option<Arc<MeshHeader>> {
        self.engine.header(asset)
    }

    /// See [`actual_lod`]. When no level has data the asset is marked
    /// missing. An unknown header returns the clamped request unchanged.
    pub fn get_actual_mesh_lod(&self, asset: AssetId, lod: usize) -> Option<usize> {
        let Some(header) = self.engine.header(asset) else {
            return Some(lod.min(NUM_LODS - 1));
        };
        let actual = actual_lod(&header, lod, self.config().max_mesh_version);
        if actual.is_none() && header.is_usable(self.config().max_mesh_version) {
            tracing::debug!(asset = %asset, "no LOD has data, marking missing");
            self.engine.mark_missing(asset);
        }
        actual
    }

    /// Declared byte size of a LOD, or `None` while the header is unknown or
    /// the asset is missing.
    #[must_use]
    pub fn get_mesh_size(&self, asset: AssetId, lod: usize) -> Option<u32> {
        self.engine
            .header(asset)
            .filter(|h| !h.not_found)
            .map(|h| h.lod_size(lod))
    }

    #[must_use]
    pub fn get_mesh_cost_data(&self, asset: AssetId) -> Option<CostData> {
        let header = self.engine.header(asset)?;
        CostData::from_header(&header, self.config().max_mesh_version, &self.cost_params)
    }

    /// Radius-based streaming cost.
    #[must_use]
    pub fn get_streaming_cost(&self, asset: AssetId, radius: f32) -> Option<f32> {
        self.get_mesh_cost_data(asset)
            .map(|data| data.radius_based_streaming_cost(radius))
    }

    /// Triangle-based streaming cost, plus the animated-object base cost.
    #[must_use]
    pub fn get_streaming_cost_by_triangles(&self, asset: AssetId, animated: bool) -> Option<f32> {
        self.get_mesh_cost_data(asset).map(|data| {
            let cost = data.triangle_based_streaming_cost();
            if animated {
                cost + ANIMATED_OBJECT_BASE_COST
            } else {
                cost
            }
        })
    }

    #[must_use]
    pub fn get_est_triangles_max(&self, asset: AssetId) -> Option<f32> {
        self.get_mesh_cost_data(asset).map(|data| data.est_tris_max())
    }

    /// Queue a decomposition. Its callback runs during a later tick.
    pub fn submit_decomposition(&self, request: DecompRequest) -> Result<()> {
        self.physics.submit(request)
    }

    /// Package `request` and ask `fee_url` for a fee quote.
    pub fn request_upload_quote(
        &self,
        request: UploadRequest,
        fee_url: &str,
        observer: Arc<dyn UploadObserver>,
    ) -> Result<UploadId> {
        self.uploads
            .lock()
            .start(request, fee_url, observer, &self.physics)
    }

    /// Commit an upload that has received its fee quote.
    pub fn commit_upload(&self, id: UploadId) -> Result<()> {
        self.uploads.lock().commit(id)
    }

    /// Abandon an upload, typically one whose fee quote was declined.
    pub fn cancel_upload(&self, id: UploadId) -> Result<()> {
        self.uploads.lock().cancel(id)
    }

    #[must_use]
    pub fn stats(&self) -> RepositoryStats {
        self.engine.stats()
    }

    /// Requests waiting for admission to the fetch engine.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether any load, block fetch or upload is still outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        !state.loading.is_empty()
            || !state.loading_skins.is_empty()
            || !state.loading_decompositions.is_empty()
            || !state.loading_physics.is_empty()
            || !state.pending_skins.is_empty()
            || !state.pending_decompositions.is_empty()
            || !state.pending_physics.is_empty()
            || self.uploads.lock().len() > 0
    }

    /// Install finished work, schedule new requests and notify consumers.
    ///
    /// Call once per tick from the thread that owns the consumers.
    pub fn notify_loaded_meshes(&self) {
        let (notifications, deliveries) = {
            let mut state = self.state.lock();
            let mut notifications = std::mem::take(&mut state.deferred);
            self.drain_results(&mut state, &mut notifications);
            self.forward_block_requests(&mut state);
            self.schedule(&mut state);
            (notifications, self.uploads.lock().poll())
        };

        for notification in notifications {
            notification.deliver();
        }
        self.physics.notify_completed();
        deliveries.into_iter().for_each(Delivery::deliver);
    }

    fn drain_results(&self, state: &mut State, notifications: &mut Vec<Notification>) {
        while let Ok(loaded) = self.results.loaded.try_recv() {
            let key = (loaded.asset, loaded.lod);
            let volume = state
                .volumes
                .entry(key)
                .or_insert_with(|| Arc::new(loaded.volume))
                .clone();
            let consumers = state.loading.remove(&key).unwrap_or_default();
            notifications.push(Notification::Loaded {
                consumers,
                asset: loaded.asset,
                lod: loaded.lod,
                volume,
            });
        }

        while let Ok((asset, lod)) = self.results.unavailable.try_recv() {
            let consumers = state.loading.remove(&(asset, lod)).unwrap_or_default();
            notifications.push(Notification::Unavailable {
                consumers,
                asset,
                lod,
            });
        }

        while let Ok((asset, skin)) = self.results.skins.try_recv() {
            let skin = Arc::new(skin);
            state.skins.insert(asset, skin.clone());
            state.finish_block(asset, BlockKind::Skin);
            let consumers = state.skin_listeners.remove(&asset).unwrap_or_default();
            notifications.push(Notification::Skin {
                consumers,
                asset,
                skin,
            });
        }

        while let Ok((asset, block, decomposition)) = self.results.decompositions.try_recv() {
            let mut merged = state
                .decompositions
                .get(&asset)
                .map(|d| Decomposition::clone(d))
                .unwrap_or_default();
            merged.merge(decomposition);
            let merged = Arc::new(merged);
            state.decompositions.insert(asset, merged.clone());
            state.finish_block(asset, block);
            let consumers = state.decomposition_consumers(asset);
            notifications.push(Notification::Decomposition {
                consumers,
                asset,
                decomposition: merged,
            });
        }

        while let Ok((asset, block)) = self.results.missing_blocks.try_recv() {
            state.finish_block(asset, block);
            let consumers = match block {
                BlockKind::Skin => state.skin_listeners.remove(&asset).unwrap_or_default(),
                _ => state.decomposition_consumers(asset),
            };
            notifications.push(Notification::BlockUnavailable {
                consumers,
                asset,
                block,
            });
        }
    }

    fn forward_block_requests(&self, state: &mut State) {
        for asset in std::mem::take(&mut state.pending_skins) {
            if state.loading_skins.insert(asset) {
                self.engine.request_skin(asset);
            }
        }
        for asset in std::mem::take(&mut state.pending_decompositions) {
            if state.loading_decompositions.insert(asset) {
                self.engine.request_decomposition(asset);
            }
        }
        for asset in std::mem::take(&mut state.pending_physics) {
            if state.loading_physics.insert(asset) {
                self.engine.request_physics_shape(asset);
            }
        }
    }

    /// Admit the highest-priority pending loads, up to the free request slots.
    fn schedule(&self, state: &mut State) {
        // Nobody is waiting on these any more.
        let loading = &state.loading;
        state.pending.retain(|key| loading.contains_key(key));

        let free = self
            .config()
            .max_concurrent_requests
            .saturating_sub(self.engine.active_requests());
        let count = free.min(state.pending.len());
        if count == 0 {
            return;
        }

        let scores: HashMap<(AssetId, usize), f32> = state
            .pending
            .iter()
            .map(|key| (*key, state.loading.get(key).map_or(0.0, |c| score(c))))
            .collect();
        let by_score = |a: &(AssetId, usize), b: &(AssetId, usize)| scores[b].total_cmp(&scores[a]);
        if count < state.pending.len() {
            state.pending.select_nth_unstable_by(count - 1, by_score);
        }
        let mut admitted: Vec<(AssetId, usize)> = state.pending.drain(..count).collect();
        admitted.sort_by(by_score);

        for (asset, lod) in admitted {
            tracing::debug!(asset = %asset, lod, score = scores[&(asset, lod)], "admitting load");
            self.engine.request_lod(asset, lod);
        }
    }

    /// Stop the fetch engine and the decomposition worker.
    ///
    /// Requests still in flight are abandoned. Also happens on drop.
    pub fn shutdown(&mut self) {
        self.engine.shutdown();
        self.physics.shutdown();
        tracing::info!("mesh repository stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meshrepo_decode::{BlockInfo, Llsd};
    use proptest::prelude::*;

    use super::*;
    use crate::cache::NoCache;
    use crate::testing::{
        BASE_URL, Event, MockTransport, Recorder, full_asset, sample_asset, wait_until,
    };
    use crate::transport::HttpResponse;
    use crate::upload::{FeeQuote, ModelInstance, UploadError, UploadModel};

    fn repository(transport: &Arc<MockTransport>, config: RepositoryConfig) -> MeshRepository {
        MeshRepository::new(config, transport.clone(), Arc::new(NoCache), BASE_URL).unwrap()
    }

    fn pump_until(repo: &MeshRepository, mut condition: impl FnMut() -> bool) {
        wait_until(|| {
            repo.notify_loaded_meshes();
            condition()
        });
    }

    fn header_with(sizes: [u32; NUM_LODS]) -> MeshHeader {
        let mut header = MeshHeader::new(1);
        header.header_size = 100;
        let mut offset = 0;
        for (lod, size) in sizes.into_iter().enumerate() {
            if size > 0 {
                header.set_block(BlockKind::from_lod(lod).unwrap(), BlockInfo::new(offset, size));
                offset += size;
            }
        }
        header
    }

    #[test]
    fn test_actual_lod_searches_down_first() {
        let header = header_with([0, 500, 0, 1000]);
        assert_eq!(actual_lod(&header, 2, 999), Some(1));
        assert_eq!(actual_lod(&header, 3, 999), Some(3));
        assert_eq!(actual_lod(&header, 0, 999), Some(1));
        assert_eq!(actual_lod(&header, 9, 999), Some(3));

        let header = header_with([0, 0, 0, 1000]);
        assert_eq!(actual_lod(&header, 2, 999), Some(3));
    }

    #[test]
    fn test_actual_lod_missing() {
        assert_eq!(actual_lod(&header_with([0; 4]), 2, 999), None);
        assert_eq!(actual_lod(&MeshHeader::not_found(), 2, 999), None);
        assert_eq!(actual_lod(&header_with([10; 4]), 2, 0), None);
    }

    proptest! {
        #[test]
        fn test_actual_lod_has_data(
            sizes in prop::array::uniform4(prop_oneof![Just(0u32), 1u32..10_000]),
            lod in 0usize..6,
        ) {
            let header = header_with(sizes);
            match actual_lod(&header, lod, 999) {
                Some(actual) => prop_assert!(sizes[actual] > 0),
                None => prop_assert!(sizes.iter().all(|&s| s == 0)),
            }
        }
    }

    #[test]
    fn test_shared_load_notifies_each_consumer_once() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0, 3]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let first = Recorder::new(1.0, 10.0);
        let second = Recorder::new(2.0, 5.0);
        let (a, b): (ConsumerRef, ConsumerRef) = (first.clone(), second.clone());
        assert_eq!(repo.load_mesh(&a, asset, 3, None), 3);
        assert_eq!(repo.load_mesh(&b, asset, 3, None), 3);
        // Registering twice does not double-notify.
        repo.load_mesh(&a, asset, 3, None);

        pump_until(&repo, || !first.events().is_empty() && !second.events().is_empty());
        repo.notify_loaded_meshes();

        assert_eq!(first.events(), vec![Event::Loaded(asset, 3)]);
        assert_eq!(second.events(), vec![Event::Loaded(asset, 3)]);
        assert_eq!(repo.get_mesh(asset, 3).unwrap().triangle_count(), 2);
        // One header fetch and one LOD fetch.
        assert_eq!(transport.requests_for(asset), 2);
    }

    #[test]
    fn test_fallback_prefers_lower_lods() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0, 3]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        repo.load_mesh(&consumer, asset, 0, None);
        repo.load_mesh(&consumer, asset, 3, None);
        pump_until(&repo, || recorder.events().len() == 2);

        assert_eq!(repo.load_mesh(&consumer, asset, 2, None), 0);
        assert_eq!(repo.load_mesh(&consumer, asset, 1, Some(3)), 3);
        assert_eq!(repo.load_mesh(&consumer, asset, 2, Some(2)), 0);

        // LOD 2 is not in the asset.
        pump_until(&repo, || recorder.has(&Event::Unavailable(asset, 2)));
    }

    #[test]
    fn test_cached_lod_is_delivered_next_tick() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[1]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let first = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = first.clone();
        repo.load_mesh(&consumer, asset, 1, None);
        pump_until(&repo, || !first.events().is_empty());

        let later = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = later.clone();
        assert_eq!(repo.load_mesh(&consumer, asset, 1, None), 1);
        repo.notify_loaded_meshes();
        assert_eq!(later.events(), vec![Event::Loaded(asset, 1)]);
        assert_eq!(transport.requests_for(asset), 2);
    }

    #[test]
    fn test_missing_asset_is_unavailable() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let repo = repository(&transport, RepositoryConfig::default());

        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        repo.load_mesh(&consumer, asset, 2, None);
        pump_until(&repo, || recorder.has(&Event::Unavailable(asset, 2)));

        assert_eq!(repo.get_mesh_size(asset, 2), None);
        assert_eq!(repo.get_actual_mesh_lod(asset, 2), None);
        assert!(repo.get_mesh_cost_data(asset).is_none());

        repo.load_mesh(&consumer, asset, 1, None);
        pump_until(&repo, || recorder.has(&Event::Unavailable(asset, 1)));
        assert_eq!(transport.requests_for(asset), 1);
    }

    #[test]
    fn test_actual_lod_marks_missing() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        assert_eq!(repo.get_actual_mesh_lod(asset, 2), Some(2));
        repo.load_mesh(&consumer, asset, 2, None);
        pump_until(&repo, || recorder.has(&Event::Unavailable(asset, 2)));

        assert_eq!(repo.get_actual_mesh_lod(asset, 2), None);
        assert!(repo.get_mesh_header(asset).unwrap().not_found);
    }

    #[test]
    fn test_closest_largest_is_admitted_first() {
        let transport = Arc::new(MockTransport::new());
        let near = AssetId::new_random();
        let far = AssetId::new_random();
        transport.insert(near, sample_asset(&[3]).bytes);
        transport.insert(far, sample_asset(&[3]).bytes);
        let config = RepositoryConfig {
            max_concurrent_requests: 1,
            ..RepositoryConfig::default()
        };
        let repo = repository(&transport, config);

        let small = Recorder::new(0.5, 100.0);
        let large = Recorder::new(4.0, 2.0);
        let (s, l): (ConsumerRef, ConsumerRef) = (small.clone(), large.clone());
        repo.load_mesh(&s, far, 3, None);
        repo.load_mesh(&l, near, 3, None);

        repo.notify_loaded_meshes();
        assert_eq!(repo.pending_requests(), 1);

        pump_until(&repo, || !small.events().is_empty() && !large.events().is_empty());
        assert_eq!(transport.requested_assets()[0], Some(near));
    }

    #[test]
    fn test_unregistered_consumer_is_not_notified() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let gone = Recorder::new(1.0, 1.0);
        let stays = Recorder::new(1.0, 1.0);
        let (g, s): (ConsumerRef, ConsumerRef) = (gone.clone(), stays.clone());
        repo.load_mesh(&g, asset, 0, None);
        repo.load_mesh(&s, asset, 0, None);
        repo.unregister_mesh(&g);

        pump_until(&repo, || !stays.events().is_empty());
        assert!(gone.events().is_empty());
    }

    #[test]
    fn test_skin_and_decomposition() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, full_asset().bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        assert!(repo.get_skin_info(asset, Some(&consumer)).is_none());
        assert!(repo.get_decomposition(asset, Some(&consumer)).is_none());
        repo.fetch_physics_shape(asset, Some(&consumer));
        repo.load_mesh(&consumer, asset, 0, None);

        pump_until(&repo, || {
            recorder.has(&Event::Skin(asset))
                && recorder
                    .events()
                    .iter()
                    .filter(|e| **e == Event::Decomposition(asset))
                    .count()
                    == 2
        });

        assert!(repo.get_skin_info(asset, None).is_some());
        let decomposition = repo.get_decomposition(asset, None).unwrap();
        assert_eq!(decomposition.hulls.len(), 1);
        assert_eq!(decomposition.hull_meshes.len(), 1);
        assert!(!decomposition.base_hull.is_empty());
        assert!(!decomposition.physics_shape_mesh.is_empty());
        assert!(repo.has_physics_shape(asset));

        // Nothing is fetched again.
        let requests = transport.request_count();
        repo.get_decomposition(asset, None);
        repo.fetch_physics_shape(asset, None);
        repo.get_skin_info(asset, None);
        repo.notify_loaded_meshes();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.request_count(), requests);
        assert!(!repo.is_busy());
    }

    #[test]
    fn test_missing_skin_is_reported() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        repo.get_skin_info(asset, Some(&consumer));
        repo.load_mesh(&consumer, asset, 0, None);
        pump_until(&repo, || recorder.has(&Event::BlockUnavailable(asset, BlockKind::Skin)));

        assert!(repo.get_skin_info(asset, Some(&consumer)).is_none());
        assert!(!repo.has_physics_shape(asset));
    }

    #[test]
    fn test_cost_queries() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let encoded = full_asset();
        transport.insert(asset, encoded.bytes);
        let repo = repository(&transport, RepositoryConfig::default());

        assert!(repo.get_streaming_cost(asset, 1.0).is_none());
        let recorder = Recorder::new(1.0, 1.0);
        let consumer: ConsumerRef = recorder.clone();
        repo.load_mesh(&consumer, asset, 0, None);
        pump_until(&repo, || !recorder.events().is_empty());

        assert_eq!(
            repo.get_mesh_size(asset, 3),
            Some(encoded.header.lod_size(3))
        );
        let plain = repo.get_streaming_cost_by_triangles(asset, false).unwrap();
        let animated = repo.get_streaming_cost_by_triangles(asset, true).unwrap();
        assert!((animated - plain - ANIMATED_OBJECT_BASE_COST).abs() < 1e-4);
        assert!(repo.get_streaming_cost(asset, 2.0).unwrap() > 0.0);
        assert!(repo.get_est_triangles_max(asset).unwrap() >= 1.0);
    }

    #[derive(Default)]
    struct Quotes(Mutex<Vec<UploadId>>);

    impl UploadObserver for Quotes {
        fn on_fee_quoted(&self, id: UploadId, _quote: &FeeQuote) {
            self.0.lock().push(id);
        }

        fn on_upload_failed(&self, _id: UploadId, _error: &UploadError) {}
    }

    #[test]
    fn test_cancelled_upload_leaves_repository_idle() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_to_post(HttpResponse::new(
            200,
            Llsd::map()
                .with("state", "upload")
                .with("uploader", "http://upload.test/commit")
                .with("upload_price", 10)
                .to_binary(),
        ));
        let repo = repository(&transport, RepositoryConfig::default());
        let request = UploadRequest {
            name: "box".into(),
            models: vec![UploadModel {
                name: "box".into(),
                lods: [None, None, None, Some(crate::testing::cube())],
                instances: vec![ModelInstance::default()],
                ..UploadModel::default()
            }],
            ..UploadRequest::default()
        };

        let quotes = Arc::new(Quotes::default());
        let id = repo
            .request_upload_quote(request, "http://upload.test/fee", quotes.clone())
            .unwrap();
        pump_until(&repo, || !quotes.0.lock().is_empty());
        assert!(repo.is_busy());

        repo.cancel_upload(id).unwrap();
        assert!(!repo.is_busy());
        assert!(repo.commit_upload(id).is_err());
        assert_eq!(transport.posts().len(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let mut repo = repository(&transport, RepositoryConfig::default());
        repo.shutdown();
        repo.shutdown();
        assert!(repo.submit_decomposition(DecompRequest::from_volume("decompose", &crate::testing::cube())).is_err());
    }
}
