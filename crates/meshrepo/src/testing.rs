//! Shared fixtures for unit tests: an in-process transport, asset builders
//! and a recording consumer.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use meshrepo_decode::{
    AssetBlocks, BlockKind, Decomposition, EncodedAsset, MeshVolume, SkinInfo, VolumeFace,
    write_asset,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::transport::{HttpResponse, ResponseFuture, Transport};
use crate::types::{AssetId, MeshConsumer};

pub const BASE_URL: &str = "http://assets.test/mesh";

const WAIT: Duration = Duration::from_secs(5);

/// Serves registered assets by `mesh_id`, honoring byte ranges.
#[derive(Default)]
pub struct MockTransport {
    assets: Mutex<HashMap<AssetId, Vec<u8>>>,
    /// Statuses forced onto the next GETs, in order.
    failures: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<(Option<AssetId>, Range<u64>)>>,
    posts: Mutex<Vec<(String, Vec<u8>)>>,
    post_responses: Mutex<VecDeque<HttpResponse>>,
    /// When set, each GET waits for a permit before answering.
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: AssetId, bytes: Vec<u8>) {
        self.assets.lock().insert(asset, bytes);
    }

    pub fn fail_next(&self, status: u16) {
        self.failures.lock().push_back(status);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests_for(&self, asset: AssetId) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(id, _)| *id == Some(asset))
            .count()
    }

    /// Asset of each GET, in request order.
    pub fn requested_assets(&self) -> Vec<Option<AssetId>> {
        self.requests.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Hold every later GET until a permit is added to the returned gate.
    pub fn hold_gets(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn respond_to_post(&self, response: HttpResponse) {
        self.post_responses.lock().push_back(response);
    }

    pub fn posts(&self) -> Vec<(String, Vec<u8>)> {
        self.posts.lock().clone()
    }
}

fn asset_in(url: &str) -> Option<AssetId> {
    url.rsplit_once("mesh_id=")?.1.parse().ok()
}

impl Transport for MockTransport {
    fn get_range(&self, url: &str, range: Range<u64>) -> ResponseFuture<'_> {
        let asset = asset_in(url);
        self.requests.lock().push((asset, range.clone()));

        let response = if let Some(status) = self.failures.lock().pop_front() {
            HttpResponse::new(status, Vec::new())
        } else {
            match asset.and_then(|id| self.assets.lock().get(&id).cloned()) {
                Some(bytes) => {
                    let end = (range.end as usize).min(bytes.len());
                    let start = (range.start as usize).min(end);
                    HttpResponse::new(206, bytes[start..end].to_vec())
                }
                None => HttpResponse::new(404, Vec::new()),
            }
        };
        let gate = self.gate.lock().clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.acquire().await.map(|permit| permit.forget()).ok();
            }
            Ok(response)
        })
    }

    fn post(&self, url: &str, _content_type: &str, body: Vec<u8>) -> ResponseFuture<'_> {
        self.posts.lock().push((url.to_string(), body));
        let response = self
            .post_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| HttpResponse::new(500, Vec::new()));
        Box::pin(async move { Ok(response) })
    }
}

/// A unit quad scaled by `scale`, two triangles.
pub fn quad(scale: f32) -> MeshVolume {
    MeshVolume::new(vec![VolumeFace {
        positions: vec![
            Vec3::ZERO,
            Vec3::X * scale,
            Vec3::new(scale, scale, 0.0),
            Vec3::Y * scale,
        ],
        indices: vec![0, 1, 2, 0, 2, 3],
        ..VolumeFace::default()
    }])
}

/// A unit cube, twelve triangles.
pub fn cube() -> MeshVolume {
    let positions = (0..8)
        .map(|i| Vec3::new((i & 1) as f32, ((i >> 1) & 1) as f32, ((i >> 2) & 1) as f32))
        .collect();
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 1, 2, 3,
        4, 5, 6, 5, 7, 6,
        0, 1, 4, 1, 5, 4,
        2, 6, 3, 3, 6, 7,
        0, 4, 2, 2, 4, 6,
        1, 3, 5, 3, 7, 5,
    ];
    MeshVolume::new(vec![VolumeFace {
        positions,
        indices,
        ..VolumeFace::default()
    }])
}

/// An asset with a quad at each listed LOD.
pub fn sample_asset(lods: &[usize]) -> EncodedAsset {
    let mut blocks = AssetBlocks::default();
    for &lod in lods {
        blocks.lods[lod] = Some(quad(1.0 + lod as f32));
    }
    write_asset(&blocks).unwrap()
}

/// An asset with every block present.
pub fn full_asset() -> EncodedAsset {
    let blocks = AssetBlocks {
        lods: [Some(quad(1.0)), Some(quad(2.0)), Some(quad(3.0)), Some(cube())],
        skin: Some(SkinInfo::default()),
        decomposition: Some(Decomposition {
            hulls: vec![cube().faces[0].positions.clone()],
            ..Decomposition::default()
        }),
        physics_shape: Some(cube()),
    };
    write_asset(&blocks).unwrap()
}

/// Spin until `condition` holds, panicking after a few seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Next value from a result queue, panicking after a few seconds.
pub fn recv_within<T>(rx: &async_channel::Receiver<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(value) = rx.try_recv() {
            return value;
        }
        assert!(Instant::now() < deadline, "nothing received in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Loaded(AssetId, usize),
    Unavailable(AssetId, usize),
    Skin(AssetId),
    Decomposition(AssetId),
    BlockUnavailable(AssetId, BlockKind),
}

/// Consumer that records every callback.
pub struct Recorder {
    pub radius: f32,
    pub distance: f32,
    pub events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new(radius: f32, distance: f32) -> Arc<Self> {
        Arc::new(Self {
            radius,
            distance,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn has(&self, event: &Event) -> bool {
        self.events.lock().contains(event)
    }
}

impl MeshConsumer for Recorder {
    fn bounding_radius(&self) -> f32 {
        self.radius
    }

    fn distance_to_viewer(&self) -> f32 {
        self.distance
    }

    fn on_mesh_loaded(&self, asset: AssetId, lod: usize, _volume: &Arc<MeshVolume>) {
        self.events.lock().push(Event::Loaded(asset, lod));
    }

    fn on_mesh_unavailable(&self, asset: AssetId, lod: usize) {
        self.events.lock().push(Event::Unavailable(asset, lod));
    }

    fn on_skin_loaded(&self, asset: AssetId, _skin: &Arc<SkinInfo>) {
        self.events.lock().push(Event::Skin(asset));
    }

    fn on_decomposition_loaded(&self, asset: AssetId, _decomposition: &Arc<Decomposition>) {
        self.events.lock().push(Event::Decomposition(asset));
    }

    fn on_block_unavailable(&self, asset: AssetId, block: BlockKind) {
        self.events.lock().push(Event::BlockUnavailable(asset, block));
    }
}
