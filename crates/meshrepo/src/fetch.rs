//! The fetch engine.
//!
//! A dedicated thread owns the header and LOD request queues, the pending-LOD
//! map and the skin, decomposition and physics-shape request sets. Each pass
//! it admits queued requests under a per-second budget and a concurrency cap,
//! consulting the local cache before issuing any HTTP request.
//!
//! Responses complete on a small tokio runtime. Blocks are parsed there,
//! written back to the cache, and the parsed results are pushed onto result
//! channels that the repository drains on its own tick. Completion is then
//! reported to the engine thread so it can release in-flight markers or
//! schedule a retry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use meshrepo_decode::{
    BlockKind, Decomposition, MeshHeader, MeshVolume, NUM_LODS, SkinInfo, decode_decomposition,
    decode_physics_shape, decode_skin, decode_volume, parse_header,
};
use parking_lot::{Mutex, RwLock};

use crate::cache::MeshCache;
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::physics::build_hull_meshes;
use crate::stats::{RepositoryStats, Stats};
use crate::transport::{Classified, HttpResponse, Transport, classify};
use crate::types::AssetId;

/// Bytes checked when deciding whether a cached block was ever written.
const VALIDATION_PREFIX: usize = 1024;

/// What a request fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FetchKind {
    Header,
    Lod(usize),
    Skin,
    Decomposition,
    PhysicsShape,
}

impl FetchKind {
    fn block(self) -> Option<BlockKind> {
        match self {
            Self::Header => None,
            Self::Lod(lod) => BlockKind::from_lod(lod),
            Self::Skin => Some(BlockKind::Skin),
            Self::Decomposition => Some(BlockKind::PhysicsConvex),
            Self::PhysicsShape => Some(BlockKind::PhysicsMesh),
        }
    }

    /// Header and LOD fetches count against the request budget and cap.
    fn is_budgeted(self) -> bool {
        matches!(self, Self::Header | Self::Lod(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Resolved, either with data or as unavailable.
    Done,
    /// Transient failure; schedule again after the retry delay.
    Retry,
    /// Hard failure; already reported where applicable.
    Failed,
}

enum Command {
    Header(AssetId),
    Lod(AssetId, usize),
    Block(AssetId, FetchKind),
    Completed {
        asset: AssetId,
        kind: FetchKind,
        outcome: Outcome,
    },
    Shutdown,
}

/// A queued header or LOD fetch.
#[derive(Debug)]
struct Request {
    asset: AssetId,
    kind: FetchKind,
    delay: Duration,
    enqueued: Instant,
}

impl Request {
    fn new(asset: AssetId, kind: FetchKind, delay: Duration) -> Self {
        Self {
            asset,
            kind,
            delay,
            enqueued: Instant::now(),
        }
    }

    fn ready(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued) >= self.delay
    }
}

/// A decoded geometry LOD.
#[derive(Debug)]
pub(crate) struct LoadedMesh {
    pub asset: AssetId,
    pub lod: usize,
    pub volume: MeshVolume,
}

/// Receiving ends of the engine's result queues.
pub(crate) struct EngineResults {
    pub loaded: async_channel::Receiver<LoadedMesh>,
    pub unavailable: async_channel::Receiver<(AssetId, usize)>,
    pub skins: async_channel::Receiver<(AssetId, SkinInfo)>,
    /// Server decompositions and physics shapes, tagged by source block, to
    /// be merged per asset.
    pub decompositions: async_channel::Receiver<(AssetId, BlockKind, Decomposition)>,
    /// Skin, decomposition or physics-shape blocks that could not be loaded.
    pub missing_blocks: async_channel::Receiver<(AssetId, BlockKind)>,
}

struct ResultSenders {
    loaded: async_channel::Sender<LoadedMesh>,
    unavailable: async_channel::Sender<(AssetId, usize)>,
    skins: async_channel::Sender<(AssetId, SkinInfo)>,
    decompositions: async_channel::Sender<(AssetId, BlockKind, Decomposition)>,
    missing_blocks: async_channel::Sender<(AssetId, BlockKind)>,
}

fn result_channels() -> (ResultSenders, EngineResults) {
    let (loaded_tx, loaded_rx) = async_channel::unbounded();
    let (unavailable_tx, unavailable_rx) = async_channel::unbounded();
    let (skins_tx, skins_rx) = async_channel::unbounded();
    let (decompositions_tx, decompositions_rx) = async_channel::unbounded();
    let (missing_tx, missing_rx) = async_channel::unbounded();
    (
        ResultSenders {
            loaded: loaded_tx,
            unavailable: unavailable_tx,
            skins: skins_tx,
            decompositions: decompositions_tx,
            missing_blocks: missing_tx,
        },
        EngineResults {
            loaded: loaded_rx,
            unavailable: unavailable_rx,
            skins: skins_rx,
            decompositions: decompositions_rx,
            missing_blocks: missing_rx,
        },
    )
}

/// State shared by the engine thread, network tasks and the repository.
struct Shared {
    config: RepositoryConfig,
    headers: Mutex<HashMap<AssetId, Arc<MeshHeader>>>,
    cache: Arc<dyn MeshCache>,
    transport: Arc<dyn Transport>,
    asset_url: RwLock<String>,
    warned_no_url: AtomicBool,
    stats: Stats,
    /// Header and LOD requests in flight.
    active: AtomicUsize,
    results: ResultSenders,
    commands: Sender<Command>,
}

impl Shared {
    fn header(&self, asset: AssetId) -> Option<Arc<MeshHeader>> {
        self.headers.lock().get(&asset).cloned()
    }

    fn store_header(&self, asset: AssetId, header: MeshHeader) {
        self.headers.lock().insert(asset, Arc::new(header));
    }

    fn max_version(&self) -> i32 {
        self.config.max_mesh_version
    }

    fn url(&self, asset: AssetId) -> Option<String> {
        let base = self.asset_url.read();
        if base.is_empty() {
            if !self.warned_no_url.swap(true, Ordering::Relaxed) {
                tracing::warn!(asset = %asset, "no asset URL available, cannot load meshes");
            }
            return None;
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        Some(format!("{base}{separator}mesh_id={asset}"))
    }

    fn report(&self, asset: AssetId, kind: FetchKind, outcome: Outcome) {
        if self
            .commands
            .send(Command::Completed {
                asset,
                kind,
                outcome,
            })
            .is_err()
        {
            tracing::debug!(asset = %asset, ?kind, "fetch engine stopped before completion");
        }
    }

    /// Header from the start of the cache slot, if one parses.
    fn cached_header(&self, asset: AssetId) -> Option<MeshHeader> {
        let size = match self.cache.slot_size(asset) {
            Ok(Some(size)) if size > 0 => size,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(asset = %asset, error = %e, "cache lookup failed");
                return None;
            }
        };
        let len = usize::try_from(size.min(u64::from(self.config.header_fetch_bytes))).ok()?;
        let bytes = match self.cache.read(asset, 0, len) {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::warn!(asset = %asset, error = %e, "cache read failed");
                return None;
            }
        };
        Stats::add(&self.stats.cache_reads, 1);
        Stats::add(&self.stats.cache_bytes_read, len as u64);

        match parse_header(&bytes) {
            Ok(header) if !header.not_found => Some(header),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(asset = %asset, error = %e, "cached header unreadable");
                None
            }
        }
    }

    /// Block bytes from the cache slot, if the slot is long enough and the
    /// block looks written.
    fn cached_block(&self, asset: AssetId, header: &MeshHeader, block: BlockKind) -> Option<Vec<u8>> {
        let (start, len) = header.absolute_range(block)?;
        let slot = self.cache.slot_size(asset).ok().flatten()?;
        if slot < start + u64::from(len) {
            return None;
        }
        let bytes = self.cache.read(asset, start, len as usize).ok().flatten()?;
        Stats::add(&self.stats.cache_reads, 1);
        Stats::add(&self.stats.cache_bytes_read, u64::from(len));

        // Reserved but never written.
        if bytes.iter().take(VALIDATION_PREFIX).all(|b| *b == 0) {
            tracing::debug!(asset = %asset, %block, "cached block is empty");
            return None;
        }
        Some(bytes)
    }

    /// Reserve the asset's cache slot and fill it with the header response.
    ///
    /// The slot covers the header plus every declared block. Bytes beyond the
    /// response are zero so unwritten blocks are recognizable.
    fn write_header_slot(&self, asset: AssetId, header: &MeshHeader, mut body: Vec<u8>) {
        let Ok(total) = usize::try_from(header.total_size()) else {
            return;
        };
        body.truncate(total);
        let written = body.len();
        body.resize(total, 0);
        match self.cache.write_slot(asset, body) {
            Ok(()) => {
                Stats::add(&self.stats.cache_writes, 1);
                Stats::add(&self.stats.cache_bytes_written, written as u64);
            }
            Err(e) => tracing::warn!(asset = %asset, error = %e, "failed to cache header"),
        }
    }

    /// Write fetched block bytes into an existing slot.
    fn write_block(&self, asset: AssetId, start: u64, bytes: &[u8]) {
        let fits = matches!(
            self.cache.slot_size(asset),
            Ok(Some(size)) if size >= start + bytes.len() as u64
        );
        if !fits {
            return;
        }
        match self.cache.write_at(asset, start, bytes) {
            Ok(()) => {
                Stats::add(&self.stats.cache_writes, 1);
                Stats::add(&self.stats.cache_bytes_written, bytes.len() as u64);
            }
            Err(e) => tracing::warn!(asset = %asset, error = %e, "failed to cache block"),
        }
    }

    fn header_received(
        &self,
        asset: AssetId,
        url: &str,
        result: Result<HttpResponse>,
        range: &Range<u64>,
    ) -> Outcome {
        match classify(url, result, range, true) {
            Classified::Retry => Outcome::Retry,
            Classified::Failed => Outcome::Failed,
            Classified::NotFound => {
                tracing::info!(asset = %asset, "marking header as non-existent, will not retry");
                self.store_header(asset, MeshHeader::not_found());
                Outcome::Done
            }
            Classified::Data(body) => {
                Stats::add(&self.stats.bytes_received, body.len() as u64);
                match parse_header(&body) {
                    Ok(header) if header.total_size() > self.config.max_asset_size => {
                        tracing::warn!(
                            asset = %asset,
                            size = header.total_size(),
                            limit = self.config.max_asset_size,
                            "mesh header declares an oversized asset"
                        );
                        Outcome::Failed
                    }
                    Ok(header) => {
                        if header.is_usable(self.max_version()) {
                            self.write_header_slot(asset, &header, body);
                        } else if !header.not_found {
                            tracing::warn!(
                                asset = %asset,
                                version = header.version,
                                "unsupported mesh version"
                            );
                        }
                        self.store_header(asset, header);
                        Outcome::Done
                    }
                    Err(e) => {
                        tracing::warn!(asset = %asset, error = %e, "mesh header parse error, not a valid mesh asset");
                        Outcome::Failed
                    }
                }
            }
        }
    }

    /// Parse a block and queue the result. Returns false if it is unusable.
    fn block_received(&self, asset: AssetId, kind: FetchKind, data: &[u8]) -> bool {
        let parsed = match kind {
            FetchKind::Header => return false,
            FetchKind::Lod(lod) => decode_volume(data).map(|volume| {
                if volume.faces.is_empty() {
                    tracing::debug!(asset = %asset, lod, "mesh LOD has no faces");
                    return false;
                }
                let _ = self.results.loaded.try_send(LoadedMesh { asset, lod, volume });
                true
            }),
            FetchKind::Skin => decode_skin(data).map(|skin| {
                let _ = self.results.skins.try_send((asset, skin));
                true
            }),
            FetchKind::Decomposition => decode_decomposition(data).map(|mut decomposition| {
                build_hull_meshes(&mut decomposition);
                let _ = self
                    .results
                    .decompositions
                    .try_send((asset, BlockKind::PhysicsConvex, decomposition));
                true
            }),
            FetchKind::PhysicsShape => decode_physics_shape(data).map(|mesh| {
                let decomposition = Decomposition {
                    physics_shape_mesh: mesh,
                    ..Decomposition::default()
                };
                let _ = self
                    .results
                    .decompositions
                    .try_send((asset, BlockKind::PhysicsMesh, decomposition));
                true
            }),
        };
        parsed.unwrap_or_else(|e| {
            tracing::warn!(asset = %asset, ?kind, error = %e, "mesh block parse error");
            false
        })
    }

    fn block_unavailable(&self, asset: AssetId, kind: FetchKind) {
        match kind {
            FetchKind::Header => {}
            FetchKind::Lod(lod) => {
                let _ = self.results.unavailable.try_send((asset, lod));
            }
            _ => {
                if let Some(block) = kind.block() {
                    let _ = self.results.missing_blocks.try_send((asset, block));
                }
            }
        }
    }
}

async fn fetch_header(shared: Arc<Shared>, asset: AssetId, url: String, range: Range<u64>) {
    let result = shared.transport.get_range(&url, range.clone()).await;
    let outcome = shared.header_received(asset, &url, result, &range);
    shared.report(asset, FetchKind::Header, outcome);
}

async fn fetch_block(
    shared: Arc<Shared>,
    asset: AssetId,
    kind: FetchKind,
    url: String,
    range: Range<u64>,
) {
    let result = shared.transport.get_range(&url, range.clone()).await;
    let outcome = match classify(&url, result, &range, false) {
        Classified::Retry => Outcome::Retry,
        Classified::NotFound | Classified::Failed => {
            shared.block_unavailable(asset, kind);
            Outcome::Failed
        }
        Classified::Data(bytes) => {
            Stats::add(&shared.stats.bytes_received, bytes.len() as u64);
            if shared.block_received(asset, kind, &bytes) {
                shared.write_block(asset, range.start, &bytes);
                Outcome::Done
            } else {
                shared.block_unavailable(asset, kind);
                Outcome::Failed
            }
        }
    };
    shared.report(asset, kind, outcome);
}

/// State owned by the engine thread.
struct Engine {
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    runtime: tokio::runtime::Runtime,
    header_queue: VecDeque<Request>,
    lod_queue: VecDeque<Request>,
    /// LODs awaiting a header, per asset.
    pending_lods: HashMap<AssetId, Vec<usize>>,
    /// Skin, decomposition and physics-shape requests, each with the time
    /// before which it must not be attempted.
    blocks: HashMap<(AssetId, FetchKind), Instant>,
    /// Requests queued or in flight. At most one per asset and kind.
    tracked: HashSet<(AssetId, FetchKind)>,
    window_start: Instant,
    window_count: u32,
    active: usize,
}

impl Engine {
    fn run(mut self) {
        tracing::debug!("fetch engine started");
        'outer: loop {
            let first = if self.has_work() {
                match self.commands.recv_timeout(self.shared.config.poll_interval) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            let mut next = first;
            while let Some(command) = next {
                if !self.handle(command) {
                    break 'outer;
                }
                next = self.commands.try_recv().ok();
            }

            self.run_queues();
            self.run_blocks();
            self.update_stats();
        }
        self.runtime.shutdown_background();
        tracing::debug!("fetch engine stopped");
    }

    fn has_work(&self) -> bool {
        !self.header_queue.is_empty() || !self.lod_queue.is_empty() || !self.blocks.is_empty()
    }

    /// Returns false on shutdown.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Header(asset) => self.request_header(asset),
            Command::Lod(asset, lod) => self.request_lod(asset, lod),
            Command::Block(asset, kind) => {
                if !self.tracked.contains(&(asset, kind)) {
                    self.blocks.entry((asset, kind)).or_insert_with(Instant::now);
                    if self.shared.header(asset).is_none() {
                        self.request_header(asset);
                    }
                }
            }
            Command::Completed {
                asset,
                kind,
                outcome,
            } => self.completed(asset, kind, outcome),
            Command::Shutdown => return false,
        }
        true
    }

    fn request_header(&mut self, asset: AssetId) {
        if let Some(header) = self.shared.header(asset) {
            if header.not_found {
                tracing::debug!(asset = %asset, "asset is known not to exist");
                return;
            }
            if header.is_usable(self.shared.max_version()) {
                self.header_resolved(asset);
                return;
            }
            // Unsupported version: an explicit request may try again.
        }
        if self.tracked.contains(&(asset, FetchKind::Header)) {
            return;
        }
        if let Some(header) = self.shared.cached_header(asset) {
            tracing::debug!(asset = %asset, "header cache hit");
            self.shared.store_header(asset, header);
            self.header_resolved(asset);
            return;
        }
        self.tracked.insert((asset, FetchKind::Header));
        self.header_queue
            .push_back(Request::new(asset, FetchKind::Header, Duration::ZERO));
    }

    fn request_lod(&mut self, asset: AssetId, lod: usize) {
        if lod >= NUM_LODS {
            self.shared.block_unavailable(asset, FetchKind::Lod(lod));
            return;
        }
        match self.shared.header(asset) {
            Some(header) if header.is_usable(self.shared.max_version()) => self.push_lod(asset, lod),
            Some(_) => self.shared.block_unavailable(asset, FetchKind::Lod(lod)),
            None => {
                let pending = self.pending_lods.entry(asset).or_default();
                if !pending.contains(&lod) {
                    pending.push(lod);
                }
                self.request_header(asset);
            }
        }
    }

    fn push_lod(&mut self, asset: AssetId, lod: usize) {
        let kind = FetchKind::Lod(lod);
        if self.tracked.insert((asset, kind)) {
            self.lod_queue
                .push_back(Request::new(asset, kind, Duration::ZERO));
        }
    }

    /// Fan out or fail everything that was waiting on an asset's header.
    fn header_resolved(&mut self, asset: AssetId) {
        let usable = self
            .shared
            .header(asset)
            .is_some_and(|h| h.is_usable(self.shared.max_version()));

        if let Some(lods) = self.pending_lods.remove(&asset) {
            for lod in lods {
                if usable {
                    self.push_lod(asset, lod);
                } else {
                    self.shared.block_unavailable(asset, FetchKind::Lod(lod));
                }
            }
        }

        if !usable {
            let waiting: Vec<(AssetId, FetchKind)> = self
                .blocks
                .keys()
                .filter(|(a, _)| *a == asset)
                .copied()
                .collect();
            for key in waiting {
                self.blocks.remove(&key);
                self.shared.block_unavailable(key.0, key.1);
            }
        }
    }

    fn completed(&mut self, asset: AssetId, kind: FetchKind, outcome: Outcome) {
        if kind.is_budgeted() {
            self.active = self.active.saturating_sub(1);
            self.shared.active.store(self.active, Ordering::Relaxed);
        }

        match outcome {
            Outcome::Retry => {
                Stats::add(&self.shared.stats.http_retries, 1);
                let delay = self.shared.config.header_retry_delay;
                tracing::debug!(asset = %asset, ?kind, ?delay, "timeout or service unavailable, retrying");
                match kind {
                    FetchKind::Header => self.header_queue.push_back(Request::new(asset, kind, delay)),
                    FetchKind::Lod(_) => self.lod_queue.push_back(Request::new(asset, kind, delay)),
                    _ => {
                        self.tracked.remove(&(asset, kind));
                        self.blocks.insert((asset, kind), Instant::now() + delay);
                    }
                }
            }
            Outcome::Done | Outcome::Failed => {
                self.tracked.remove(&(asset, kind));
                if kind == FetchKind::Header {
                    self.header_resolved(asset);
                }
            }
        }
    }

    fn run_queues(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }

        // LOD requests are favoured over header requests.
        let mut lods = std::mem::take(&mut self.lod_queue);
        self.run_queue(&mut lods);
        lods.append(&mut self.lod_queue);
        self.lod_queue = lods;

        let mut headers = std::mem::take(&mut self.header_queue);
        self.run_queue(&mut headers);
        headers.append(&mut self.header_queue);
        self.header_queue = headers;
    }

    fn run_queue(&mut self, queue: &mut VecDeque<Request>) {
        let config = &self.shared.config;
        let (max_per_second, max_active, failure_delay) = (
            config.max_requests_per_second,
            config.max_concurrent_requests,
            config.fetch_failure_delay,
        );

        let now = Instant::now();
        let mut deferred = Vec::new();
        while self.window_count < max_per_second && self.active < max_active {
            let Some(mut request) = queue.pop_front() else {
                break;
            };
            if !request.ready(now) {
                deferred.push(request);
                continue;
            }
            if !self.dispatch(&request) {
                if request.delay.is_zero() {
                    request.delay = failure_delay;
                }
                tracing::info!(
                    asset = %request.asset,
                    delay = ?request.delay,
                    "fetch failed outright, delaying"
                );
                request.enqueued = now;
                deferred.push(request);
            }
        }
        queue.extend(deferred);
    }

    /// Returns false if the request could not be issued and should be retried.
    fn dispatch(&mut self, request: &Request) -> bool {
        let asset = request.asset;
        match request.kind {
            FetchKind::Header => {
                let Some(url) = self.shared.url(asset) else {
                    self.tracked.remove(&(asset, FetchKind::Header));
                    self.header_resolved(asset);
                    return true;
                };
                let range = 0..u64::from(self.shared.config.header_fetch_bytes);
                self.spawn_fetch(asset, FetchKind::Header, url, range);
                true
            }
            FetchKind::Lod(lod) => self.dispatch_lod(asset, lod),
            _ => true,
        }
    }

    fn dispatch_lod(&mut self, asset: AssetId, lod: usize) -> bool {
        let kind = FetchKind::Lod(lod);
        let Some(header) = self.shared.header(asset) else {
            return false;
        };
        let range = BlockKind::from_lod(lod)
            .filter(|_| header.is_usable(self.shared.max_version()))
            .and_then(|block| Some((block, header.absolute_range(block)?)));
        let Some((block, (start, len))) = range else {
            self.finish_unavailable(asset, kind);
            return true;
        };

        if let Some(bytes) = self.shared.cached_block(asset, &header, block)
            && self.shared.block_received(asset, kind, &bytes)
        {
            tracing::debug!(asset = %asset, lod, "LOD cache hit");
            self.tracked.remove(&(asset, kind));
            return true;
        }

        let Some(url) = self.shared.url(asset) else {
            self.finish_unavailable(asset, kind);
            return true;
        };
        self.spawn_fetch(asset, kind, url, start..start + u64::from(len));
        true
    }

    fn finish_unavailable(&mut self, asset: AssetId, kind: FetchKind) {
        self.tracked.remove(&(asset, kind));
        self.shared.block_unavailable(asset, kind);
    }

    fn run_blocks(&mut self) {
        let now = Instant::now();
        let ready: Vec<(AssetId, FetchKind)> = self
            .blocks
            .iter()
            .filter(|(_, not_before)| **not_before <= now)
            .map(|(key, _)| *key)
            .collect();

        for (asset, kind) in ready {
            // Wait for the header.
            let Some(header) = self.shared.header(asset) else {
                continue;
            };
            self.blocks.remove(&(asset, kind));
            self.fetch_block(asset, kind, &header);
        }
    }

    fn fetch_block(&mut self, asset: AssetId, kind: FetchKind, header: &MeshHeader) {
        let Some(block) = kind.block() else {
            return;
        };
        if !header.is_usable(self.shared.max_version()) {
            self.shared.block_unavailable(asset, kind);
            return;
        }

        let Some((start, len)) = header.absolute_range(block) else {
            if kind == FetchKind::PhysicsShape {
                // No physics shape at all; report an empty one.
                self.shared.block_received(asset, kind, &[]);
            } else {
                self.shared.block_unavailable(asset, kind);
            }
            return;
        };

        if let Some(bytes) = self.shared.cached_block(asset, header, block)
            && self.shared.block_received(asset, kind, &bytes)
        {
            tracing::debug!(asset = %asset, %block, "block cache hit");
            return;
        }

        let Some(url) = self.shared.url(asset) else {
            self.shared.block_unavailable(asset, kind);
            return;
        };
        self.tracked.insert((asset, kind));
        self.spawn_fetch(asset, kind, url, start..start + u64::from(len));
    }

    fn spawn_fetch(&mut self, asset: AssetId, kind: FetchKind, url: String, range: Range<u64>) {
        if kind.is_budgeted() {
            self.window_count += 1;
            self.active += 1;
            self.shared.active.store(self.active, Ordering::Relaxed);
        }
        Stats::add(&self.shared.stats.http_requests, 1);
        tracing::debug!(asset = %asset, ?kind, start = range.start, end = range.end, "requesting");

        let shared = self.shared.clone();
        match kind {
            FetchKind::Header => self.runtime.spawn(fetch_header(shared, asset, url, range)),
            _ => self.runtime.spawn(fetch_block(shared, asset, kind, url, range)),
        };
    }

    fn update_stats(&self) {
        let stats = &self.shared.stats;
        let pending: usize = self.pending_lods.values().map(Vec::len).sum();
        let processing = self
            .tracked
            .iter()
            .filter(|(_, kind)| matches!(kind, FetchKind::Lod(_)))
            .count();
        Stats::set(&stats.lod_pending, pending as u64);
        Stats::set(&stats.lod_processing, processing as u64);
    }
}

/// Handle to the engine thread.
pub(crate) struct FetchEngine {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    runtime: tokio::runtime::Handle,
    handle: Option<JoinHandle<()>>,
}

impl FetchEngine {
    /// Start the engine thread and its network runtime.
    pub fn spawn(
        config: RepositoryConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MeshCache>,
        asset_url: String,
    ) -> Result<(Self, EngineResults)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mesh-net")
            .enable_all()
            .build()
            .map_err(|source| Error::Spawn {
                name: "mesh-net",
                source,
            })?;

        let runtime_handle = runtime.handle().clone();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (senders, results) = result_channels();
        let shared = Arc::new(Shared {
            config,
            headers: Mutex::new(HashMap::new()),
            cache,
            transport,
            asset_url: RwLock::new(asset_url),
            warned_no_url: AtomicBool::new(false),
            stats: Stats::default(),
            active: AtomicUsize::new(0),
            results: senders,
            commands: command_tx.clone(),
        });

        let engine = Engine {
            shared: shared.clone(),
            commands: command_rx,
            runtime,
            header_queue: VecDeque::new(),
            lod_queue: VecDeque::new(),
            pending_lods: HashMap::new(),
            blocks: HashMap::new(),
            tracked: HashSet::new(),
            window_start: Instant::now(),
            window_count: 0,
            active: 0,
        };
        let handle = std::thread::Builder::new()
            .name("mesh-fetch".into())
            .spawn(move || engine.run())
            .map_err(|source| Error::Spawn {
                name: "mesh-fetch",
                source,
            })?;

        Ok((
            Self {
                shared,
                commands: command_tx,
                runtime: runtime_handle,
                handle: Some(handle),
            },
            results,
        ))
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("fetch engine stopped, dropping request");
        }
    }

    pub fn request_header(&self, asset: AssetId) {
        self.send(Command::Header(asset));
    }

    pub fn request_lod(&self, asset: AssetId, lod: usize) {
        self.send(Command::Lod(asset, lod));
    }

    pub fn request_skin(&self, asset: AssetId) {
        self.send(Command::Block(asset, FetchKind::Skin));
    }

    pub fn request_decomposition(&self, asset: AssetId) {
        self.send(Command::Block(asset, FetchKind::Decomposition));
    }

    pub fn request_physics_shape(&self, asset: AssetId) {
        self.send(Command::Block(asset, FetchKind::PhysicsShape));
    }

    pub fn header(&self, asset: AssetId) -> Option<Arc<MeshHeader>> {
        self.shared.header(asset)
    }

    /// Handle to the network runtime. Tasks spawned after shutdown never run.
    pub fn runtime(&self) -> tokio::runtime::Handle {
        self.runtime.clone()
    }

    /// Record that no LOD of the asset has data, so it is treated as missing.
    pub fn mark_missing(&self, asset: AssetId) {
        let mut headers = self.shared.headers.lock();
        if let Some(header) = headers.get_mut(&asset)
            && !header.not_found
        {
            Arc::make_mut(header).not_found = true;
        }
    }

    pub fn set_asset_url(&self, url: &str) {
        *self.shared.asset_url.write() = url.to_string();
        self.shared.warned_no_url.store(false, Ordering::Relaxed);
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.shared.transport.clone()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.shared.config
    }

    /// Header and LOD requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RepositoryStats {
        self.shared.stats.snapshot()
    }

    /// Stop the engine thread. Responses still in flight are abandoned.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.send(Command::Shutdown);
            if handle.join().is_err() {
                tracing::error!("fetch engine thread panicked");
            }
        }
    }
}

impl Drop for FetchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{MemoryCache, NoCache};
    use crate::testing::{BASE_URL, MockTransport, recv_within, sample_asset, wait_until};

    fn test_config() -> RepositoryConfig {
        RepositoryConfig {
            header_retry_delay: Duration::from_millis(10),
            ..RepositoryConfig::default()
        }
    }

    fn engine(
        transport: &Arc<MockTransport>,
        cache: Arc<dyn MeshCache>,
    ) -> (FetchEngine, EngineResults) {
        engine_with(transport.clone(), cache, test_config())
    }

    fn engine_with(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn MeshCache>,
        config: RepositoryConfig,
    ) -> (FetchEngine, EngineResults) {
        FetchEngine::spawn(config, transport, cache, BASE_URL.to_string()).unwrap()
    }

    #[test]
    fn test_header_request_is_deduplicated() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0, 3]).bytes);

        let (engine, _results) = engine(&transport, Arc::new(NoCache));
        engine.request_header(asset);
        engine.request_header(asset);
        wait_until(|| engine.header(asset).is_some());
        engine.request_header(asset);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(transport.requests_for(asset), 1);
        assert_eq!(engine.stats().http_requests, 1);
    }

    #[test]
    fn test_not_found_is_permanent() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_lod(asset, 2);
        assert_eq!(recv_within(&results.unavailable), (asset, 2));
        assert!(engine.header(asset).unwrap().not_found);

        for _ in 0..100 {
            engine.request_header(asset);
        }
        engine.request_lod(asset, 1);
        assert_eq!(recv_within(&results.unavailable), (asset, 1));
        assert_eq!(transport.requests_for(asset), 1);
    }

    #[test]
    fn test_lod_waits_for_header() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let encoded = sample_asset(&[0, 1, 2, 3]);
        transport.insert(asset, encoded.bytes);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_lod(asset, 3);
        engine.request_lod(asset, 0);

        let mut lods = vec![recv_within(&results.loaded).lod, recv_within(&results.loaded).lod];
        lods.sort_unstable();
        assert_eq!(lods, vec![0, 3]);
        // One header request plus one per LOD.
        assert_eq!(transport.requests_for(asset), 3);
    }

    #[test]
    fn test_small_asset_is_served_from_header_slot() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let encoded = sample_asset(&[0, 3]);
        assert!(encoded.bytes.len() < 4096);
        transport.insert(asset, encoded.bytes.clone());

        let cache = Arc::new(MemoryCache::new());
        let (engine, results) = engine(&transport, cache.clone());
        engine.request_lod(asset, 3);
        assert_eq!(recv_within(&results.loaded).lod, 3);
        assert_eq!(transport.requests_for(asset), 1);

        // The slot holds the asset exactly as served.
        let slot = cache.read(asset, 0, encoded.bytes.len()).unwrap().unwrap();
        assert_eq!(slot, encoded.bytes);
    }

    #[test]
    fn test_cached_asset_needs_no_network() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let cache = Arc::new(MemoryCache::new());
        cache.write_slot(asset, sample_asset(&[1]).bytes).unwrap();

        let (engine, results) = engine(&transport, cache);
        engine.request_lod(asset, 1);
        assert_eq!(recv_within(&results.loaded).lod, 1);
        assert_eq!(transport.request_count(), 0);
        assert!(engine.stats().cache_reads >= 2);
    }

    #[test]
    fn test_zeroed_cache_block_falls_back_to_network() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let encoded = sample_asset(&[3]);
        transport.insert(asset, encoded.bytes.clone());

        // Header present, block reserved but never written.
        let mut slot = encoded.bytes.clone();
        let header_size = encoded.header.header_size as usize;
        slot[header_size..].fill(0);
        let cache = Arc::new(MemoryCache::new());
        cache.write_slot(asset, slot).unwrap();

        let (engine, results) = engine(&transport, cache.clone());
        engine.request_lod(asset, 3);
        assert_eq!(recv_within(&results.loaded).lod, 3);
        assert_eq!(transport.requests_for(asset), 1);

        // The fetched block was written back into the slot.
        wait_until(|| cache.read(asset, 0, encoded.bytes.len()).unwrap() == Some(encoded.bytes.clone()));
    }

    #[test]
    fn test_retry_after_service_unavailable() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[2]).bytes);
        transport.fail_next(503);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_lod(asset, 2);
        assert_eq!(recv_within(&results.loaded).lod, 2);
        assert_eq!(engine.stats().http_retries, 1);
        assert_eq!(transport.requests_for(asset), 3);
    }

    #[test]
    fn test_unhandled_status_resolves_unavailable() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[2]).bytes);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_header(asset);
        wait_until(|| engine.header(asset).is_some());
        transport.fail_next(403);
        engine.request_lod(asset, 2);
        assert_eq!(recv_within(&results.unavailable), (asset, 2));
    }

    #[test]
    fn test_missing_lod_block_is_unavailable() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_lod(asset, 3);
        assert_eq!(recv_within(&results.unavailable), (asset, 3));
        assert_eq!(transport.requests_for(asset), 1);
    }

    #[test]
    fn test_empty_url_fails_fast() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.set_asset_url("");
        engine.request_lod(asset, 0);
        assert_eq!(recv_within(&results.unavailable), (asset, 0));
        assert_eq!(transport.request_count(), 0);

        // A later URL lets an explicit request through.
        engine.set_asset_url(BASE_URL);
        engine.request_lod(asset, 0);
        assert_eq!(recv_within(&results.loaded).lod, 0);
    }

    #[test]
    fn test_absent_physics_shape_is_empty_not_missing() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);

        let (engine, results) = engine(&transport, Arc::new(NoCache));
        engine.request_physics_shape(asset);
        engine.request_skin(asset);
        engine.request_header(asset);

        let (id, block, decomposition) = recv_within(&results.decompositions);
        assert_eq!(id, asset);
        assert_eq!(block, BlockKind::PhysicsMesh);
        assert!(decomposition.physics_shape_mesh.is_empty());
        assert_eq!(recv_within(&results.missing_blocks), (asset, BlockKind::Skin));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        let encoded = sample_asset(&[3]);
        transport.insert(asset, encoded.bytes);

        let cache = Arc::new(MemoryCache::new());
        let config = RepositoryConfig {
            max_asset_size: encoded.header.total_size() - 1,
            ..test_config()
        };
        let (engine, results) = engine_with(transport.clone(), cache.clone(), config);
        engine.request_lod(asset, 3);
        assert_eq!(recv_within(&results.unavailable), (asset, 3));

        // No slot was reserved and the block was never requested.
        assert!(cache.is_empty());
        assert!(engine.header(asset).is_none());
        assert_eq!(transport.requests_for(asset), 1);
    }

    #[test]
    fn test_in_flight_requests_are_capped() {
        let transport = Arc::new(MockTransport::new());
        let first = AssetId::new_random();
        let second = AssetId::new_random();
        transport.insert(first, sample_asset(&[0]).bytes);
        transport.insert(second, sample_asset(&[0]).bytes);
        let gate = transport.hold_gets();

        let config = RepositoryConfig {
            max_concurrent_requests: 1,
            ..test_config()
        };
        let (engine, _results) = engine_with(transport.clone(), Arc::new(NoCache), config);
        engine.request_header(first);
        engine.request_header(second);

        wait_until(|| transport.request_count() == 1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(engine.active_requests(), 1);

        // Finishing the first request frees the slot for the second.
        gate.add_permits(1);
        wait_until(|| engine.header(first).is_some());
        wait_until(|| transport.request_count() == 2);
        gate.add_permits(1);
        wait_until(|| engine.header(second).is_some());
        assert_eq!(transport.requested_assets(), vec![Some(first), Some(second)]);
    }

    #[test]
    fn test_lod_requests_go_before_headers_when_throttled() {
        let transport = Arc::new(MockTransport::new());
        let first = AssetId::new_random();
        let second = AssetId::new_random();
        transport.insert(first, sample_asset(&[3]).bytes);
        transport.insert(second, sample_asset(&[3]).bytes);

        let config = RepositoryConfig {
            max_requests_per_second: 1,
            ..test_config()
        };
        let (engine, results) = engine_with(transport.clone(), Arc::new(NoCache), config);
        engine.request_header(first);
        wait_until(|| engine.header(first).is_some());

        // The window is spent, so both wait; the LOD goes first even though
        // the header was queued earlier.
        engine.request_header(second);
        engine.request_lod(first, 3);
        assert_eq!(recv_within(&results.loaded).lod, 3);
        wait_until(|| engine.header(second).is_some());
        assert_eq!(
            transport.requested_assets(),
            vec![Some(first), Some(first), Some(second)]
        );
    }

    #[test]
    fn test_mark_missing() {
        let transport = Arc::new(MockTransport::new());
        let asset = AssetId::new_random();
        transport.insert(asset, sample_asset(&[0]).bytes);

        let (engine, _results) = engine(&transport, Arc::new(NoCache));
        engine.request_header(asset);
        wait_until(|| engine.header(asset).is_some());
        engine.mark_missing(asset);
        assert!(engine.header(asset).unwrap().not_found);
    }
}
