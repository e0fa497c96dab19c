//! Background convex decomposition thread.
//!
//! Requests are queued to a single worker thread that owns the
//! [`ConvexDecomposer`]. Finished requests wait in a completion queue until
//! the main thread calls [`PhysicsDecomposer::notify_completed`], which runs
//! each request's callback on the calling thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use glam::Vec3;
use meshrepo_decode::{Decomposition, MeshVolume, PhysicsMesh};

use super::decomposer::{ConvexDecomposer, ParamValue, STAGE_SINGLE_HULL};
use super::hull::{box_hull, convex_hull};
use crate::error::{Error, Result};

/// Largest vertex count a request can index.
const MAX_VERTICES: usize = 65_535;

/// Called with the finished request on the main thread.
pub type DecompCallback = Box<dyn FnOnce(DecompRequest) + Send>;

/// One mesh to decompose, and afterwards its hulls.
pub struct DecompRequest {
    pub stage: String,
    pub params: Vec<(String, ParamValue)>,
    /// Deduplicated vertex positions.
    pub positions: Vec<Vec3>,
    /// Triangle list into `positions`, with slivers removed.
    pub indices: Vec<u32>,
    pub bbox_min: Vec3,
    pub bbox_max: Vec3,
    /// Output point set per hull.
    pub hulls: Vec<Vec<Vec3>>,
    /// Output renderable mesh per hull.
    pub hull_meshes: Vec<PhysicsMesh>,
    completion: Option<DecompCallback>,
}

impl std::fmt::Debug for DecompRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecompRequest")
            .field("stage", &self.stage)
            .field("positions", &self.positions.len())
            .field("indices", &self.indices.len())
            .field("hulls", &self.hulls.len())
            .finish_non_exhaustive()
    }
}

impl DecompRequest {
    /// Build a request from every face of a volume.
    ///
    /// Faces that would push the vertex count past 65 535 are skipped.
    /// Triangles whose squared area measure falls below
    /// `min(0.0002, smallest_extent * 0.000002)` are dropped.
    #[must_use]
    pub fn from_volume(stage: impl Into<String>, volume: &MeshVolume) -> Self {
        let mut request = Self::empty(stage.into());

        // Deduplicate positions and remap face-local indices.
        let mut seen: HashMap<[u32; 3], u32> = HashMap::new();
        let mut triangles: Vec<[u32; 3]> = Vec::new();
        for face in &volume.faces {
            if request.positions.len() + face.positions.len() > MAX_VERTICES {
                continue;
            }
            let remap: Vec<u32> = face
                .positions
                .iter()
                .map(|p| {
                    *seen.entry(p.to_array().map(f32::to_bits)).or_insert_with(|| {
                        request.positions.push(*p);
                        #[allow(clippy::cast_possible_truncation)]
                        let index = (request.positions.len() - 1) as u32;
                        index
                    })
                })
                .collect();
            for tri in face.indices.chunks_exact(3) {
                let mapped = [tri[0], tri[1], tri[2]].map(|i| remap.get(usize::from(i)).copied());
                if let [Some(a), Some(b), Some(c)] = mapped {
                    triangles.push([a, b, c]);
                }
            }
        }

        request.update_bounds();
        let threshold = request.area_threshold();
        for tri in triangles {
            if request.is_valid_triangle(tri, threshold) {
                request.indices.extend_from_slice(&tri);
            }
        }
        request
    }

    fn empty(stage: String) -> Self {
        Self {
            stage,
            params: Vec::new(),
            positions: Vec::new(),
            indices: Vec::new(),
            bbox_min: Vec3::ZERO,
            bbox_max: Vec3::ZERO,
            hulls: Vec::new(),
            hull_meshes: Vec::new(),
            completion: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Set the callback run by [`PhysicsDecomposer::notify_completed`].
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(DecompRequest) + Send + 'static) -> Self {
        self.completion = Some(Box::new(callback));
        self
    }

    /// Enough geometry to attempt a decomposition.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.positions.len() > 2 && self.indices.len() > 2
    }

    fn update_bounds(&mut self) {
        let mut points = self.positions.iter();
        let Some(first) = points.next() else {
            return;
        };
        let (min, max) = points.fold((*first, *first), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
        self.bbox_min = min;
        self.bbox_max = max;
    }

    fn area_threshold(&self) -> f32 {
        let range = (self.bbox_max - self.bbox_min).min_element();
        (range * 0.000_002).min(0.0002)
    }

    fn is_valid_triangle(&self, [i0, i1, i2]: [u32; 3], threshold: f32) -> bool {
        let p = |i: u32| self.positions[i as usize];
        let a = p(i1) - p(i0);
        let b = p(i2) - p(i0);
        let c = a.dot(b);
        a.length_squared() * b.length_squared() - c * c > threshold
    }

    /// Replace the output with a single axis-aligned box around the input.
    fn make_box(&mut self) {
        let corners = box_hull(self.bbox_min, self.bbox_max);
        let mesh = convex_hull(&corners).map(|h| h.to_mesh()).unwrap_or_default();
        self.hulls = vec![corners];
        self.hull_meshes = vec![mesh];
    }

    /// The output as a decomposition record.
    ///
    /// A single-hull result also becomes the base hull.
    #[must_use]
    pub fn to_decomposition(&self) -> Decomposition {
        let mut decomposition = Decomposition {
            hulls: self.hulls.clone(),
            hull_meshes: self.hull_meshes.clone(),
            ..Decomposition::default()
        };
        if self.stage == STAGE_SINGLE_HULL
            && let (Some(hull), Some(mesh)) = (self.hulls.first(), self.hull_meshes.first())
        {
            decomposition.base_hull = hull.clone();
            decomposition.base_hull_mesh = mesh.clone();
        }
        decomposition
    }
}

/// Run one request against the decomposer.
fn process(decomposer: &mut dyn ConvexDecomposer, request: &mut DecompRequest) {
    request.hulls.clear();
    request.hull_meshes.clear();
    let single = request.stage == STAGE_SINGLE_HULL;

    if !request.is_valid() {
        tracing::debug!(stage = %request.stage, "not enough geometry to decompose");
        if single {
            request.make_box();
        }
        return;
    }

    decomposer.set_mesh(&request.positions, &request.indices);
    for (name, value) in &request.params {
        if let Err(e) = decomposer.set_param(name, *value) {
            tracing::debug!(param = %name, error = %e, "skipping decomposition parameter");
        }
    }

    match decomposer.execute_stage(&request.stage) {
        Ok(()) => {
            request.hulls = decomposer.hulls().to_vec();
            request.hull_meshes = (0..request.hulls.len())
                .map(|i| decomposer.hull_mesh(i).unwrap_or_default())
                .collect();
        }
        Err(e) => {
            tracing::warn!(stage = %request.stage, error = %e, "could not execute decomposition stage");
            if single {
                request.make_box();
            }
        }
    }
}

/// Handle to the decomposition thread.
pub struct PhysicsDecomposer {
    requests: Option<Sender<DecompRequest>>,
    completed: Receiver<DecompRequest>,
    quitting: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PhysicsDecomposer {
    /// Start the worker thread.
    pub fn spawn(mut decomposer: Box<dyn ConvexDecomposer>) -> Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<DecompRequest>();
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        let quitting = Arc::new(AtomicBool::new(false));

        let thread_quitting = quitting.clone();
        let handle = std::thread::Builder::new()
            .name("physics-decomp".into())
            .spawn(move || {
                let stages: Vec<&str> = decomposer.stages().iter().map(|s| s.name).collect();
                tracing::debug!(?stages, "decomposition worker started");
                while let Ok(mut request) = request_rx.recv() {
                    if thread_quitting.load(Ordering::Acquire) {
                        break;
                    }
                    process(decomposer.as_mut(), &mut request);
                    if completed_tx.send(request).is_err() {
                        break;
                    }
                }
                tracing::debug!("decomposition worker stopped");
            })
            .map_err(|source| Error::Spawn {
                name: "physics-decomp",
                source,
            })?;

        Ok(Self {
            requests: Some(request_tx),
            completed: completed_rx,
            quitting,
            handle: Some(handle),
        })
    }

    /// Queue a request.
    ///
    /// # Errors
    ///
    /// Fails once the worker has been shut down.
    pub fn submit(&self, request: DecompRequest) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or(Error::Shutdown)?
            .send(request)
            .map_err(|_| Error::Shutdown)
    }

    /// Run the callbacks of every finished request. Returns how many ran.
    pub fn notify_completed(&self) -> usize {
        let mut count = 0;
        while let Ok(mut request) = self.completed.try_recv() {
            if let Some(callback) = request.completion.take() {
                callback(request);
            }
            count += 1;
        }
        count
    }

    /// Stop the worker between requests and wait for it to exit.
    ///
    /// A stage already executing runs to completion first.
    pub fn shutdown(&mut self) {
        self.quitting.store(true, Ordering::Release);
        self.requests = None;
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("decomposition worker panicked");
        }
    }
}

impl Drop for PhysicsDecomposer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
