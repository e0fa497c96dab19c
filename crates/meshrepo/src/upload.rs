//! Two-phase upload of authored models.
//!
//! An upload first asks the asset service for a fee quote, sending the full
//! packaged document. The quote names an uploader URL; committing posts the
//! packaged resources there. Each phase is one POST whose outcome reaches the
//! [`UploadObserver`] from [`crate::MeshRepository::notify_loaded_meshes`].
//! Failures carry the server's error identifier and are never retried.
//!
//! When hull generation is requested, each model is first run through the
//! decomposition worker's single-hull stage and the hulls are packaged as
//! base hulls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use glam::{Quat, Vec3};
use meshrepo_decode::{
    AssetBlocks, Decomposition, Llsd, MeshVolume, NUM_LODS, SkinInfo, write_asset,
};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::physics::{DecompRequest, PhysicsDecomposer, STAGE_SINGLE_HULL};
use crate::transport::{HttpResponse, LLSD_BINARY_CONTENT_TYPE, Transport};

/// Collision uses the uploaded physics mesh.
pub const PHYSICS_SHAPE_PRIM: i32 = 0;
pub const PHYSICS_SHAPE_NONE: i32 = 1;
/// Collision uses the convex hull.
pub const PHYSICS_SHAPE_CONVEX_HULL: i32 = 2;

/// Material code sent for every instance.
pub const MATERIAL_WOOD: i32 = 3;

const DEFAULT_NAME: &str = "mesh model";
const DEFAULT_DESCRIPTION: &str = "(No Description)";
const DEFAULT_METRIC: &str = "MUT_Unspecified";

/// Which POST a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Fee,
    Upload,
}

impl UploadPhase {
    fn expected_state(self) -> &'static str {
        match self {
            Self::Fee => "upload",
            Self::Upload => "complete",
        }
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fee => "fee",
            Self::Upload => "upload",
        })
    }
}

/// Identifies one upload for the lifetime of the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(u64);

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload#{}", self.0)
    }
}

/// Permission masks granted on the new inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub next_owner: u32,
    pub group: u32,
    pub everyone: u32,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            // Move and transfer.
            next_owner: 0x0008_2000,
            group: 0,
            everyone: 0,
        }
    }
}

/// Appearance of one face of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMaterial {
    pub diffuse_color: [f32; 4],
    pub fullbright: bool,
    /// Index into [`UploadRequest::textures`].
    pub texture: Option<usize>,
}

impl Default for FaceMaterial {
    fn default() -> Self {
        Self {
            diffuse_color: [1.0; 4],
            fullbright: false,
            texture: None,
        }
    }
}

/// One placement of a model in the uploaded linkset.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInstance {
    pub label: String,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// Per face, in face order. Extra entries beyond the model's faces are ignored.
    pub faces: Vec<FaceMaterial>,
}

impl Default for ModelInstance {
    fn default() -> Self {
        Self {
            label: String::new(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            faces: Vec::new(),
        }
    }
}

/// An authored model and every place it is instanced.
#[derive(Debug, Clone, Default)]
pub struct UploadModel {
    pub name: String,
    /// Indexed by LOD, lowest first.
    pub lods: [Option<MeshVolume>; NUM_LODS],
    pub physics: Option<MeshVolume>,
    pub skin: Option<SkinInfo>,
    pub decomposition: Option<Decomposition>,
    pub instances: Vec<ModelInstance>,
}

impl UploadModel {
    /// Geometry hulls are generated from: the physics mesh, else the highest LOD.
    #[must_use]
    pub fn hull_source(&self) -> Option<&MeshVolume> {
        self.physics
            .as_ref()
            .or_else(|| self.lods.iter().rev().find_map(Option::as_ref))
    }

    fn face_count(&self) -> usize {
        self.lods
            .iter()
            .rev()
            .find_map(Option::as_ref)
            .map_or(0, |volume| volume.faces.len())
    }
}

/// Everything needed to quote and commit one upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub name: String,
    pub description: String,
    pub models: Vec<UploadModel>,
    /// Encoded texture images referenced by face materials.
    pub textures: Vec<Vec<u8>>,
    pub permissions: Permissions,
    pub include_skin: bool,
    pub include_textures: bool,
    /// Run each model through the single-hull stage before packaging.
    pub generate_hulls: bool,
    pub metric: String,
}

/// Fee quote returned by the first phase.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeQuote {
    /// Where the commit is posted.
    pub upload_url: String,
    pub price: i32,
    /// Server-provided cost breakdown.
    pub data: Llsd,
}

/// Result of a committed upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    pub new_asset: Option<Uuid>,
    pub new_inventory_item: Option<Uuid>,
}

/// A failed phase, with the server's structured error when it sent one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{phase} request failed with status {status}: {identifier} {message}")]
pub struct UploadError {
    pub phase: UploadPhase,
    /// HTTP status, or zero when no response was received.
    pub status: u16,
    pub identifier: String,
    pub message: String,
    pub errors: Vec<Llsd>,
}

impl UploadError {
    fn local(phase: UploadPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            status: 0,
            identifier: String::new(),
            message: message.into(),
            errors: Vec::new(),
        }
    }

    fn from_response(phase: UploadPhase, status: u16, body: &Llsd) -> Self {
        let error = body.get("error");
        let field = |key: &str| {
            error
                .and_then(|e| e.get(key))
                .and_then(Llsd::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            phase,
            status,
            identifier: field("identifier"),
            message: field("message"),
            errors: error
                .and_then(|e| e.get("errors"))
                .and_then(Llsd::as_array)
                .map(<[Llsd]>::to_vec)
                .unwrap_or_default(),
        }
    }
}

/// Receives upload progress. Called only from the repository's tick.
pub trait UploadObserver: Send + Sync {
    fn on_fee_quoted(&self, id: UploadId, quote: &FeeQuote) {
        let _ = (id, quote);
    }

    fn on_upload_complete(&self, id: UploadId, receipt: &UploadReceipt) {
        let _ = (id, receipt);
    }

    fn on_upload_failed(&self, id: UploadId, error: &UploadError);
}

fn vec3_llsd(v: Vec3) -> Llsd {
    Llsd::Array(v.to_array().map(Llsd::from).to_vec())
}

fn index_llsd(index: usize) -> Result<Llsd> {
    i32::try_from(index)
        .map(Llsd::Integer)
        .map_err(|_| Error::InvalidData {
            context: "upload",
            detail: format!("index {index} out of range"),
        })
}

fn face_llsd(face: &FaceMaterial, texture_count: usize, include_textures: bool) -> Result<Llsd> {
    let mut entry = Llsd::map();
    if include_textures
        && let Some(texture) = face.texture.filter(|&t| t < texture_count)
    {
        entry.insert("image", index_llsd(texture)?);
        entry.insert("scales", 1.0);
        entry.insert("scalet", 1.0);
        entry.insert("offsets", 0.0);
        entry.insert("offsett", 0.0);
        entry.insert("imagerot", 0.0);
    }
    entry.insert(
        "diffuse_color",
        Llsd::Array(face.diffuse_color.map(Llsd::from).to_vec()),
    );
    entry.insert("fullbright", face.fullbright);
    Ok(entry)
}

/// Build the fee request document.
///
/// `hulls` holds generated single hulls by model index; each replaces that
/// model's base hull. The document's `asset_resources` entry is the body of
/// the commit.
pub fn package(request: &UploadRequest, hulls: &HashMap<usize, Vec<Vec3>>) -> Result<Llsd> {
    let mut mesh_list = Vec::with_capacity(request.models.len());
    let mut instance_list = Vec::new();

    for (index, model) in request.models.iter().enumerate() {
        let mut decomposition = model.decomposition.clone();
        if let Some(hull) = hulls.get(&index) {
            decomposition.get_or_insert_with(Decomposition::default).base_hull = hull.clone();
        }
        let blocks = AssetBlocks {
            lods: model.lods.clone(),
            skin: model.skin.clone().filter(|_| request.include_skin),
            decomposition,
            physics_shape: model.physics.clone(),
        };
        let asset = write_asset(&blocks)?;
        mesh_list.push(Llsd::Binary(asset.bytes));

        let shape_type = if model.physics.is_some() {
            PHYSICS_SHAPE_PRIM
        } else {
            PHYSICS_SHAPE_CONVEX_HULL
        };
        let face_count = model.face_count();
        for instance in &model.instances {
            let faces = instance
                .faces
                .iter()
                .take(face_count)
                .map(|face| face_llsd(face, request.textures.len(), request.include_textures))
                .collect::<Result<Vec<_>>>()?;
            instance_list.push(
                Llsd::map()
                    .with("position", vec3_llsd(instance.position))
                    .with(
                        "rotation",
                        Llsd::Array(instance.rotation.to_array().map(Llsd::from).to_vec()),
                    )
                    .with("scale", vec3_llsd(instance.scale))
                    .with("material", MATERIAL_WOOD)
                    .with("physics_shape_type", shape_type)
                    .with("mesh", index_llsd(index)?)
                    .with("mesh_name", instance.label.as_str())
                    .with("face_list", faces),
            );
        }
    }

    let texture_list: Vec<Llsd> = if request.include_textures {
        request.textures.iter().cloned().map(Llsd::Binary).collect()
    } else {
        Vec::new()
    };
    let or_default = |value: &str, default: &'static str| {
        if value.is_empty() {
            default.to_string()
        } else {
            value.to_string()
        }
    };

    let resources = Llsd::map()
        .with("mesh_list", mesh_list)
        .with("texture_list", texture_list)
        .with("instance_list", instance_list)
        .with("metric", or_default(&request.metric, DEFAULT_METRIC));

    Ok(Llsd::map()
        .with("name", or_default(&request.name, DEFAULT_NAME))
        .with("description", or_default(&request.description, DEFAULT_DESCRIPTION))
        .with("asset_type", "mesh")
        .with("inventory_type", "object")
        .with("next_owner_mask", request.permissions.next_owner)
        .with("group_mask", request.permissions.group)
        .with("everyone_mask", request.permissions.everyone)
        .with("asset_resources", resources))
}

/// Check a phase response and return its body map.
fn check_response(
    phase: UploadPhase,
    result: Result<HttpResponse>,
) -> std::result::Result<Llsd, UploadError> {
    let response = result.map_err(|e| UploadError::local(phase, e.to_string()))?;
    let body = if response.body.is_empty() {
        Llsd::Undefined
    } else {
        Llsd::parse_binary(&response.body).map_or(Llsd::Undefined, |(value, _)| value)
    };

    let state = body.get("state").and_then(Llsd::as_str);
    if response.is_success() && state == Some(phase.expected_state()) {
        Ok(body)
    } else {
        Err(UploadError::from_response(phase, response.status, &body))
    }
}

impl FeeQuote {
    fn from_response(body: &Llsd) -> std::result::Result<Self, UploadError> {
        let upload_url = body
            .get("uploader")
            .and_then(Llsd::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| UploadError::local(UploadPhase::Fee, "fee response has no uploader URL"))?;
        Ok(Self {
            upload_url: upload_url.to_string(),
            price: body.get("upload_price").and_then(Llsd::as_integer).unwrap_or(0),
            data: body.get("data").cloned().unwrap_or_else(Llsd::map),
        })
    }
}

impl UploadReceipt {
    fn from_response(body: &Llsd) -> Self {
        Self {
            new_asset: body.get("new_asset").and_then(Llsd::as_uuid),
            new_inventory_item: body.get("new_inventory_item").and_then(Llsd::as_uuid),
        }
    }
}

/// Progress to report to an observer.
pub(crate) enum Notice {
    Quoted(FeeQuote),
    Complete(UploadReceipt),
    Failed(UploadError),
}

pub(crate) struct Delivery {
    observer: Arc<dyn UploadObserver>,
    id: UploadId,
    notice: Notice,
}

impl Delivery {
    pub fn deliver(self) {
        match &self.notice {
            Notice::Quoted(quote) => self.observer.on_fee_quoted(self.id, quote),
            Notice::Complete(receipt) => self.observer.on_upload_complete(self.id, receipt),
            Notice::Failed(error) => self.observer.on_upload_failed(self.id, error),
        }
    }
}

enum State {
    GeneratingHulls {
        remaining: usize,
        hulls: HashMap<usize, Vec<Vec3>>,
    },
    Quoting,
    Quoted(FeeQuote),
    Committing,
}

struct Upload {
    request: UploadRequest,
    fee_url: String,
    observer: Arc<dyn UploadObserver>,
    state: State,
    document: Llsd,
}

enum Event {
    Hull {
        id: UploadId,
        model: usize,
        hull: Vec<Vec3>,
    },
    Response {
        id: UploadId,
        phase: UploadPhase,
        result: std::result::Result<Llsd, UploadError>,
    },
}

/// Uploads in progress.
pub(crate) struct Uploads {
    transport: Arc<dyn Transport>,
    runtime: tokio::runtime::Handle,
    next_id: u64,
    uploads: HashMap<UploadId, Upload>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl Uploads {
    pub fn new(transport: Arc<dyn Transport>, runtime: tokio::runtime::Handle) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            transport,
            runtime,
            next_id: 0,
            uploads: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    /// Begin an upload with a fee request to `fee_url`.
    pub fn start(
        &mut self,
        request: UploadRequest,
        fee_url: &str,
        observer: Arc<dyn UploadObserver>,
        physics: &PhysicsDecomposer,
    ) -> Result<UploadId> {
        let id = UploadId(self.next_id);
        self.next_id += 1;

        let mut remaining = 0;
        if request.generate_hulls {
            for (model, source) in request
                .models
                .iter()
                .enumerate()
                .filter_map(|(index, model)| Some((index, model.hull_source()?)))
            {
                let events = self.events_tx.clone();
                let decomp = DecompRequest::from_volume(STAGE_SINGLE_HULL, source).on_complete(
                    move |done: DecompRequest| {
                        let hull = done.hulls.into_iter().next().unwrap_or_default();
                        let _ = events.send(Event::Hull { id, model, hull });
                    },
                );
                physics.submit(decomp)?;
                remaining += 1;
            }
        }

        let mut upload = Upload {
            request,
            fee_url: fee_url.to_string(),
            observer,
            state: State::Quoting,
            document: Llsd::Undefined,
        };
        if remaining > 0 {
            tracing::debug!(%id, hulls = remaining, "generating hulls before quoting");
            upload.state = State::GeneratingHulls {
                remaining,
                hulls: HashMap::new(),
            };
        } else {
            self.request_quote(id, &mut upload, &HashMap::new())?;
        }
        self.uploads.insert(id, upload);
        Ok(id)
    }

    fn request_quote(
        &self,
        id: UploadId,
        upload: &mut Upload,
        hulls: &HashMap<usize, Vec<Vec3>>,
    ) -> Result<()> {
        upload.document = package(&upload.request, hulls)?;
        tracing::info!(%id, url = %upload.fee_url, "requesting upload fee");
        self.post(id, UploadPhase::Fee, upload.fee_url.clone(), upload.document.to_binary());
        upload.state = State::Quoting;
        Ok(())
    }

    /// Commit a quoted upload.
    pub fn commit(&mut self, id: UploadId) -> Result<()> {
        let Some(upload) = self.uploads.get_mut(&id) else {
            return Err(Error::InvalidData {
                context: "upload",
                detail: format!("{id} is not in progress"),
            });
        };
        let State::Quoted(quote) = &upload.state else {
            return Err(Error::InvalidData {
                context: "upload",
                detail: format!("{id} has no fee quote"),
            });
        };
        let url = quote.upload_url.clone();
        let body = upload
            .document
            .get("asset_resources")
            .map(Llsd::to_binary)
            .unwrap_or_default();
        upload.state = State::Committing;

        tracing::info!(%id, url = %url, "committing upload");
        self.post(id, UploadPhase::Upload, url, body);
        Ok(())
    }

    /// Drop an upload in any state without notifying its observer.
    ///
    /// Late hull and response events for it are ignored. A commit already
    /// sent may still be applied by the service.
    pub fn cancel(&mut self, id: UploadId) -> Result<()> {
        if self.uploads.remove(&id).is_none() {
            return Err(Error::InvalidData {
                context: "upload",
                detail: format!("{id} is not in progress"),
            });
        }
        tracing::info!(%id, "upload cancelled");
        Ok(())
    }

    fn post(&self, id: UploadId, phase: UploadPhase, url: String, body: Vec<u8>) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        self.runtime.spawn(async move {
            let result = transport.post(&url, LLSD_BINARY_CONTENT_TYPE, body).await;
            let result = check_response(phase, result);
            let _ = events.send(Event::Response { id, phase, result });
        });
    }

    /// Advance uploads with finished hulls and responses.
    ///
    /// Returns the observer calls to make once no locks are held.
    pub fn poll(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                Event::Hull { id, model, hull } => self.hull_finished(id, model, hull, &mut deliveries),
                Event::Response { id, phase, result } => {
                    self.response(id, phase, result, &mut deliveries);
                }
            }
        }
        deliveries
    }

    fn hull_finished(
        &mut self,
        id: UploadId,
        model: usize,
        hull: Vec<Vec3>,
        deliveries: &mut Vec<Delivery>,
    ) {
        let Some(mut upload) = self.uploads.remove(&id) else {
            return;
        };
        let State::GeneratingHulls { remaining, hulls } = &mut upload.state else {
            self.uploads.insert(id, upload);
            return;
        };
        if !hull.is_empty() {
            hulls.insert(model, hull);
        }
        *remaining -= 1;
        if *remaining > 0 {
            self.uploads.insert(id, upload);
            return;
        }

        let hulls = std::mem::take(hulls);
        match self.request_quote(id, &mut upload, &hulls) {
            Ok(()) => {
                self.uploads.insert(id, upload);
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "failed to package upload");
                deliveries.push(Delivery {
                    observer: upload.observer,
                    id,
                    notice: Notice::Failed(UploadError::local(UploadPhase::Fee, e.to_string())),
                });
            }
        }
    }

    fn response(
        &mut self,
        id: UploadId,
        phase: UploadPhase,
        result: std::result::Result<Llsd, UploadError>,
        deliveries: &mut Vec<Delivery>,
    ) {
        let Some(mut upload) = self.uploads.remove(&id) else {
            return;
        };
        let outcome = result.and_then(|body| match phase {
            UploadPhase::Fee => FeeQuote::from_response(&body).map(Notice::Quoted),
            UploadPhase::Upload => Ok(Notice::Complete(UploadReceipt::from_response(&body))),
        });

        let notice = match outcome {
            Ok(Notice::Quoted(quote)) => {
                tracing::info!(%id, price = quote.price, "upload fee quoted");
                upload.state = State::Quoted(quote.clone());
                deliveries.push(Delivery {
                    observer: upload.observer.clone(),
                    id,
                    notice: Notice::Quoted(quote),
                });
                self.uploads.insert(id, upload);
                return;
            }
            Ok(notice) => {
                tracing::info!(%id, "upload complete");
                notice
            }
            Err(error) => {
                tracing::error!(
                    %id,
                    %phase,
                    status = error.status,
                    identifier = %error.identifier,
                    message = %error.message,
                    "upload failed"
                );
                Notice::Failed(error)
            }
        };
        deliveries.push(Delivery {
            observer: upload.observer,
            id,
            notice,
        });
    }
}
