//! Command-line host for the mesh repository.
//!
//! `fetch` streams assets from an asset service the way a renderer would,
//! pumping the repository once per tick. `inspect` and `decompose` work on
//! asset files already on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use meshrepo::physics::{
    DecompRequest, HullDecomposer, PhysicsDecomposer, STAGE_DECOMPOSE, STAGE_SINGLE_HULL,
};
use meshrepo::{
    AssetId, ConsumerRef, CostData, CostParams, MeshConsumer, MeshRepository, MeshVolume,
    NUM_LODS, RepositoryConfig,
};
use meshrepo_decode::{BlockKind, decode_volume, parse_header};
use parking_lot::Mutex;

/// Host loop rate.
const TICK: Duration = Duration::from_micros(16_667);

#[derive(Parser)]
#[command(name = "meshrepo")]
#[command(about = "Stream, inspect and decompose mesh assets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch meshes from an asset service
    Fetch {
        /// Asset service base URL; `?mesh_id=<uuid>` is appended
        #[arg(long)]
        base_url: String,
        /// Directory for the on-disk cache (memory cache if omitted)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Level of detail to request, 0 (lowest) to 3 (highest)
        #[arg(long, default_value_t = 3)]
        lod: usize,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Asset ids
        #[arg(required = true)]
        assets: Vec<AssetId>,
    },
    /// Print the header blocks and cost data of an asset file
    Inspect {
        file: PathBuf,
        /// Radius used for the radius-based streaming cost
        #[arg(long, default_value_t = 1.0)]
        radius: f32,
    },
    /// Decompose one LOD of an asset file into convex hulls
    Decompose {
        file: PathBuf,
        #[arg(long, default_value_t = 3)]
        lod: usize,
        /// Wrap the mesh in one hull instead of decomposing it
        #[arg(long)]
        single_hull: bool,
    },
}

fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch {
            base_url,
            cache_dir,
            config,
            lod,
            timeout,
            assets,
        } => {
            let mut config = match config {
                Some(path) => RepositoryConfig::load(&path)?,
                None => RepositoryConfig::default(),
            };
            if cache_dir.is_some() {
                config.cache_dir = cache_dir;
            }
            fetch(config, &base_url, lod, Duration::from_secs(timeout), &assets)
        }
        Commands::Inspect { file, radius } => inspect(&file, radius),
        Commands::Decompose {
            file,
            lod,
            single_hull,
        } => decompose(&file, lod, single_hull),
    }
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Loaded { lod: usize, triangles: usize },
    Unavailable { lod: usize },
}

/// Records how each requested asset resolved.
#[derive(Default)]
struct FetchConsumer {
    resolved: Mutex<HashMap<AssetId, Resolution>>,
}

impl MeshConsumer for FetchConsumer {
    fn bounding_radius(&self) -> f32 {
        1.0
    }

    fn distance_to_viewer(&self) -> f32 {
        1.0
    }

    fn on_mesh_loaded(&self, asset: AssetId, lod: usize, volume: &Arc<MeshVolume>) {
        self.resolved.lock().insert(
            asset,
            Resolution::Loaded {
                lod,
                triangles: volume.triangle_count(),
            },
        );
    }

    fn on_mesh_unavailable(&self, asset: AssetId, lod: usize) {
        self.resolved
            .lock()
            .insert(asset, Resolution::Unavailable { lod });
    }
}

fn fetch(
    config: RepositoryConfig,
    base_url: &str,
    lod: usize,
    timeout: Duration,
    assets: &[AssetId],
) -> Result<()> {
    let mut repo = MeshRepository::from_config(config, base_url)?;
    let recorder = Arc::new(FetchConsumer::default());
    let consumer: ConsumerRef = recorder.clone();

    for &asset in assets {
        repo.load_mesh(&consumer, asset, lod, None);
    }

    let deadline = Instant::now() + timeout;
    let mut fallen_back: HashSet<AssetId> = HashSet::new();
    loop {
        repo.notify_loaded_meshes();

        // A missing LOD falls back to whichever level the header says exists.
        let unavailable: Vec<(AssetId, usize)> = recorder
            .resolved
            .lock()
            .iter()
            .filter_map(|(asset, resolution)| match resolution {
                Resolution::Unavailable { lod } => Some((*asset, *lod)),
                Resolution::Loaded { .. } => None,
            })
            .collect();
        for (asset, missing) in unavailable {
            if fallen_back.contains(&asset) {
                continue;
            }
            if let Some(actual) = repo.get_actual_mesh_lod(asset, missing)
                && actual != missing
            {
                tracing::info!(asset = %asset, requested = missing, actual, "falling back");
                fallen_back.insert(asset);
                recorder.resolved.lock().remove(&asset);
                repo.load_mesh(&consumer, asset, actual, Some(missing));
            }
        }

        if recorder.resolved.lock().len() == assets.len() {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!("timed out waiting for meshes");
            break;
        }
        std::thread::sleep(TICK);
    }

    let resolved = recorder.resolved.lock().clone();
    for asset in assets {
        match resolved.get(asset) {
            Some(Resolution::Loaded { lod, triangles }) => {
                let cost = repo.get_streaming_cost_by_triangles(*asset, false);
                println!(
                    "{asset}  lod {lod}  {triangles} triangles  cost {}",
                    cost.map_or_else(|| "-".to_string(), |c| format!("{c:.3}"))
                );
            }
            Some(Resolution::Unavailable { lod }) => println!("{asset}  lod {lod}  unavailable"),
            None => println!("{asset}  pending"),
        }
    }

    let stats = repo.stats();
    println!(
        "{} requests, {} retries, {} bytes received, {} cache reads, {} cache writes",
        stats.http_requests,
        stats.http_retries,
        stats.bytes_received,
        stats.cache_reads,
        stats.cache_writes
    );
    repo.shutdown();
    Ok(())
}

fn inspect(path: &Path, radius: f32) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header = parse_header(&bytes).context("parsing mesh header")?;
    let config = RepositoryConfig::default();

    println!("version {}  header {} bytes", header.version, header.header_size);
    for kind in BlockKind::ALL {
        let info = header.block(kind);
        if info.is_present() {
            println!("  {kind:<14} offset {:>8}  size {:>8}", info.offset, info.size);
        }
    }

    match CostData::from_header(&header, config.max_mesh_version, &CostParams::from(&config)) {
        Some(cost) => {
            for lod in 0..NUM_LODS {
                println!("  lod {lod}  ~{:.0} triangles", cost.est_tris_by_lod(lod));
            }
            println!(
                "  streaming cost (radius {radius}) {:.3}",
                cost.radius_based_streaming_cost(radius)
            );
            println!(
                "  streaming cost (triangles) {:.3}",
                cost.triangle_based_streaming_cost()
            );
        }
        None => println!("  no cost data"),
    }
    Ok(())
}

fn decompose(path: &Path, lod: usize, single_hull: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header = parse_header(&bytes).context("parsing mesh header")?;
    let block = BlockKind::from_lod(lod).context("LOD must be 0 to 3")?;
    let Some(data) = header.block_slice(&bytes, block) else {
        bail!("asset has no {block} block");
    };
    let volume = decode_volume(data)?;

    let stage = if single_hull { STAGE_SINGLE_HULL } else { STAGE_DECOMPOSE };
    let request = DecompRequest::from_volume(stage, &volume);
    println!(
        "{} vertices, {} triangles after cleanup",
        request.positions.len(),
        request.indices.len() / 3
    );

    let done = run_decomposition(request)?;

    println!("{} hulls", done.hulls.len());
    for (i, (hull, mesh)) in done.hulls.iter().zip(&done.hull_meshes).enumerate() {
        println!("  hull {i}: {} points, {} triangles", hull.len(), mesh.triangle_count());
    }
    Ok(())
}

/// Run one request on a fresh worker, pumping completions until it returns.
fn run_decomposition(request: DecompRequest) -> Result<DecompRequest> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let mut decomposer = PhysicsDecomposer::spawn(Box::new(HullDecomposer::new()))?;
    decomposer.submit(request.on_complete(move |done| {
        let _ = tx.send(done);
    }))?;

    let done = loop {
        decomposer.notify_completed();
        if let Ok(done) = rx.try_recv() {
            break done;
        }
        std::thread::sleep(TICK);
    };
    decomposer.shutdown();
    Ok(done)
}
