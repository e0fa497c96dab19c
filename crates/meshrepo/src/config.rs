//! Repository tuning.
//!
//! Every limit the fetch engine, scheduler and cost model consult lives here
//! and is fixed at construction. Files are TOML; missing keys take defaults
//! and durations are written as fractional seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`crate::MeshRepository`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Header and LOD requests issued per second, shared between both queues.
    pub max_requests_per_second: u32,
    /// Header and LOD requests in flight at once.
    pub max_concurrent_requests: usize,
    /// Newest container version this client understands.
    pub max_mesh_version: i32,
    /// Delay before a transiently failed request is retried.
    #[serde(with = "seconds")]
    pub header_retry_delay: Duration,
    /// Delay before retrying a request that could not be issued at all.
    #[serde(with = "seconds")]
    pub fetch_failure_delay: Duration,
    /// Bytes requested for a header fetch.
    pub header_fetch_bytes: u32,
    /// Largest asset a header may declare. Larger ones are rejected before
    /// any cache slot is reserved.
    pub max_asset_size: u64,
    /// Upper bound on how long the engine sleeps while requests are waiting.
    #[serde(with = "seconds")]
    pub poll_interval: Duration,
    /// Timeout applied to every HTTP request.
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    /// Bytes of each LOD assumed to be format overhead, not triangles.
    pub metadata_discount: u32,
    /// Floor on the byte size charged for any LOD.
    pub minimum_size: u32,
    pub bytes_per_triangle: u32,
    /// Triangle count that maps to the maximum radius-based streaming cost.
    pub triangle_budget: u32,
    /// Directory for the on-disk cache. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    /// Byte limit of the memory cache used when `cache_dir` is unset.
    pub memory_cache_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 100,
            max_concurrent_requests: 32,
            max_mesh_version: 999,
            header_retry_delay: Duration::from_secs(10),
            fetch_failure_delay: Duration::from_secs(15),
            header_fetch_bytes: 4096,
            max_asset_size: 16 << 20,
            poll_interval: Duration::from_secs(1) / 60,
            request_timeout: Duration::from_secs(60),
            metadata_discount: 384,
            minimum_size: 16,
            bytes_per_triangle: 16,
            triangle_budget: 250_000,
            cache_dir: None,
            memory_cache_size: 256 << 20,
        }
    }
}

impl RepositoryConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config {
            path: None,
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let config_error = |message: String| Error::Config {
            path: Some(path.to_path_buf()),
            message: format!("{}: {message}", path.display()),
        };
        let source = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        toml::from_str(&source).map_err(|e| config_error(e.to_string()))
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
