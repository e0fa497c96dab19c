//! Error types for the mesh repository.

use std::path::PathBuf;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in repository operations.
///
/// Fetch failures never reach consumers as errors; the engine resolves them
/// into loaded, unavailable, or a logged warning. These surface from setup,
/// caches, transports and the command-line host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed before a status was received.
    #[error("http request to {url} failed: {message}")]
    Http { url: String, message: String },
    /// HTTP response had a status the caller could not use.
    #[error("http request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },
    /// Block decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] meshrepo_decode::DecodeError),
    /// Cache operation failed.
    #[error("cache {operation} failed: {message}")]
    Cache {
        operation: &'static str,
        message: String,
    },
    /// Invalid data in a response or request.
    #[error("invalid {context}: {detail}")]
    InvalidData {
        context: &'static str,
        detail: String,
    },
    /// Configuration could not be read or parsed.
    #[error("invalid configuration: {message}")]
    Config {
        path: Option<PathBuf>,
        message: String,
    },
    /// A worker thread could not be started.
    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    /// The repository has been shut down.
    #[error("repository is shut down")]
    Shutdown,
}

impl Error {
    pub(crate) fn cache(operation: &'static str, e: impl std::fmt::Display) -> Self {
        Error::Cache {
            operation,
            message: e.to_string(),
        }
    }
}
