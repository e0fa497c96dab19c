//! Diagnostic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the engine, network tasks and the façade.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub bytes_received: AtomicU64,
    pub http_requests: AtomicU64,
    pub http_retries: AtomicU64,
    pub lod_pending: AtomicU64,
    pub lod_processing: AtomicU64,
    pub cache_reads: AtomicU64,
    pub cache_writes: AtomicU64,
    pub cache_bytes_read: AtomicU64,
    pub cache_bytes_written: AtomicU64,
}

impl Stats {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Decrement without wrapping below zero.
    pub fn sub(counter: &AtomicU64, value: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(value))
        });
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RepositoryStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RepositoryStats {
            bytes_received: load(&self.bytes_received),
            http_requests: load(&self.http_requests),
            http_retries: load(&self.http_retries),
            lod_pending: load(&self.lod_pending),
            lod_processing: load(&self.lod_processing),
            cache_reads: load(&self.cache_reads),
            cache_writes: load(&self.cache_writes),
            cache_bytes_read: load(&self.cache_bytes_read),
            cache_bytes_written: load(&self.cache_bytes_written),
        }
    }
}

/// Point-in-time copy of the repository counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    /// Body bytes received over HTTP.
    pub bytes_received: u64,
    /// HTTP requests issued.
    pub http_requests: u64,
    /// Requests re-queued after a transient failure.
    pub http_retries: u64,
    /// LOD requests waiting for their header.
    pub lod_pending: u64,
    /// LOD requests queued or in flight.
    pub lod_processing: u64,
    pub cache_reads: u64,
    pub cache_writes: u64,
    pub cache_bytes_read: u64,
    pub cache_bytes_written: u64,
}
