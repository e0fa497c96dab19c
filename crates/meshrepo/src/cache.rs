//! Local cache of raw asset bytes.
//!
//! Each asset owns one slot laid out like the asset itself: the header bytes
//! as received, followed by every block at its declared offset. A slot is
//! reserved at full size when the header arrives and blocks are written into
//! it as they are fetched; unwritten regions stay zero.
//!
//! # Implementations
//!
//! - [`MemoryCache`]: In-memory slots with an optional size limit
//! - [`FilesystemCache`]: One file per asset in a directory
//! - [`NoCache`]: Passthrough implementation that caches nothing

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::AssetId;

/// Storage for per-asset byte slots.
///
/// Calls block on local I/O and are made from the fetch engine thread and
/// network completion tasks. Writers never race on one slot region because
/// each asset has at most one in-flight request per block.
pub trait MeshCache: Send + Sync {
    /// Length of the slot for `asset`, or `None` when there is no slot.
    fn slot_size(&self, asset: AssetId) -> Result<Option<u64>>;

    /// Read `len` bytes at `offset`.
    ///
    /// Returns `Ok(None)` if the slot is missing or too short.
    fn read(&self, asset: AssetId, offset: u64, len: usize) -> Result<Option<Vec<u8>>>;

    /// Replace the whole slot.
    fn write_slot(&self, asset: AssetId, data: Vec<u8>) -> Result<()>;

    /// Overwrite bytes inside an existing slot without growing it.
    fn write_at(&self, asset: AssetId, offset: u64, data: &[u8]) -> Result<()>;

    fn remove(&self, asset: AssetId) -> Result<()>;

    /// Clear all cached data.
    fn clear(&self) -> Result<()>;
}

/// A cache that stores nothing (passthrough).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl NoCache {
    /// Create a new no-op cache.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MeshCache for NoCache {
    fn slot_size(&self, _asset: AssetId) -> Result<Option<u64>> {
        Ok(None)
    }

    fn read(&self, _asset: AssetId, _offset: u64, _len: usize) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn write_slot(&self, _asset: AssetId, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn write_at(&self, _asset: AssetId, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _asset: AssetId) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory cache.
///
/// The cache has an optional maximum size in bytes. When the limit is
/// exceeded, the oldest slots are evicted.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    data: Arc<RwLock<MemoryCacheInner>>,
    max_size: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryCacheInner {
    slots: HashMap<AssetId, Vec<u8>>,
    /// Insertion order for eviction.
    order: Vec<AssetId>,
    current_size: usize,
}

impl MemoryCacheInner {
    fn evict(&mut self, asset: AssetId) {
        if let Some(old) = self.slots.remove(&asset) {
            self.current_size -= old.len();
            self.order.retain(|a| *a != asset);
        }
    }
}

impl MemoryCache {
    /// Create a new memory cache with no size limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(MemoryCacheInner::default())),
            max_size: None,
        }
    }

    /// Create a new memory cache with a maximum size in bytes.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(MemoryCacheInner::default())),
            max_size: Some(max_size),
        }
    }

    /// Get the current size of cached data in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.read().current_size
    }

    /// Get the number of cached slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshCache for MemoryCache {
    fn slot_size(&self, asset: AssetId) -> Result<Option<u64>> {
        Ok(self.data.read().slots.get(&asset).map(|s| s.len() as u64))
    }

    fn read(&self, asset: AssetId, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let cache = self.data.read();
        let Some(slot) = cache.slots.get(&asset) else {
            return Ok(None);
        };
        let Ok(start) = usize::try_from(offset) else {
            return Ok(None);
        };
        Ok(start
            .checked_add(len)
            .and_then(|end| slot.get(start..end))
            .map(<[u8]>::to_vec))
    }

    fn write_slot(&self, asset: AssetId, data: Vec<u8>) -> Result<()> {
        let mut cache = self.data.write();
        cache.evict(asset);

        let data_size = data.len();

        // Evict old slots if we have a size limit.
        if let Some(max_size) = self.max_size {
            while cache.current_size + data_size > max_size && !cache.order.is_empty() {
                let oldest = cache.order.remove(0);
                if let Some(old) = cache.slots.remove(&oldest) {
                    cache.current_size -= old.len();
                }
            }
        }

        cache.slots.insert(asset, data);
        cache.order.push(asset);
        cache.current_size += data_size;
        Ok(())
    }

    fn write_at(&self, asset: AssetId, offset: u64, data: &[u8]) -> Result<()> {
        let mut cache = self.data.write();
        let slot = cache
            .slots
            .get_mut(&asset)
            .ok_or_else(|| Error::cache("write", format!("no slot for {asset}")))?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(data.len())?))
            .filter(|range| range.end <= slot.len())
            .ok_or_else(|| Error::cache("write", format!("write past end of slot for {asset}")))?;
        slot[range].copy_from_slice(data);
        Ok(())
    }

    fn remove(&self, asset: AssetId) -> Result<()> {
        self.data.write().evict(asset);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut cache = self.data.write();
        cache.slots.clear();
        cache.order.clear();
        cache.current_size = 0;
        Ok(())
    }
}

/// A cache storing one `<asset>.mesh` file per slot under a directory.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    dir: PathBuf,
}

impl FilesystemCache {
    /// Open a cache rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::cache("open", e))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, asset: AssetId) -> PathBuf {
        self.dir.join(format!("{asset}.mesh"))
    }
}

impl MeshCache for FilesystemCache {
    fn slot_size(&self, asset: AssetId) -> Result<Option<u64>> {
        match fs::metadata(self.slot_path(asset)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::cache("stat", e)),
        }
    }

    fn read(&self, asset: AssetId, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(self.slot_path(asset)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::cache("read", e)),
        };
        let file_len = file.metadata().map_err(|e| Error::cache("read", e))?.len();
        if offset.saturating_add(len as u64) > file_len {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::cache("read", e))?;
        let mut buf = vec![0; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::cache("read", e))?;
        Ok(Some(buf))
    }

    fn write_slot(&self, asset: AssetId, data: Vec<u8>) -> Result<()> {
        // Write beside the slot and rename so readers never see a partial file.
        let path = self.slot_path(asset);
        let tmp = path.with_extension("mesh.tmp");
        fs::write(&tmp, &data).map_err(|e| Error::cache("write", e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::cache("write", e))
    }

    fn write_at(&self, asset: AssetId, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.slot_path(asset))
            .map_err(|e| Error::cache("write", e))?;
        let file_len = file.metadata().map_err(|e| Error::cache("write", e))?.len();
        if offset.saturating_add(data.len() as u64) > file_len {
            return Err(Error::cache(
                "write",
                format!("write past end of slot for {asset}"),
            ));
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::cache("write", e))?;
        file.write_all(data).map_err(|e| Error::cache("write", e))
    }

    fn remove(&self, asset: AssetId) -> Result<()> {
        match fs::remove_file(self.slot_path(asset)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::cache("remove", e)),
        }
    }

    fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::cache("clear", e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::cache("clear", e))?.path();
            if path.extension().is_some_and(|ext| ext == "mesh") {
                fs::remove_file(&path).map_err(|e| Error::cache("clear", e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> AssetId {
        AssetId::from_u128(n)
    }

    #[test]
    fn test_no_cache() {
        let cache = NoCache::new();

        // Writes should succeed but not store anything.
        cache.write_slot(id(1), vec![1, 2, 3]).unwrap();
        assert_eq!(cache.slot_size(id(1)).unwrap(), None);
        assert_eq!(cache.read(id(1), 0, 3).unwrap(), None);
    }

    #[test]
    fn test_memory_cache_basic() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());

        cache.write_slot(id(1), vec![1, 2, 3, 0, 0]).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.slot_size(id(1)).unwrap(), Some(5));

        // Blocks are written into the reserved region.
        cache.write_at(id(1), 3, &[4, 5]).unwrap();
        assert_eq!(cache.read(id(1), 0, 5).unwrap(), Some(vec![1, 2, 3, 4, 5]));

        // Reads past the end miss rather than fail.
        assert_eq!(cache.read(id(1), 4, 2).unwrap(), None);
        assert_eq!(cache.read(id(2), 0, 1).unwrap(), None);

        cache.remove(id(1)).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_memory_cache_write_at_bounds() {
        let cache = MemoryCache::new();
        assert!(cache.write_at(id(1), 0, &[1]).is_err());

        cache.write_slot(id(1), vec![0; 4]).unwrap();
        assert!(cache.write_at(id(1), 3, &[1, 2]).is_err());
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn test_memory_cache_eviction() {
        // Cache with 10-byte limit.
        let cache = MemoryCache::with_max_size(10);

        cache.write_slot(id(1), vec![1; 5]).unwrap();
        cache.write_slot(id(2), vec![2; 5]).unwrap();
        assert_eq!(cache.size(), 10);

        // Add 3 more bytes, which should evict the first slot.
        cache.write_slot(id(3), vec![3; 3]).unwrap();
        assert_eq!(cache.size(), 8); // 5 + 3.
        assert_eq!(cache.slot_size(id(1)).unwrap(), None);
        assert_eq!(cache.slot_size(id(2)).unwrap(), Some(5));
        assert_eq!(cache.slot_size(id(3)).unwrap(), Some(3));
    }

    #[test]
    fn test_memory_cache_replace_slot() {
        let cache = MemoryCache::new();
        cache.write_slot(id(1), vec![1, 2, 3]).unwrap();
        cache.write_slot(id(1), vec![1, 2, 3, 4, 5]).unwrap();
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.len(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_filesystem_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::new(dir.path().join("meshes")).unwrap();

        assert_eq!(cache.slot_size(id(7)).unwrap(), None);
        assert!(cache.write_at(id(7), 0, &[1]).is_err());

        cache.write_slot(id(7), vec![9, 9, 0, 0, 0, 0]).unwrap();
        assert_eq!(cache.slot_size(id(7)).unwrap(), Some(6));
        cache.write_at(id(7), 2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(cache.read(id(7), 0, 6).unwrap(), Some(vec![9, 9, 1, 2, 3, 4]));
        assert_eq!(cache.read(id(7), 5, 2).unwrap(), None);
        assert!(cache.write_at(id(7), 5, &[1, 2]).is_err());

        // Slots survive reopening the directory.
        let reopened = FilesystemCache::new(cache.dir()).unwrap();
        assert_eq!(reopened.read(id(7), 2, 2).unwrap(), Some(vec![1, 2]));

        reopened.clear().unwrap();
        assert_eq!(cache.slot_size(id(7)).unwrap(), None);
        cache.remove(id(7)).unwrap();
    }
}
