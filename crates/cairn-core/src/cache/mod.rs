use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{CairnError, Result};
use crate::id::{FileType, Handle, Id};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Range requests starting within this window of the pack front may trigger
/// a whole-pack readahead.
const READAHEAD_WINDOW: u64 = 64 * 1024 * 1024;

/// Packs larger than this are never fetched whole; only the requested range
/// is served. Constructor-configurable.
pub const DEFAULT_READAHEAD_LIMIT: u64 = 32 * 1024 * 1024;

/// Local-disk cache for one repository, keyed by the repository config id.
///
/// Small object kinds (`index`, `snapshot`) are stored as full copies; pack
/// data is stored either whole (after a readahead) or as range slabs keyed
/// by (pack id, offset, length).
pub struct Cache {
    base: PathBuf,
    path: PathBuf,
    readahead_limit: u64,
}

impl Cache {
    /// Open (creating if needed) the cache directory for `repo_id` under
    /// `base`, defaulting to the platform cache directory.
    pub fn new(repo_id: &Id, base: Option<PathBuf>) -> Result<Self> {
        Self::with_readahead_limit(repo_id, base, DEFAULT_READAHEAD_LIMIT)
    }

    pub fn with_readahead_limit(
        repo_id: &Id,
        base: Option<PathBuf>,
        readahead_limit: u64,
    ) -> Result<Self> {
        let base = match base {
            Some(dir) => dir,
            None => dirs::cache_dir()
                .ok_or_else(|| {
                    CairnError::Config("no cache directory available on this platform".into())
                })?
                .join("cairn"),
        };
        let path = base.join(repo_id.to_hex());
        for sub in ["index", "snapshots", "data"] {
            fs::create_dir_all(path.join(sub))?;
        }
        Ok(Self {
            base,
            path,
            readahead_limit,
        })
    }

    /// File types cached as full copies.
    pub fn is_cacheable(t: FileType) -> bool {
        matches!(t, FileType::Index | FileType::Snapshot)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Sibling cache directories belonging to other repositories. Used by
    /// caller-driven cleanup; nothing is removed automatically.
    pub fn old(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path() != self.path {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn file_path(&self, handle: &Handle) -> PathBuf {
        self.path.join(handle.storage_key())
    }

    fn slab_path(&self, id: &Id, offset: u64, length: u32) -> PathBuf {
        self.path
            .join("data")
            .join(id.shard_prefix())
            .join(format!("{}-{offset}-{length}", id.to_hex()))
    }

    /// Read a cached full copy. `None` on miss.
    fn load_full(&self, handle: &Handle) -> Option<Vec<u8>> {
        fs::read(self.file_path(handle)).ok()
    }

    /// Read a range out of a cached full copy. `None` on miss or when the
    /// cached file is too short to cover the range.
    fn load_range(&self, handle: &Handle, length: u32, offset: u64) -> Option<Vec<u8>> {
        let mut file = fs::File::open(self.file_path(handle)).ok()?;
        let size = file.metadata().ok()?.len();
        if length == 0 {
            if offset > size {
                return None;
            }
            let mut buf = Vec::new();
            file.seek(SeekFrom::Start(offset)).ok()?;
            file.read_to_end(&mut buf).ok()?;
            return Some(buf);
        }
        if offset + length as u64 > size {
            return None;
        }
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).ok()?;
        Some(buf)
    }

    fn load_slab(&self, id: &Id, offset: u64, length: u32) -> Option<Vec<u8>> {
        let path = self.slab_path(id, offset, length);
        let data = fs::read(path).ok()?;
        if data.len() != length as usize {
            return None;
        }
        Some(data)
    }

    /// Atomically write a cache file (temp sibling + rename).
    fn store(&self, path: &std::path::Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp{:08x}", rand::thread_rng().gen::<u32>()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn store_full(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        self.store(&self.file_path(handle), data)
    }

    fn store_slab(&self, id: &Id, offset: u64, data: &[u8]) -> Result<()> {
        self.store(&self.slab_path(id, offset, data.len() as u32), data)
    }

    /// Drop every cached form of a handle: the full copy and, for packs, any
    /// range slabs.
    fn evict(&self, handle: &Handle) {
        let _ = fs::remove_file(self.file_path(handle));
        if handle.file_type != FileType::Data {
            return;
        }
        let prefix = format!("{}-", handle.id.to_hex());
        let shard = self.path.join("data").join(handle.id.shard_prefix());
        let Ok(entries) = fs::read_dir(shard) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Serves reads from the local cache, falling back to (and populating from)
/// the inner backend on miss.
pub struct CachedBackend {
    inner: Arc<dyn Backend>,
    cache: Arc<Cache>,
    /// Packs currently being fetched whole in the background.
    prefetching: Arc<Mutex<HashSet<Id>>>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn Backend>, cache: Arc<Cache>) -> Self {
        Self {
            inner,
            cache,
            prefetching: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Readahead policy: fetch the whole pack in the background when the
    /// requested range lies within the front window and the pack is small
    /// enough, so later reads from the same pack stay local.
    fn maybe_prefetch(&self, cancel: &CancelToken, handle: &Handle, offset: u64) {
        if offset >= READAHEAD_WINDOW {
            return;
        }
        let Ok(info) = self.inner.stat(cancel, handle) else {
            return;
        };
        if info.size > self.cache.readahead_limit {
            return;
        }
        {
            let mut in_flight = self.prefetching.lock().unwrap();
            if !in_flight.insert(handle.id) {
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        let cache = Arc::clone(&self.cache);
        let prefetching = Arc::clone(&self.prefetching);
        let cancel = cancel.clone();
        let handle = *handle;
        std::thread::spawn(move || {
            match inner.load(&cancel, &handle, 0, 0) {
                Ok(data) => {
                    if let Err(e) = cache.store_full(&handle, &data) {
                        debug!("cache: failed to store prefetched pack {handle}: {e}");
                    }
                }
                Err(e) => debug!("cache: prefetch of {handle} failed: {e}"),
            }
            prefetching.lock().unwrap().remove(&handle.id);
        });
    }

    fn load_data(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        // Whole pack cached (from a previous readahead)?
        if let Some(data) = self.cache.load_range(handle, length, offset) {
            return Ok(data);
        }
        // Exact range slab?
        if length > 0 {
            if let Some(data) = self.cache.load_slab(&handle.id, offset, length) {
                return Ok(data);
            }
        }

        self.maybe_prefetch(cancel, handle, offset);

        let data = self.inner.load(cancel, handle, length, offset)?;
        if length > 0 {
            if let Err(e) = self.cache.store_slab(&handle.id, offset, &data) {
                debug!("cache: failed to store slab for {handle}: {e}");
            }
        }
        Ok(data)
    }

    fn load_cacheable(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let full = match self.cache.load_full(handle) {
            Some(data) => data,
            None => {
                debug!("cache miss for {handle}");
                let data = self.inner.load(cancel, handle, 0, 0)?;
                if let Err(e) = self.cache.store_full(handle, &data) {
                    warn!("cache: failed to store {handle}: {e}");
                }
                data
            }
        };

        if length == 0 && offset == 0 {
            return Ok(full);
        }
        let start = offset as usize;
        let end = if length == 0 {
            full.len()
        } else {
            start + length as usize
        };
        if start > full.len() || end > full.len() {
            return Err(CairnError::InvalidFormat(format!(
                "short read from {handle}: wanted {length} bytes at {offset}, file has {}",
                full.len()
            )));
        }
        Ok(full[start..end].to_vec())
    }
}

impl Backend for CachedBackend {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        self.inner.save(cancel, handle, data)?;
        if Cache::is_cacheable(handle.file_type) {
            if let Err(e) = self.cache.store_full(handle, data) {
                warn!("cache: failed to store {handle} after save: {e}");
            }
        }
        Ok(())
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        if Cache::is_cacheable(handle.file_type) {
            self.load_cacheable(cancel, handle, length, offset)
        } else if handle.file_type == FileType::Data {
            self.load_data(cancel, handle, length, offset)
        } else {
            self.inner.load(cancel, handle, length, offset)
        }
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        self.inner.remove(cancel, handle)?;
        self.cache.evict(handle);
        Ok(())
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        self.inner.list(cancel, t, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CountingBackend, MemoryBackend};
    use std::time::{Duration, Instant};

    fn test_cache(readahead_limit: u64) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::with_readahead_limit(
            &Id::hash(b"repo"),
            Some(dir.path().to_path_buf()),
            readahead_limit,
        )
        .unwrap();
        (dir, cache)
    }

    #[test]
    fn cacheable_loads_hit_inner_once() {
        let (_dir, cache) = test_cache(0);
        let counting = CountingBackend::new(MemoryBackend::new());
        let loads = counting.loads();
        let backend = CachedBackend::new(Arc::new(counting), Arc::new(cache));
        let cancel = CancelToken::new();

        let handle = Handle::new(FileType::Index, Id::hash(b"idx"));
        backend.save(&cancel, &handle, b"index bytes").unwrap();

        assert_eq!(backend.load(&cancel, &handle, 0, 0).unwrap(), b"index bytes");
        assert_eq!(backend.load(&cancel, &handle, 5, 0).unwrap(), b"index");
        // Both reads were served from the write-through cache copy.
        assert!(loads.lock().unwrap().is_empty());
    }

    #[test]
    fn cache_miss_populates_from_inner() {
        let (_dir, cache) = test_cache(0);
        let inner = MemoryBackend::new();
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Snapshot, Id::hash(b"snap"));
        inner.save(&cancel, &handle, b"snapshot").unwrap();

        let counting = CountingBackend::new(inner);
        let loads = counting.loads();
        let backend = CachedBackend::new(Arc::new(counting), Arc::new(cache));

        assert_eq!(backend.load(&cancel, &handle, 0, 0).unwrap(), b"snapshot");
        assert_eq!(loads.lock().unwrap().len(), 1);
        // Second read is local.
        assert_eq!(backend.load(&cancel, &handle, 0, 0).unwrap(), b"snapshot");
        assert_eq!(loads.lock().unwrap().len(), 1);
    }

    #[test]
    fn pack_range_slabs_are_reused() {
        let (_dir, cache) = test_cache(0); // readahead disabled
        let inner = MemoryBackend::new();
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"pack"));
        inner.save(&cancel, &handle, &vec![7u8; 4096]).unwrap();

        let counting = CountingBackend::new(inner);
        let loads = counting.loads();
        let backend = CachedBackend::new(Arc::new(counting), Arc::new(cache));

        assert_eq!(backend.load(&cancel, &handle, 100, 50).unwrap(), vec![7u8; 100]);
        assert_eq!(backend.load(&cancel, &handle, 100, 50).unwrap(), vec![7u8; 100]);
        // One remote range read; the repeat came from the slab.
        let recorded = loads.lock().unwrap();
        assert_eq!(
            recorded
                .iter()
                .filter(|(h, _, _)| h.file_type == FileType::Data)
                .count(),
            1
        );
    }

    #[test]
    fn readahead_caches_the_whole_pack() {
        let (_dir, cache) = test_cache(1024 * 1024);
        let inner = MemoryBackend::new();
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"pack"));
        inner.save(&cancel, &handle, &vec![9u8; 8192]).unwrap();

        let backend = CachedBackend::new(Arc::new(inner), Arc::new(cache));
        assert_eq!(backend.load(&cancel, &handle, 16, 0).unwrap(), vec![9u8; 16]);

        // The whole pack lands in the cache in the background.
        let path = backend.cache.file_path(&handle);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fs::read(&path).unwrap(), vec![9u8; 8192]);
    }

    #[test]
    fn oversized_packs_are_not_prefetched() {
        let (_dir, cache) = test_cache(1024); // 1 KiB limit
        let inner = MemoryBackend::new();
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"big"));
        inner.save(&cancel, &handle, &vec![1u8; 8192]).unwrap();

        let backend = CachedBackend::new(Arc::new(inner), Arc::new(cache));
        backend.load(&cancel, &handle, 16, 0).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!backend.cache.file_path(&handle).exists());
    }

    #[test]
    fn remove_evicts_cached_copies() {
        let (_dir, cache) = test_cache(0);
        let backend = CachedBackend::new(Arc::new(MemoryBackend::new()), Arc::new(cache));
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Index, Id::hash(b"idx"));
        backend.save(&cancel, &handle, b"bytes").unwrap();
        assert!(backend.cache.file_path(&handle).exists());

        backend.remove(&cancel, &handle).unwrap();
        assert!(!backend.cache.file_path(&handle).exists());
        assert!(backend.load(&cancel, &handle, 0, 0).is_err());
    }

    #[test]
    fn old_lists_sibling_repository_caches() {
        let dir = tempfile::tempdir().unwrap();
        let base = Some(dir.path().to_path_buf());
        let ours = Cache::new(&Id::hash(b"ours"), base.clone()).unwrap();
        let _theirs = Cache::new(&Id::hash(b"theirs"), base).unwrap();

        let old = ours.old().unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(
            old[0].file_name().unwrap().to_str().unwrap(),
            Id::hash(b"theirs").to_hex()
        );
    }
}
