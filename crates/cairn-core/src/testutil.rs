use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::config::RepoOptions;
use crate::crypto::keyfile::KdfParams;
use crate::error::{CairnError, Result};
use crate::id::{FileType, Handle, Id};
use crate::repo::Repository;
use crate::storage::{Backend, FileInfo, ListVisitor};

/// In-memory backend for tests. Cloning yields a second handle to the same
/// store, so a repository can be "reopened" against identical contents.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn create(&self) -> Result<()> {
        Ok(())
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        cancel.check()?;
        self.data
            .lock()
            .unwrap()
            .insert(handle.storage_key(), data.to_vec());
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
        let map = self.data.lock().unwrap();
        let data = map
            .get(&handle.storage_key())
            .ok_or_else(|| CairnError::NotFound(handle.to_string()))?;

        let start = offset as usize;
        if start > data.len() {
            return Err(CairnError::InvalidFormat(format!(
                "offset {offset} beyond end of {handle}"
            )));
        }
        if length == 0 {
            return Ok(data[start..].to_vec());
        }
        let end = start + length as usize;
        if end > data.len() {
            return Err(CairnError::InvalidFormat(format!(
                "short read from {handle}: wanted {length} bytes at {offset}"
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        cancel.check()?;
        let map = self.data.lock().unwrap();
        map.get(&handle.storage_key())
            .map(|d| FileInfo { size: d.len() as u64 })
            .ok_or_else(|| CairnError::NotFound(handle.to_string()))
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        cancel.check()?;
        self.data.lock().unwrap().remove(&handle.storage_key());
        Ok(())
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        cancel.check()?;
        // Snapshot the listing so the visitor may call back into the backend.
        let entries: Vec<(String, u64)> = {
            let map = self.data.lock().unwrap();
            map.iter()
                .map(|(key, data)| (key.clone(), data.len() as u64))
                .collect()
        };
        for (key, size) in entries {
            if t == FileType::Config {
                if key == "config" {
                    visitor(Id([0u8; 32]), size)?;
                }
                continue;
            }
            let Some(rest) = key.strip_prefix(&format!("{}/", t.dirname())) else {
                continue;
            };
            let name = rest.rsplit('/').next().unwrap_or(rest);
            if let Ok(id) = Id::from_hex(name) {
                visitor(id, size)?;
            }
        }
        Ok(())
    }
}

/// Records every load and save passing through, for call-accounting tests.
pub struct CountingBackend<B> {
    inner: B,
    loads: Arc<Mutex<Vec<(Handle, u32, u64)>>>,
    saves: Arc<Mutex<Vec<Handle>>>,
}

impl<B: Backend> CountingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            loads: Arc::new(Mutex::new(Vec::new())),
            saves: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn loads(&self) -> Arc<Mutex<Vec<(Handle, u32, u64)>>> {
        Arc::clone(&self.loads)
    }

    pub fn saves(&self) -> Arc<Mutex<Vec<Handle>>> {
        Arc::clone(&self.saves)
    }
}

impl<B: Backend> Backend for CountingBackend<B> {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        self.saves.lock().unwrap().push(*handle);
        self.inner.save(cancel, handle, data)
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        self.loads.lock().unwrap().push((*handle, length, offset));
        self.inner.load(cancel, handle, length, offset)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        self.inner.remove(cancel, handle)
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        self.inner.list(cancel, t, visitor)
    }
}

/// Fails the first `failures` save calls with a transient error, then
/// behaves normally. Every other operation passes straight through.
pub struct FlakyBackend<B> {
    inner: B,
    remaining: AtomicU32,
}

impl<B: Backend> FlakyBackend<B> {
    pub fn new(inner: B, failures: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(failures),
        }
    }
}

impl<B: Backend> Backend for FlakyBackend<B> {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(CairnError::Transient("injected save failure".into()));
        }
        self.inner.save(cancel, handle, data)
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        self.inner.load(cancel, handle, length, offset)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        self.inner.remove(cancel, handle)
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        self.inner.list(cancel, t, visitor)
    }
}

/// scrypt parameters weak enough for tests.
pub fn weak_kdf() -> KdfParams {
    KdfParams { n: 16, r: 1, p: 1 }
}

/// Repository options suitable for tests: weak KDF, no local cache.
pub fn test_opts() -> RepoOptions {
    RepoOptions {
        kdf: weak_kdf(),
        no_cache: true,
        ..RepoOptions::default()
    }
}

pub const TEST_PASSWORD: &str = "test password";

/// A fresh repository on an in-memory backend.
pub fn test_repo() -> Repository {
    Repository::init(
        Box::new(MemoryBackend::new()),
        &CancelToken::new(),
        TEST_PASSWORD,
        test_opts(),
    )
    .expect("failed to init test repo")
}
