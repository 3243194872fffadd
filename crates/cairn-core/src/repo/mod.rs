pub mod packer_pool;

use std::borrow::Cow;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Cache, CachedBackend};
use crate::cancel::CancelToken;
use crate::chunker::{Chunker, Pol};
use crate::compress::{self, CompressionMode};
use crate::config::RepoOptions;
use crate::crypto::keyfile::{self, KdfParams};
use crate::crypto::Key;
use crate::error::{CairnError, Result};
use crate::id::{BlobType, FileType, Handle, Id};
use crate::index::{Index, MasterIndex};
use crate::pack::FinishedPack;
use crate::storage::Backend;

use self::packer_pool::PackerPool;

/// Persisted at the `config` key, sealed like every non-pack object.
/// Immutable after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: Id,
    /// Keys the chunker's rolling hash so chunk boundaries differ between
    /// repositories.
    pub chunker_polynomial: Pol,
}

/// A handle to an opened repository: orchestrates the blob read and write
/// paths and owns the packer pool, the upload workers, and the master index.
///
/// All public entry points take `&self`; writer parallelism comes from
/// calling `save_blob` on multiple threads.
pub struct Repository {
    backend: Arc<dyn Backend>,
    key: Arc<Key>,
    key_id: Id,
    config: RepoConfig,
    opts: RepoOptions,
    index: Arc<MasterIndex>,
    packers: PackerPool,
    /// Background pack uploads waiting to be joined.
    uploads: Mutex<Vec<JoinHandle<Result<()>>>>,
    cache: Option<Arc<Cache>>,
}

impl Repository {
    /// Initialize a new repository: config, one key file, no packs, no
    /// snapshots.
    pub fn init(
        backend: Box<dyn Backend>,
        cancel: &CancelToken,
        password: &str,
        opts: RepoOptions,
    ) -> Result<Self> {
        opts.validate()?;
        backend.create()?;
        let backend: Arc<dyn Backend> = Arc::from(backend);

        match backend.stat(cancel, &Handle::config()) {
            Ok(_) => return Err(CairnError::AlreadyExists("repository".into())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let config = RepoConfig {
            version: opts.version,
            id: Id::random(),
            chunker_polynomial: Pol::random()?,
        };

        let key = Key::generate();
        let key_id = keyfile::create_key(&backend, cancel, password, opts.kdf, &key)?;

        let sealed = key.seal(&serde_json::to_vec(&config)?);
        backend.save(cancel, &Handle::config(), &sealed)?;
        debug!(repo = %config.id, version = config.version, "initialized repository");

        Self::assemble(backend, key, key_id, config, opts)
    }

    /// Open an existing repository: search the key files for one the
    /// password opens, then read the config.
    pub fn open(
        backend: Box<dyn Backend>,
        cancel: &CancelToken,
        password: &str,
        opts: RepoOptions,
    ) -> Result<Self> {
        opts.validate()?;
        let backend: Arc<dyn Backend> = Arc::from(backend);

        let (key_id, key) = keyfile::search_key(&backend, cancel, password)?;

        let sealed = backend.load(cancel, &Handle::config(), 0, 0).map_err(|e| {
            if e.is_not_found() {
                CairnError::NotFound("repository config".into())
            } else {
                e
            }
        })?;
        let config: RepoConfig = serde_json::from_slice(&key.open(&sealed)?)?;

        if !(1..=2).contains(&config.version) {
            return Err(CairnError::UnsupportedVersion(config.version));
        }
        if opts.compression != CompressionMode::Off && config.version < 2 {
            return Err(CairnError::Config(format!(
                "repository version {} does not support compression",
                config.version
            )));
        }

        Self::assemble(backend, key, key_id, config, opts)
    }

    /// Shared tail of init/open: apply the cache wrapper (the outermost layer
    /// of the backend stack, added here because it is keyed by the config id)
    /// and build the repository value.
    fn assemble(
        backend: Arc<dyn Backend>,
        key: Key,
        key_id: Id,
        config: RepoConfig,
        opts: RepoOptions,
    ) -> Result<Self> {
        let mut backend = backend;
        let mut cache = None;
        if !opts.no_cache {
            match Cache::new(&config.id, opts.cache_dir.clone()) {
                Ok(c) => {
                    let c = Arc::new(c);
                    backend = Arc::new(CachedBackend::new(backend, Arc::clone(&c)));
                    cache = Some(c);
                }
                // A broken cache never blocks repository access.
                Err(e) => warn!("unable to open cache: {e}"),
            }
        }

        Ok(Self {
            backend,
            key: Arc::new(key),
            key_id,
            config,
            packers: PackerPool::new(opts.packer_count),
            opts,
            index: Arc::new(MasterIndex::new()),
            uploads: Mutex::new(Vec::new()),
            cache,
        })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn key_id(&self) -> Id {
        self.key_id
    }

    pub fn index(&self) -> &MasterIndex {
        &self.index
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// A chunker over `reader`, keyed by this repository's polynomial.
    pub fn chunker<R: Read>(&self, reader: R) -> Chunker<R> {
        Chunker::new(reader, self.config.chunker_polynomial)
    }

    /// Store one blob. Returns its id and whether it was new.
    ///
    /// Duplicate content (already indexed, claimed by a concurrent writer, or
    /// sitting in a not-yet-uploaded packer) is never stored twice; the
    /// second call returns the same id with no backend traffic.
    ///
    /// Returns after the blob is recorded in memory, possibly before its pack
    /// is uploaded; `flush` waits for all outstanding packs and makes the
    /// index durable.
    pub fn save_blob(
        &self,
        cancel: &CancelToken,
        blob_type: BlobType,
        data: &[u8],
    ) -> Result<(Id, bool)> {
        cancel.check()?;
        let id = Id::hash(data);

        if self.index.has(blob_type, &id) {
            return Ok((id, false));
        }
        if !self.index.add_pending(blob_type, &id) {
            return Ok((id, false));
        }

        // The blob is claimed; on any failure below the claim must be
        // released or later writes of the same content would be dropped.
        match self.store_claimed_blob(cancel, blob_type, id, data) {
            Ok(()) => Ok((id, true)),
            Err(e) => {
                self.index.remove_pending(blob_type, &id);
                Err(e)
            }
        }
    }

    fn store_claimed_blob(
        &self,
        cancel: &CancelToken,
        blob_type: BlobType,
        id: Id,
        data: &[u8],
    ) -> Result<()> {
        // Compression exists from repository version 2 on. Incompressible
        // blobs are stored plain even in auto/max mode.
        let (payload, uncompressed_length): (Cow<[u8]>, Option<u32>) =
            if self.config.version >= 2 {
                match compress::compress(self.opts.compression, data)? {
                    Some(compressed) => (Cow::Owned(compressed), Some(data.len() as u32)),
                    None => (Cow::Borrowed(data), None),
                }
            } else {
                (Cow::Borrowed(data), None)
            };

        let sealed = self.key.seal(&payload);

        let mut packer = self.packers.acquire();
        packer.add(blob_type, id, &sealed, uncompressed_length);

        if packer.size() < self.opts.pack_size_bytes() {
            self.packers.release(packer);
            return Ok(());
        }

        // Pack is full: finalize on this thread, upload in the background.
        let finished = packer.finalize(&self.key);
        self.packers.release(packer);
        self.upload_pack(cancel, finished?)
    }

    /// Schedule a finished pack for upload on a background thread, keeping
    /// the number of in-flight uploads bounded.
    fn upload_pack(&self, cancel: &CancelToken, pack: FinishedPack) -> Result<()> {
        self.reap_uploads(false)?;

        let backend = Arc::clone(&self.backend);
        let index = Arc::clone(&self.index);
        let cancel = cancel.clone();
        let handle = std::thread::spawn(move || -> Result<()> {
            let FinishedPack { id, bytes, blobs } = pack;
            let blob_count = blobs.len();
            if let Err(e) = backend.save(&cancel, &Handle::new(FileType::Data, id), &bytes) {
                // The pack bytes die with this thread. Release the claims so
                // a later save_blob of the same content stores it again,
                // mirroring the synchronous failure path in save_blob.
                for blob in &blobs {
                    index.remove_pending(blob.blob_type, &blob.id);
                }
                return Err(e);
            }
            // Acknowledged: the pack's blobs become resolvable.
            index.store_pack(id, blobs)?;
            debug!(pack = %id, blobs = blob_count, "uploaded pack");
            Ok(())
        });
        self.uploads.lock().unwrap().push(handle);
        Ok(())
    }

    /// Join finished upload threads, propagating the first error. With
    /// `wait_all`, blocks until every upload has landed; otherwise blocks
    /// only when the in-flight cap is reached.
    fn reap_uploads(&self, wait_all: bool) -> Result<()> {
        let mut uploads = self.uploads.lock().unwrap();
        let mut first_err: Option<CairnError> = None;

        let mut i = 0;
        while i < uploads.len() {
            if wait_all || uploads[i].is_finished() {
                let handle = uploads.swap_remove(i);
                if let Err(e) = join_upload(handle) {
                    first_err.get_or_insert(e);
                }
            } else {
                i += 1;
            }
        }

        if !wait_all {
            while uploads.len() >= self.opts.upload_concurrency {
                let handle = uploads.remove(0);
                if let Err(e) = join_upload(handle) {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for all outstanding packs to be acknowledged and their index
    /// entries durable: finalize partial packers, join every upload, then
    /// persist the in-memory index.
    pub fn flush(&self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        for mut packer in self.packers.drain_pending() {
            let finished = packer.finalize(&self.key)?;
            self.upload_pack(cancel, finished)?;
        }
        self.reap_uploads(true)?;
        self.save_index(cancel)?;
        Ok(())
    }

    /// Persist the current in-memory index under a fresh random id. No-op
    /// when the session has not added any packs.
    pub fn save_index(&self, cancel: &CancelToken) -> Result<Option<Id>> {
        let Some(mut snapshot) = self.index.finalize_open() else {
            return Ok(None);
        };

        let encoded = snapshot.encode()?;
        let sealed = self.key.seal(&encoded);
        let id = Id::random();

        match self.backend.save(cancel, &Handle::new(FileType::Index, id), &sealed) {
            Ok(()) => {
                snapshot.set_id(id)?;
                self.index.insert(snapshot)?;
                debug!(index = %id, "saved index");
                Ok(Some(id))
            }
            Err(e) => {
                // Keep the entries resolvable in memory even though the
                // upload failed; a later flush retries with a new id.
                self.index.insert(snapshot)?;
                Err(e)
            }
        }
    }

    /// Read all index files, decrypt, and merge them into the master index.
    pub fn load_index(&self, cancel: &CancelToken) -> Result<()> {
        let mut ids = Vec::new();
        self.backend.list(cancel, FileType::Index, &mut |id, _size| {
            ids.push(id);
            Ok(())
        })?;

        for id in ids {
            cancel.check()?;
            let sealed = self
                .backend
                .load(cancel, &Handle::new(FileType::Index, id), 0, 0)?;
            let mut index = Index::decode(&self.key.open(&sealed)?)?;
            index.set_id(id)?;
            self.index.insert(index)?;
        }
        self.index.merge_final_indexes();
        debug!(
            packs = self.index.pack_count(),
            blobs = self.index.blob_count(),
            "loaded index"
        );
        Ok(())
    }

    /// Read one blob: look up its pack location, issue a single partial
    /// load, open, decompress, and verify its id.
    pub fn load_blob(&self, cancel: &CancelToken, blob_type: BlobType, id: &Id) -> Result<Vec<u8>> {
        cancel.check()?;
        let loc = self
            .index
            .lookup(blob_type, id)
            .ok_or_else(|| CairnError::NotFound(format!("blob {id}")))?;

        let sealed = self.backend.load(
            cancel,
            &Handle::new(FileType::Data, loc.pack),
            loc.length,
            loc.offset,
        )?;
        let plaintext = self.key.open(&sealed)?;
        let plaintext = match loc.uncompressed_length {
            Some(n) => compress::decompress(&plaintext, n as usize)?,
            None => plaintext,
        };

        if Id::hash(&plaintext) != *id {
            return Err(CairnError::Integrity(format!(
                "blob {id}: plaintext hash mismatch"
            )));
        }
        Ok(plaintext)
    }

    /// Seal and store a top-level object (snapshot, lock). The file is named
    /// by the SHA-256 of its stored bytes.
    pub fn save_file(&self, cancel: &CancelToken, t: FileType, plaintext: &[u8]) -> Result<Id> {
        let sealed = self.key.seal(plaintext);
        let id = Id::hash(&sealed);
        self.backend.save(cancel, &Handle::new(t, id), &sealed)?;
        Ok(id)
    }

    /// Load and open a top-level object.
    pub fn load_file(&self, cancel: &CancelToken, t: FileType, id: &Id) -> Result<Vec<u8>> {
        let sealed = self.backend.load(cancel, &Handle::new(t, *id), 0, 0)?;
        self.key.open(&sealed)
    }

    /// Remove a top-level object.
    pub fn remove_file(&self, cancel: &CancelToken, t: FileType, id: &Id) -> Result<()> {
        self.backend.remove(cancel, &Handle::new(t, *id))
    }

    /// Enumerate objects of one kind. Listings are unordered.
    pub fn list(
        &self,
        cancel: &CancelToken,
        t: FileType,
        visitor: &mut dyn FnMut(Id, u64) -> Result<()>,
    ) -> Result<()> {
        self.backend.list(cancel, t, visitor)
    }

    /// Add another key file for `password`, sealed around the same master
    /// key. Fails once the repository holds [`keyfile::MAX_KEYS`] keys.
    pub fn add_key(&self, cancel: &CancelToken, password: &str, params: KdfParams) -> Result<Id> {
        let mut count = 0usize;
        self.backend.list(cancel, FileType::Key, &mut |_, _| {
            count += 1;
            Ok(())
        })?;
        if count >= keyfile::MAX_KEYS {
            return Err(CairnError::Config(format!(
                "repository already has the maximum of {} keys",
                keyfile::MAX_KEYS
            )));
        }
        keyfile::create_key(&self.backend, cancel, password, params, &self.key)
    }
}

fn join_upload(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| CairnError::Other("pack upload thread panicked".into()))?
}
