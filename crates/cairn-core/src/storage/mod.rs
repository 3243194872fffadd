pub mod limiter;
pub mod local_backend;
pub mod logger;
pub mod retry;
pub mod sema;

use std::collections::HashMap;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::TransportOptions;
use crate::error::{CairnError, Result};
use crate::id::{FileType, Handle, Id};

/// Metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

/// Visitor invoked by `list` with each object's id and size. Listings are
/// unordered.
pub type ListVisitor<'a> = dyn FnMut(Id, u64) -> Result<()> + 'a;

/// Uniform object store beneath the repository: every stored object is
/// addressed by a [`Handle`] and immutable once `save` returns.
pub trait Backend: Send + Sync {
    /// Prepare the store for use (create directory layout where applicable).
    fn create(&self) -> Result<()>;

    /// Store an object. Must be atomic from a reader's viewpoint: a handle is
    /// either fully readable with its final bytes or not visible at all.
    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at `offset`. `length == 0` reads to the end.
    /// Partial reads are mandatory: clients read individual blobs from
    /// within packs. A short read is an error, not a silent truncation.
    fn load(&self, cancel: &CancelToken, handle: &Handle, length: u32, offset: u64)
        -> Result<Vec<u8>>;

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo>;

    /// Delete an object. Removing a missing object succeeds, so retries are
    /// harmless.
    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()>;

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()>;
}

impl Backend for Arc<dyn Backend> {
    fn create(&self) -> Result<()> {
        (**self).create()
    }
    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        (**self).save(cancel, handle, data)
    }
    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        (**self).load(cancel, handle, length, offset)
    }
    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        (**self).stat(cancel, handle)
    }
    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        (**self).remove(cancel, handle)
    }
    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        (**self).list(cancel, t, visitor)
    }
}

/// Factory producing a raw (unwrapped) backend from the location remainder
/// after the scheme prefix.
pub type BackendFactory =
    Box<dyn Fn(&str, &TransportOptions) -> Result<Box<dyn Backend>> + Send + Sync>;

/// Maps URL schemes to backend factories, so the open path stays free of one
/// giant switch and drivers can be registered by consumers.
pub struct Registry {
    factories: HashMap<String, BackendFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in drivers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", |location, _opts| {
            let backend: Box<dyn Backend> = Box::new(local_backend::LocalBackend::new(location)?);
            Ok(backend)
        });
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str, &TransportOptions) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    /// Open the backend named by `location` and dress it in the standard
    /// wrapper stack.
    pub fn open(&self, location: &str, opts: &TransportOptions) -> Result<Box<dyn Backend>> {
        let (scheme, rest) = split_location(location)?;
        let factory = self.factories.get(scheme).ok_or_else(|| {
            CairnError::UnsupportedBackend(format!("no driver registered for scheme '{scheme}'"))
        })?;
        let inner = factory(rest, opts)?;
        Ok(wrap(inner, opts))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Split a repository location into (scheme, remainder).
///
/// Bare paths (`/backups/repo`, `./repo`, `repo`) are local. Prefixed forms
/// use a single-colon scheme (`local:/path`, `sftp:user@host:/path`,
/// `s3:https://endpoint/bucket`); full URLs are validated with [`url::Url`]
/// before their scheme is accepted.
pub fn split_location(location: &str) -> Result<(&str, &str)> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(CairnError::Config("repository location must not be empty".into()));
    }
    if trimmed.starts_with('/') || trimmed.starts_with("./") || trimmed.starts_with("../") {
        return Ok(("local", trimmed));
    }
    if trimmed.contains("://") {
        let parsed = url::Url::parse(trimmed)
            .map_err(|e| CairnError::Config(format!("invalid repository URL '{trimmed}': {e}")))?;
        let scheme_len = parsed.scheme().len();
        return Ok((&trimmed[..scheme_len], trimmed));
    }
    match trimmed.split_once(':') {
        Some((scheme, rest)) if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()) => {
            Ok((scheme, rest))
        }
        _ => Ok(("local", trimmed)),
    }
}

/// Apply the standard wrapper stack, innermost to outermost:
/// rate limiter (transport level) -> logger -> semaphore -> retry.
/// The cache wrapper is added by the repository once the config id is known.
pub fn wrap(inner: Box<dyn Backend>, opts: &TransportOptions) -> Box<dyn Backend> {
    let mut backend = inner;
    if opts.limit_upload.is_some() || opts.limit_download.is_some() {
        backend = Box::new(limiter::LimiterBackend::new(
            backend,
            opts.limit_upload,
            opts.limit_download,
        ));
    }
    backend = Box::new(logger::LoggerBackend::new(backend));
    backend = Box::new(sema::SemaBackend::new(backend, opts.connections));
    backend = Box::new(retry::RetryBackend::new(backend, opts.max_retries));
    backend
}
