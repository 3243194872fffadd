use std::path::PathBuf;

use crate::compress::CompressionMode;
use crate::crypto::keyfile::KdfParams;
use crate::error::{CairnError, Result};

pub const DEFAULT_PACK_SIZE_MIB: u32 = 16;
pub const MAX_PACK_SIZE_MIB: u32 = 128;

/// Size of the in-flight packer pool. Each writer task borrows one packer at
/// a time, so this also bounds writer parallelism on the hot path.
pub const DEFAULT_PACKER_COUNT: usize = 4;

/// Maximum number of background pack upload threads.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// Default concurrent-call cap applied by the semaphore wrapper.
pub const DEFAULT_CONNECTIONS: usize = 5;

/// Default attempt budget for the retry wrapper.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Options a repository consumer supplies when initializing or opening.
#[derive(Debug, Clone)]
pub struct RepoOptions {
    /// Repository format version written by `init` (1 or 2). Version 2 adds
    /// blob compression.
    pub version: u32,
    /// Target pack size in MiB (default 16, max 128).
    pub pack_size_mib: u32,
    /// Blob compression policy; anything but `Off` requires repo version 2.
    pub compression: CompressionMode,
    /// Root directory for the local cache. Defaults to the platform cache
    /// directory.
    pub cache_dir: Option<PathBuf>,
    /// Disable the local cache entirely.
    pub no_cache: bool,
    pub packer_count: usize,
    pub upload_concurrency: usize,
    /// scrypt parameters for new key files.
    pub kdf: KdfParams,
}

impl Default for RepoOptions {
    fn default() -> Self {
        Self {
            version: 2,
            pack_size_mib: DEFAULT_PACK_SIZE_MIB,
            compression: CompressionMode::default(),
            cache_dir: None,
            no_cache: false,
            packer_count: DEFAULT_PACKER_COUNT,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            kdf: KdfParams::default(),
        }
    }
}

impl RepoOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.version) {
            return Err(CairnError::Config(format!(
                "unknown repository version {}",
                self.version
            )));
        }
        if self.compression != CompressionMode::Off && self.version < 2 {
            return Err(CairnError::Config(
                "compression requires repository version 2".into(),
            ));
        }
        if self.pack_size_mib == 0 || self.pack_size_mib > MAX_PACK_SIZE_MIB {
            return Err(CairnError::Config(format!(
                "pack size {} MiB out of range (1..={} MiB)",
                self.pack_size_mib, MAX_PACK_SIZE_MIB
            )));
        }
        if self.packer_count == 0 || self.upload_concurrency == 0 {
            return Err(CairnError::Config(
                "packer count and upload concurrency must be at least 1".into(),
            ));
        }
        self.kdf.validate()
    }

    pub fn pack_size_bytes(&self) -> usize {
        self.pack_size_mib as usize * 1024 * 1024
    }
}

/// Per-backend transport knobs consumed by the wrapper stack.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Concurrent-call cap enforced by the semaphore wrapper.
    pub connections: usize,
    /// Upload rate limit in bytes per second.
    pub limit_upload: Option<u64>,
    /// Download rate limit in bytes per second.
    pub limit_download: Option<u64>,
    /// Attempt budget for the retry wrapper.
    pub max_retries: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            limit_upload: None,
            limit_download: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        RepoOptions::default().validate().unwrap();
    }

    #[test]
    fn pack_size_bounds() {
        let mut opts = RepoOptions::default();
        opts.pack_size_mib = 0;
        assert!(opts.validate().is_err());
        opts.pack_size_mib = MAX_PACK_SIZE_MIB;
        assert!(opts.validate().is_ok());
        opts.pack_size_mib = MAX_PACK_SIZE_MIB + 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn pack_size_conversion() {
        let opts = RepoOptions::default();
        assert_eq!(opts.pack_size_bytes(), 16 * 1024 * 1024);
    }
}
