use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Upper bound on a single blob's decompressed size. The uncompressed length
/// comes from the authenticated pack header, so this is a second line of
/// defense against corrupt metadata, not the primary one.
const MAX_DECOMPRESS_SIZE: usize = 64 * 1024 * 1024;

/// Blob compression policy. Only repositories at version 2 compress;
/// version 1 repositories must run with `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Off,
    #[default]
    Auto,
    Max,
}

impl CompressionMode {
    fn level(self) -> i32 {
        match self {
            CompressionMode::Off => 0,
            CompressionMode::Auto => 3,
            CompressionMode::Max => 19,
        }
    }
}

impl FromStr for CompressionMode {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(CompressionMode::Off),
            "auto" => Ok(CompressionMode::Auto),
            "max" => Ok(CompressionMode::Max),
            other => Err(CairnError::Config(format!(
                "unknown compression mode '{other}' (expected off, auto, or max)"
            ))),
        }
    }
}

/// Compress a blob with Zstd. Returns `None` when compression is off or when
/// the compressed form is not actually smaller, in which case the blob is
/// stored uncompressed.
pub fn compress(mode: CompressionMode, data: &[u8]) -> Result<Option<Vec<u8>>> {
    if mode == CompressionMode::Off {
        return Ok(None);
    }
    let compressed = zstd::bulk::compress(data, mode.level())
        .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))?;
    if compressed.len() >= data.len() {
        return Ok(None);
    }
    Ok(Some(compressed))
}

/// Decompress a blob. `uncompressed_size` comes from the authenticated pack
/// header and must match exactly.
pub fn decompress(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    if uncompressed_size > MAX_DECOMPRESS_SIZE {
        return Err(CairnError::Decompression(format!(
            "declared size {uncompressed_size} exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    let out = zstd::bulk::decompress(data, uncompressed_size)
        .map_err(|e| CairnError::Decompression(format!("zstd: {e}")))?;
    if out.len() != uncompressed_size {
        return Err(CairnError::Decompression(format!(
            "decompressed to {} bytes, header declared {uncompressed_size}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"abcabcabcabcabcabcabcabc".repeat(64);
        for mode in [CompressionMode::Auto, CompressionMode::Max] {
            let compressed = compress(mode, &data).unwrap().expect("compressible");
            assert!(compressed.len() < data.len());
            assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn off_never_compresses() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert!(compress(CompressionMode::Off, data).unwrap().is_none());
    }

    #[test]
    fn incompressible_data_stays_plain() {
        // Already-compressed bytes rarely shrink further.
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i.wrapping_mul(2654435761)).to_le_bytes()).collect();
        let compressed = zstd::bulk::compress(&data, 3).unwrap();
        assert!(compress(CompressionMode::Auto, &compressed).unwrap().is_none());
    }

    #[test]
    fn decompress_checks_declared_size() {
        let data = b"hello hello hello hello".repeat(32);
        let compressed = compress(CompressionMode::Auto, &data).unwrap().unwrap();
        assert!(decompress(&compressed, data.len() + 1).is_err());
        assert!(decompress(&compressed, usize::MAX).is_err());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("off".parse::<CompressionMode>().unwrap(), CompressionMode::Off);
        assert_eq!("auto".parse::<CompressionMode>().unwrap(), CompressionMode::Auto);
        assert_eq!("max".parse::<CompressionMode>().unwrap(), CompressionMode::Max);
        assert!("best".parse::<CompressionMode>().is_err());
    }
}
