use std::fmt;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{CairnError, Result};

/// A 32-byte object identifier: the SHA-256 of the content it names
/// (blob plaintext for blobs, raw file bytes for top-level objects).
/// Rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; 32]);

impl Id {
    /// Compute the SHA-256 of `data`.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// A fresh random ID from OS entropy (repository ids, finalized indexes).
    pub fn random() -> Self {
        let mut out = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Id(out)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| CairnError::InvalidFormat(format!("invalid hex id '{s}': {e}")))?;
        if raw.len() != 32 {
            return Err(CairnError::InvalidFormat(format!(
                "id must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(Id(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for data shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

// Ids appear in sealed JSON objects as lowercase hex strings.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Kind tag for every object stored in the backend. Determines directory
/// placement and handling rules (caching, key search, sharding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Config,
    Index,
    Snapshot,
    Key,
    Lock,
    /// Pack file.
    Data,
}

impl FileType {
    /// Backend directory for this file type. Config lives at the root.
    pub fn dirname(&self) -> &'static str {
        match self {
            FileType::Config => "",
            FileType::Index => "index",
            FileType::Snapshot => "snapshots",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Data => "data",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Config => "config",
            FileType::Index => "index",
            FileType::Snapshot => "snapshot",
            FileType::Key => "key",
            FileType::Lock => "lock",
            FileType::Data => "data",
        };
        write!(f, "{s}")
    }
}

/// The address of one stored object: (FileType, Id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub id: Id,
}

impl Handle {
    pub fn new(file_type: FileType, id: Id) -> Self {
        Self { file_type, id }
    }

    /// The config file is a singleton; its handle carries a zero id.
    pub fn config() -> Self {
        Self {
            file_type: FileType::Config,
            id: Id([0u8; 32]),
        }
    }

    /// `/`-separated backend key for this handle.
    ///
    /// Packs are sharded into 256 directories by their first id byte:
    /// `data/<first-2-hex>/<hex-id>`.
    pub fn storage_key(&self) -> String {
        match self.file_type {
            FileType::Config => "config".to_string(),
            FileType::Data => format!("data/{}/{}", self.id.shard_prefix(), self.id.to_hex()),
            t => format!("{}/{}", t.dirname(), self.id.to_hex()),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.file_type, self.id)
    }
}

/// Kind tag for per-chunk content inside packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    /// File-content chunk.
    Data,
    /// Directory metadata chunk (a JSON document naming child nodes).
    Tree,
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Data => write!(f, "data"),
            BlobType::Tree => write!(f, "tree"),
        }
    }
}
