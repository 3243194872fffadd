use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cancel::CancelToken;
use crate::crypto::Key;
use crate::error::{CairnError, Result};
use crate::id::{FileType, Handle, Id};
use crate::storage::Backend;

/// A repository may hold at most this many key files; opening tries them in
/// listing order.
pub const MAX_KEYS: usize = 20;

/// scrypt parameters. The defaults are deliberately slow; tests pass weaker
/// values explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            n: 32768,
            r: 8,
            p: 5,
        }
    }
}

// Bounds rejecting both useless and maliciously expensive KDF parameters
// found in untrusted key files.
const MAX_N: u32 = 1 << 22;
const MAX_R: u32 = 32;
const MAX_P: u32 = 16;
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

impl KdfParams {
    pub fn validate(&self) -> Result<()> {
        if self.n < 2 || self.n > MAX_N || !self.n.is_power_of_two() {
            return Err(CairnError::InvalidFormat(format!(
                "scrypt N out of range: {}",
                self.n
            )));
        }
        if self.r == 0 || self.r > MAX_R {
            return Err(CairnError::InvalidFormat(format!(
                "scrypt r out of range: {}",
                self.r
            )));
        }
        if self.p == 0 || self.p > MAX_P {
            return Err(CairnError::InvalidFormat(format!(
                "scrypt p out of range: {}",
                self.p
            )));
        }
        Ok(())
    }
}

/// On-disk key file, stored as plaintext JSON under `keys/<id>`: scrypt
/// parameters, salt, and the master key sealed by the password-derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Utc>,
    pub username: String,
    pub hostname: String,
    pub kdf: String,
    #[serde(rename = "N")]
    pub n: u32,
    pub r: u32,
    pub p: u32,
    /// base64-encoded salt.
    pub salt: String,
    /// base64-encoded sealed master key payload.
    pub data: String,
}

/// JSON payload sealed inside `KeyFile::data`.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyPayload {
    mac: MacPayload,
    encrypt: String,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MacPayload {
    k: String,
    r: String,
}

/// Seal `master` under `password` and store a new key file.
/// Returns the key file id (the SHA-256 of the stored bytes).
pub fn create_key(
    backend: &dyn Backend,
    cancel: &CancelToken,
    password: &str,
    params: KdfParams,
    master: &Key,
) -> Result<Id> {
    params.validate()?;

    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let user_key = derive_user_key(password, &salt, &params)?;

    let payload = KeyPayload {
        mac: MacPayload {
            k: B64.encode(master.mac.k),
            r: B64.encode(master.mac.r),
        },
        encrypt: B64.encode(master.encrypt),
    };
    let payload_json = Zeroizing::new(serde_json::to_vec(&payload)?);
    let sealed = user_key.seal(&payload_json);

    let file = KeyFile {
        created: Utc::now(),
        username: whoami::username(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        kdf: "scrypt".to_string(),
        n: params.n,
        r: params.r,
        p: params.p,
        salt: B64.encode(&salt),
        data: B64.encode(sealed),
    };

    let bytes = serde_json::to_vec(&file)?;
    let id = Id::hash(&bytes);
    backend.save(cancel, &Handle::new(FileType::Key, id), &bytes)?;
    Ok(id)
}

/// Try `password` against every key file in the repository, in listing order,
/// up to [`MAX_KEYS`]. Returns the first master key that opens, or
/// `WrongPassword` when none matches.
pub fn search_key(
    backend: &dyn Backend,
    cancel: &CancelToken,
    password: &str,
) -> Result<(Id, Key)> {
    let mut ids = Vec::new();
    backend.list(cancel, FileType::Key, &mut |id, _size| {
        ids.push(id);
        Ok(())
    })?;

    for id in ids.into_iter().take(MAX_KEYS) {
        cancel.check()?;
        let file = match load_key(backend, cancel, &id) {
            Ok(f) => f,
            Err(e) => {
                debug!("key file {id}: unreadable, skipping: {e}");
                continue;
            }
        };
        match open_key(&file, password) {
            Ok(key) => return Ok((id, key)),
            Err(e) => debug!("key file {id}: {e}"),
        }
    }
    Err(CairnError::WrongPassword)
}

/// Load and parse one key file.
pub fn load_key(backend: &dyn Backend, cancel: &CancelToken, id: &Id) -> Result<KeyFile> {
    let bytes = backend.load(cancel, &Handle::new(FileType::Key, *id), 0, 0)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decrypt the master key from a key file with the given password.
pub fn open_key(file: &KeyFile, password: &str) -> Result<Key> {
    if file.kdf != "scrypt" {
        return Err(CairnError::InvalidFormat(format!(
            "unknown kdf '{}'",
            file.kdf
        )));
    }
    let params = KdfParams {
        n: file.n,
        r: file.r,
        p: file.p,
    };
    params.validate()?;

    let salt = B64
        .decode(&file.salt)
        .map_err(|e| CairnError::InvalidFormat(format!("key file salt: {e}")))?;
    if salt.len() < MIN_SALT_LEN || salt.len() > MAX_SALT_LEN {
        return Err(CairnError::InvalidFormat(format!(
            "key file salt length {} out of range",
            salt.len()
        )));
    }
    let sealed = B64
        .decode(&file.data)
        .map_err(|e| CairnError::InvalidFormat(format!("key file data: {e}")))?;

    let user_key = derive_user_key(password, &salt, &params)?;
    let payload_json = Zeroizing::new(
        user_key
            .open(&sealed)
            .map_err(|_| CairnError::WrongPassword)?,
    );
    let payload: KeyPayload =
        serde_json::from_slice(&payload_json).map_err(|_| CairnError::WrongPassword)?;

    decode_payload(&payload)
}

fn decode_payload(payload: &KeyPayload) -> Result<Key> {
    let encrypt = B64
        .decode(&payload.encrypt)
        .map_err(|_| CairnError::WrongPassword)?;
    let k = B64.decode(&payload.mac.k).map_err(|_| CairnError::WrongPassword)?;
    let r = B64.decode(&payload.mac.r).map_err(|_| CairnError::WrongPassword)?;
    if encrypt.len() != 32 || k.len() != 16 || r.len() != 16 {
        return Err(CairnError::WrongPassword);
    }
    Ok(Key::from_parts(
        encrypt.try_into().unwrap(),
        k.try_into().unwrap(),
        r.try_into().unwrap(),
    ))
}

/// Derive the key-file sealing key from a password: scrypt yields 64 bytes,
/// split into the encryption key and the two MAC key halves.
fn derive_user_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<Key> {
    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, 64)
        .map_err(|e| CairnError::InvalidFormat(format!("scrypt params: {e}")))?;

    let mut derived = Zeroizing::new([0u8; 64]);
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, derived.as_mut_slice())
        .map_err(|e| CairnError::Other(format!("scrypt: {e}")))?;

    let encrypt: [u8; 32] = derived[..32].try_into().unwrap();
    let k: [u8; 16] = derived[32..48].try_into().unwrap();
    let r: [u8; 16] = derived[48..64].try_into().unwrap();
    Ok(Key::from_parts(encrypt, k, r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{weak_kdf, MemoryBackend};

    #[test]
    fn create_and_search_roundtrip() {
        let backend = MemoryBackend::new();
        let cancel = CancelToken::new();
        let master = Key::generate();

        let id = create_key(&backend, &cancel, "sekrit", weak_kdf(), &master).unwrap();

        let (found_id, found) = search_key(&backend, &cancel, "sekrit").unwrap();
        assert_eq!(found_id, id);
        assert_eq!(found.encrypt, master.encrypt);
        assert_eq!(found.mac.k, master.mac.k);
        assert_eq!(found.mac.r, master.mac.r);
    }

    #[test]
    fn wrong_password_is_auth_error() {
        let backend = MemoryBackend::new();
        let cancel = CancelToken::new();
        create_key(&backend, &cancel, "right", weak_kdf(), &Key::generate()).unwrap();

        assert!(matches!(
            search_key(&backend, &cancel, "wrong"),
            Err(CairnError::WrongPassword)
        ));
    }

    #[test]
    fn empty_repository_has_no_key() {
        let backend = MemoryBackend::new();
        let cancel = CancelToken::new();
        assert!(matches!(
            search_key(&backend, &cancel, "any"),
            Err(CairnError::WrongPassword)
        ));
    }

    #[test]
    fn search_skips_non_matching_keys() {
        let backend = MemoryBackend::new();
        let cancel = CancelToken::new();
        let master_a = Key::generate();
        let master_b = Key::generate();
        create_key(&backend, &cancel, "alpha", weak_kdf(), &master_a).unwrap();
        create_key(&backend, &cancel, "beta", weak_kdf(), &master_b).unwrap();

        let (_, key) = search_key(&backend, &cancel, "beta").unwrap();
        assert_eq!(key.encrypt, master_b.encrypt);
    }

    #[test]
    fn key_file_id_is_hash_of_stored_bytes() {
        let backend = MemoryBackend::new();
        let cancel = CancelToken::new();
        let id = create_key(&backend, &cancel, "pw", weak_kdf(), &Key::generate()).unwrap();

        let bytes = backend
            .load(&cancel, &Handle::new(FileType::Key, id), 0, 0)
            .unwrap();
        assert_eq!(Id::hash(&bytes), id);
    }

    #[test]
    fn rejects_oversized_kdf_params() {
        let params = KdfParams {
            n: 1 << 30,
            r: 8,
            p: 1,
        };
        assert!(params.validate().is_err());
        assert!(KdfParams { n: 100, r: 8, p: 1 }.validate().is_err()); // not a power of two
        assert!(KdfParams { n: 16, r: 0, p: 1 }.validate().is_err());
    }
}
