pub mod keyfile;

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes256};
use poly1305::Poly1305;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CairnError, Result};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const IV_SIZE: usize = 16;
pub const MAC_SIZE: usize = 16;
/// Bytes added to every plaintext by [`Key::seal`]: IV plus MAC.
pub const EXTENSION: usize = IV_SIZE + MAC_SIZE;

/// Key material for Poly1305-AES: `k` feeds AES-128 to derive the per-message
/// pad from the IV, `r` is the polynomial evaluation point (clamped by the
/// Poly1305 implementation).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MacKey {
    pub k: [u8; 16],
    pub r: [u8; 16],
}

/// The repository master key: a 32-byte AES-256 encryption key and a 32-byte
/// MAC key, generated together and never stored in plaintext. Zeroized on
/// drop so key material does not linger in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    pub encrypt: [u8; 32],
    pub mac: MacKey,
}

impl Key {
    /// Generate a fresh random master key from OS entropy.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut encrypt = [0u8; 32];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        rng.fill_bytes(&mut encrypt);
        rng.fill_bytes(&mut k);
        rng.fill_bytes(&mut r);
        Self {
            encrypt,
            mac: MacKey { k, r },
        }
    }

    pub fn from_parts(encrypt: [u8; 32], k: [u8; 16], r: [u8; 16]) -> Self {
        Self {
            encrypt,
            mac: MacKey { k, r },
        }
    }

    /// Seal a plaintext: `[IV : 16][AES-256-CTR ciphertext][Poly1305-AES MAC : 16]`.
    /// The IV is freshly random for every call.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let mut out = Vec::with_capacity(plaintext.len() + EXTENSION);
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);

        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.encrypt),
            GenericArray::from_slice(&iv),
        );
        cipher.apply_keystream(&mut out[IV_SIZE..]);

        let mac = poly1305_aes(&self.mac, &iv, &out[IV_SIZE..]);
        out.extend_from_slice(&mac);
        out
    }

    /// Open a sealed ciphertext. The MAC is verified in constant time before
    /// any byte is decrypted; a mismatch is an integrity failure, never
    /// retried and never silently ignored.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < EXTENSION {
            return Err(CairnError::Integrity(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let iv: [u8; IV_SIZE] = data[..IV_SIZE].try_into().unwrap();
        let ciphertext = &data[IV_SIZE..data.len() - MAC_SIZE];
        let mac = &data[data.len() - MAC_SIZE..];

        let computed = poly1305_aes(&self.mac, &iv, ciphertext);
        if computed[..].ct_eq(mac).unwrap_u8() != 1 {
            return Err(CairnError::Integrity("ciphertext MAC mismatch".into()));
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.encrypt),
            GenericArray::from_slice(&iv),
        );
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    /// Ciphertext length produced by sealing `plaintext_len` bytes.
    pub fn ciphertext_len(plaintext_len: usize) -> usize {
        plaintext_len + EXTENSION
    }
}

/// Poly1305-AES over `msg`: the one-time pad half of the Poly1305 key is
/// AES-128(k, IV), the evaluation point is `r`.
fn poly1305_aes(mac: &MacKey, iv: &[u8; IV_SIZE], msg: &[u8]) -> [u8; MAC_SIZE] {
    let mut pad = GenericArray::clone_from_slice(iv);
    Aes128::new(GenericArray::from_slice(&mac.k)).encrypt_block(&mut pad);

    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&mac.r);
    key[16..].copy_from_slice(&pad);

    let tag = Poly1305::new(GenericArray::from_slice(&key)).compute_unpadded(msg);
    key.zeroize();
    tag.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = Key::generate();
        for len in [0usize, 1, 16, 1024, 65536] {
            let plaintext = vec![0x5Au8; len];
            let sealed = key.seal(&plaintext);
            assert_eq!(sealed.len(), plaintext.len() + EXTENSION);
            assert_eq!(key.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn fresh_iv_per_seal() {
        let key = Key::generate();
        let a = key.seal(b"same plaintext");
        let b = key.seal(b"same plaintext");
        assert_ne!(a, b);
        assert_ne!(&a[..IV_SIZE], &b[..IV_SIZE]);
    }

    #[test]
    fn open_rejects_any_flipped_bit() {
        let key = Key::generate();
        let sealed = key.seal(b"integrity protected payload");
        for pos in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[pos] ^= 0x01;
            let err = key.open(&tampered).unwrap_err();
            assert!(
                matches!(err, CairnError::Integrity(_)),
                "flip at {pos} not detected"
            );
        }
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = Key::generate().seal(b"secret");
        let other = Key::generate();
        assert!(matches!(
            other.open(&sealed),
            Err(CairnError::Integrity(_))
        ));
    }

    #[test]
    fn open_rejects_truncated_input() {
        let key = Key::generate();
        assert!(key.open(&[0u8; EXTENSION - 1]).is_err());
        assert!(key.open(b"").is_err());
    }
}
