//! Authenticated encryption for credential records at rest.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// AES-GCM nonce length in bytes, prepended to every sealed blob.
pub const NONCE_LEN: usize = 12;

/// Derives the 256-bit store key from the application secret.
///
/// The secret is hashed exactly once; the same secret always yields the same
/// key, so rotating the secret invalidates every stored record.
pub fn derive_key(app_secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(app_secret.as_bytes());
    digest.into()
}

/// AES-256-GCM sealer for the credential store.
///
/// `seal` produces `nonce || ciphertext+tag`; `open` verifies the tag and
/// fails closed, returning `None` for anything that does not authenticate.
#[derive(Clone)]
pub struct SealedBox {
    cipher: Aes256Gcm,
}

impl SealedBox {
    pub fn new(app_secret: &str) -> Self {
        let key = derive_key(app_secret);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Encrypt a plaintext with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| GatewayError::Crypto(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed blob. Returns `None` on a short blob or a failed
    /// integrity check; callers treat that as "record absent".
    pub fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return None;
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce_array: [u8; NONCE_LEN] = nonce_bytes.try_into().ok()?;
        let nonce = Nonce::from(nonce_array);

        self.cipher.decrypt(&nonce, ciphertext).ok()
    }
}
