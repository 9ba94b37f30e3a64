//! Secret encryption for stored credentials.
//!
//! The store only sees opaque blobs; anything implementing [`SecretCipher`]
//! can sit behind it. [`AesGcmCipher`] is the production implementation:
//! AES-256-GCM with a random 12-byte nonce prepended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Opaque encrypt/decrypt service.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM cipher keyed by a 32-byte master key.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(master_key: &[u8]) -> Result<Self, CryptoError> {
        if master_key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: master_key.len(),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(master_key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: master_key.len(),
            }
        })?;
        Ok(Self { cipher })
    }

    /// Build from a hex-encoded key (the `SWITCHBOARD_ENCRYPTION_KEY` format).
    pub fn from_hex(hex_key: &SecretString) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.expose_secret().trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        Self::new(&bytes)
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.append(&mut ciphertext);
        Ok(output)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_SIZE {
            return Err(CryptoError::Decrypt("ciphertext is too short".to_string()));
        }
        let (nonce_bytes, payload) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| CryptoError::Decrypt("authentication failed".to_string()))
    }
}
