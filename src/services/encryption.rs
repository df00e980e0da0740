use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for work unit payloads.
///
/// Queue entries carry invoice XML and tax IDs, so they only ever leave the
/// process as sealed, base64-encoded text.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Encrypt data, returning nonce (12 bytes) prepended to ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(output)
    }

    /// Decrypt data where the first 12 bytes are the nonce.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }

    /// Serialize `value` to JSON, encrypt it and base64 the result.
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<String, EncryptionError> {
        let json = serde_json::to_vec(value)?;
        let sealed = self.encrypt(&json)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Inverse of [`seal`](Self::seal).
    pub fn open<T: DeserializeOwned>(&self, sealed: &str) -> Result<T, EncryptionError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|_| EncryptionError::DecryptFailed)?;
        let json = self.decrypt(&bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}
