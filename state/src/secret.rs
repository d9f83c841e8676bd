use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

const KEY_CONTEXT: &str = "veld state secret encryption v1";

/// An encrypted secret value as persisted in the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBox {
    pub nonce: String,
    pub data: String,
}

#[derive(Debug, Clone, Error)]
pub enum SecretError {
    /// AES-GCM failures carry no detail on purpose.
    #[error("secret encryption failed")]
    Encrypt,
    #[error("secret decryption failed (wrong passphrase?)")]
    Decrypt,
    #[error("malformed secret in state file: {0}")]
    Malformed(String),
}

/// Encrypts and decrypts secret output values with AES-256-GCM, keyed
/// by a blake3-derived key from the operator's passphrase.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()),
        }
    }

    pub fn encrypt(&self, value: &Value) -> Result<SecretBox, SecretError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(value).map_err(|_| SecretError::Encrypt)?;
        let data = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| SecretError::Encrypt)?;
        Ok(SecretBox {
            nonce: BASE64.encode(nonce),
            data: BASE64.encode(data),
        })
    }

    pub fn decrypt(&self, secret: &SecretBox) -> Result<Value, SecretError> {
        let nonce_bytes = BASE64
            .decode(&secret.nonce)
            .map_err(|err| SecretError::Malformed(err.to_string()))?;
        let data = BASE64
            .decode(&secret.data)
            .map_err(|err| SecretError::Malformed(err.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(SecretError::Malformed("bad nonce length".to_string()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), data.as_slice())
            .map_err(|_| SecretError::Decrypt)?;
        serde_json::from_slice(&plaintext).map_err(|err| SecretError::Malformed(err.to_string()))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}
