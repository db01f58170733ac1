//! AES-256-GCM encryption of credential files with an Argon2-derived key.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use argon2::password_hash::SaltString;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

const ALGORITHM: &str = "AES-256-GCM";
const NONCE_LEN: usize = 12;

/// Serialized form of one encrypted blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    pub algorithm: String,
    /// Base64
    pub nonce: String,
    /// Base64
    pub ciphertext: String,
}

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialCipher {
    /// Derive the key from `passphrase` and a base64 `salt`.
    pub fn from_passphrase(passphrase: &str, salt: &str) -> EngineResult<Self> {
        let salt = SaltString::from_b64(salt)
            .map_err(|e| EngineError::Credentials(format!("Invalid key salt: {e}")))?;

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt.as_str().as_bytes(), &mut key)
            .map_err(|e| EngineError::Credentials(format!("Key derivation failed: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EngineError::Credentials(format!("Failed to create cipher: {e}")))?;
        Ok(CredentialCipher { cipher })
    }

    pub fn generate_salt() -> String {
        SaltString::generate(&mut OsRng).to_string()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> EngineResult<EncryptedData> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EngineError::Credentials(format!("Encryption failed: {e}")))?;

        Ok(EncryptedData {
            algorithm: ALGORITHM.to_string(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, data: &EncryptedData) -> EngineResult<Vec<u8>> {
        if data.algorithm != ALGORITHM {
            return Err(EngineError::Credentials(format!(
                "Unsupported algorithm: {}",
                data.algorithm
            )));
        }
        let nonce = BASE64
            .decode(&data.nonce)
            .map_err(|e| EngineError::Credentials(format!("Invalid nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(EngineError::Credentials("Invalid nonce length".into()));
        }
        let ciphertext = BASE64
            .decode(&data.ciphertext)
            .map_err(|e| EngineError::Credentials(format!("Invalid ciphertext encoding: {e}")))?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                EngineError::Credentials("Decryption failed (wrong passphrase?)".into())
            })
    }
}
