//! AES-256-GCM encryption for integration credentials.
//!
//! Stored layout is `nonce (12 bytes) || ciphertext+tag`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

const NONCE_SIZE: usize = 12;

const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Encrypt,

    /// Wrong key or tampered data.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Credential payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cipher used by both stores for the `credentials` column.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn from_base64(key_base64: &str) -> Result<Self, CryptoError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not base64: {e}")))?;
        Self::from_bytes(&key_bytes)
    }

    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Use the configured key, or an ephemeral one when none is set.
    pub fn from_config(key_base64: Option<&str>) -> Result<Self, CryptoError> {
        match key_base64 {
            Some(key) if !key.trim().is_empty() => Self::from_base64(key),
            _ => {
                tracing::warn!(
                    "FUNNEL_ENCRYPTION_KEY not set, using an ephemeral key; stored credentials will not survive a restart"
                );
                Self::from_bytes(&Self::generate_key())
            }
        }
    }

    pub fn generate_key() -> Vec<u8> {
        let mut key = vec![0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key[..]);
        key
    }

    pub fn generate_key_base64() -> String {
        BASE64.encode(Self::generate_key())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::Decrypt("missing nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    pub fn encrypt_json(&self, data: &Value) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(&serde_json::to_vec(data)?)
    }

    /// Empty input decrypts to `null` (integration saved without credentials).
    pub fn decrypt_json(&self, sealed: &[u8]) -> Result<Value, CryptoError> {
        if sealed.is_empty() {
            return Ok(Value::Null);
        }
        let plaintext = self.decrypt(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_base64(&CredentialCipher::generate_key_base64()).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_json() {
        let cipher = cipher();
        let data = json!({"type": "bearer", "token": "sk_live_123"});

        let sealed = cipher.encrypt_json(&data).unwrap();
        assert!(sealed.len() > NONCE_SIZE);
        assert!(!String::from_utf8_lossy(&sealed).contains("sk_live_123"));
        assert_eq!(cipher.decrypt_json(&sealed).unwrap(), data);
    }

    #[test]
    fn test_empty_credentials() {
        assert_eq!(cipher().decrypt_json(&[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            CredentialCipher::from_bytes(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(CredentialCipher::from_base64("not-valid-base64!!!").is_err());
        assert!(CredentialCipher::from_config(None).is_ok());
    }

    #[test]
    fn test_wrong_key_or_tampered() {
        let sealed = cipher().encrypt(b"secret").unwrap();
        assert!(matches!(cipher().decrypt(&sealed), Err(CryptoError::Decrypt(_))));

        let cipher = cipher();
        let mut sealed = cipher.encrypt(b"secret").unwrap();
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(cipher.decrypt(&sealed).is_err());
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }
}
