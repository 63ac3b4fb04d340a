//! Secret vault: authenticated symmetric encryption of exchange credentials.
//!
//! Ciphertexts are `base64(nonce || AES-256-GCM ciphertext+tag)`. The key is
//! resolved once from `VAULT_KEY` at startup; a missing or malformed key is a
//! fatal startup error, and decryption failures always surface — they are
//! never swallowed into a default.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key must be 32 bytes of base64")]
    InvalidKey,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build a vault from a base64-encoded 256-bit key.
    pub fn from_key_b64(key_b64: &str) -> Result<Self, VaultError> {
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|_| VaultError::InvalidKey)?;
        if key_bytes.len() != 32 {
            return Err(VaultError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, blob_b64: &str) -> Result<String, VaultError> {
        let blob = BASE64.decode(blob_b64).map_err(|_| VaultError::Decrypt)?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        let key = BASE64.encode([7u8; 32]);
        Vault::from_key_b64(&key).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let vault = test_vault();
        let ct = vault.encrypt("api-key-123").unwrap();
        assert_ne!(ct, "api-key-123");
        assert_eq!(vault.decrypt(&ct).unwrap(), "api-key-123");
    }

    #[test]
    fn test_nonce_makes_ciphertexts_distinct() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = test_vault();
        let ct = vault.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(vault.decrypt(&tampered), Err(VaultError::Decrypt)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let vault = test_vault();
        let ct = vault.encrypt("secret").unwrap();

        let other = Vault::from_key_b64(&BASE64.encode([9u8; 32])).unwrap();
        assert!(matches!(other.decrypt(&ct), Err(VaultError::Decrypt)));
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            Vault::from_key_b64("not-base64!!"),
            Err(VaultError::InvalidKey)
        ));
        assert!(matches!(
            Vault::from_key_b64(&BASE64.encode([1u8; 16])),
            Err(VaultError::InvalidKey)
        ));
    }

    #[test]
    fn test_garbage_blob_fails() {
        let vault = test_vault();
        assert!(vault.decrypt("AAAA").is_err());
        assert!(vault.decrypt("%%%").is_err());
    }
}
