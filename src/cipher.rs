// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Credential envelope encryption.
//!
//! Engine credentials are stored as AES-256-GCM envelopes in the format
//! `iv.tag.ciphertext`, each part standard base64. The IV is 12 random bytes and the
//! tag is the 16-byte GCM authentication tag. This layout matches what the admin
//! front end writes, so blobs are interchangeable.
//!
//! # Example
//!
//! ```
//! use indexing_pipeline::Cipher;
//!
//! let cipher = Cipher::from_hex(&"11".repeat(32)).unwrap();
//! let blob = cipher.encrypt("bing-api-key-123").unwrap();
//! assert_eq!(blob.split('.').count(), 3);
//! assert_eq!(cipher.decrypt(&blob).unwrap(), "bing-api-key-123");
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key must be 32 bytes (64 hex chars)")]
    InvalidKey,
    #[error("invalid encrypted payload format (expected iv.tag.ciphertext)")]
    InvalidFormat,
    #[error("invalid base64 in {0}")]
    InvalidEncoding(&'static str),
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("plaintext is not valid utf-8")]
    InvalidUtf8,
}

/// AES-256-GCM envelope cipher.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build from a 64-char hex key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CipherError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { key })
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .aead()?
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|_| CipherError::EncryptFailed)?;

        // aes-gcm appends the tag: ciphertext || tag
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}.{}.{}",
            STANDARD.encode(iv),
            STANDARD.encode(tag),
            STANDARD.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, CipherError> {
        let mut parts = payload.trim().split('.');
        let (iv_b64, tag_b64, ct_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct), None) if !iv.is_empty() && !tag.is_empty() && !ct.is_empty() => {
                (iv, tag, ct)
            }
            _ => return Err(CipherError::InvalidFormat),
        };

        let iv = STANDARD.decode(iv_b64).map_err(|_| CipherError::InvalidEncoding("iv"))?;
        let tag = STANDARD.decode(tag_b64).map_err(|_| CipherError::InvalidEncoding("tag"))?;
        let mut sealed = STANDARD.decode(ct_b64).map_err(|_| CipherError::InvalidEncoding("ciphertext"))?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CipherError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_hex(&"0f".repeat(32)).unwrap()
    }

    #[test]
    fn test_encrypt_uses_fresh_iv() {
        let c = cipher();
        let a = c.encrypt("secret").unwrap();
        let b = c.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a).unwrap(), "secret");
        assert_eq!(c.decrypt(&b).unwrap(), "secret");
    }

    #[test]
    fn test_tag_and_iv_lengths() {
        let blob = cipher().encrypt("x").unwrap();
        let parts: Vec<_> = blob.split('.').collect();
        assert_eq!(STANDARD.decode(parts[0]).unwrap().len(), IV_LEN);
        assert_eq!(STANDARD.decode(parts[1]).unwrap().len(), TAG_LEN);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = cipher().encrypt("secret").unwrap();
        let other = Cipher::from_hex(&"aa".repeat(32)).unwrap();
        assert_eq!(other.decrypt(&blob), Err(CipherError::DecryptFailed));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let c = cipher();
        let blob = c.encrypt("secret").unwrap();
        let parts: Vec<_> = blob.split('.').collect();
        let bad_tag = STANDARD.encode([0u8; TAG_LEN]);
        let tampered = format!("{}.{}.{}", parts[0], bad_tag, parts[2]);
        assert_eq!(c.decrypt(&tampered), Err(CipherError::DecryptFailed));
    }

    #[test]
    fn test_bad_formats() {
        let c = cipher();
        assert_eq!(c.decrypt("only.two"), Err(CipherError::InvalidFormat));
        assert_eq!(c.decrypt("a.b.c.d"), Err(CipherError::InvalidFormat));
        assert_eq!(c.decrypt("..x"), Err(CipherError::InvalidFormat));
        assert_eq!(c.decrypt("!!.!!.!!"), Err(CipherError::InvalidEncoding("iv")));
    }

    #[test]
    fn test_bad_keys() {
        assert_eq!(Cipher::from_hex("abcd").unwrap_err(), CipherError::InvalidKey);
        assert_eq!(Cipher::from_hex(&"zz".repeat(32)).unwrap_err(), CipherError::InvalidKey);
    }

    #[test]
    fn test_debug_redacts_key() {
        assert!(!format!("{:?}", cipher()).contains("0f"));
    }
}
