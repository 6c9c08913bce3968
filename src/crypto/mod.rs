//! AES-256-GCM block encryption and Argon2id key derivation for volumes.
//!
//! Key derivation: Argon2id(passphrase, salt=VOLUME_KEY_SALT) → 32-byte key
//! Encryption:     AES-256-GCM over the record area of one block, with the
//!                 block identity bound as associated data.
//!
//! Sealed record area layout: [ nonce (12 B) | ciphertext | GCM tag (16 B) ]

use argon2::{Algorithm, Argon2, Params, Version};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload};
use aes_gcm::Aes256Gcm;
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN:   usize = 16;
/// Bytes a sealed payload adds over its plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Fixed salt: every volume sealed under one passphrase shares one key, so a
/// copy job can read volumes written by a different session.
pub const VOLUME_KEY_SALT: &[u8; 16] = b"volstream-blk-v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed (wrong passphrase or corrupted block)")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encrypted payload too short (minimum {SEAL_OVERHEAD} bytes)")]
    TooShort,
    #[error("Block is encrypted but no decryption key was provided")]
    MissingKey,
}

/// Derive a 256-bit key from a passphrase and a salt using Argon2id.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Associated data binding a sealed payload to the block it was written in.
pub fn block_aad(block_number: u32, session_id: u32, session_time: u32) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[0..4].copy_from_slice(&block_number.to_be_bytes());
    aad[4..8].copy_from_slice(&session_id.to_be_bytes());
    aad[8..12].copy_from_slice(&session_time.to_be_bytes());
    aad
}

/// Symmetric key used to seal and open block payloads.
#[derive(Clone)]
pub struct VolumeKey {
    key: [u8; 32],
}

impl VolumeKey {
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        Ok(Self { key: derive_key(passphrase, VOLUME_KEY_SALT)? })
    }

    /// Encrypt `plaintext` under a random nonce.
    ///
    /// Returns `nonce (12 B) || ciphertext || GCM-tag (16 B)`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`VolumeKey::seal`] with the same `aad`.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let nonce = aes_gcm::Nonce::from_slice(&sealed[..NONCE_LEN]);
        cipher
            .decrypt(nonce, Payload { msg: &sealed[NONCE_LEN..], aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VolumeKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let key = VolumeKey::from_bytes([7u8; 32]);
        let aad = block_aad(3, 1, 2);
        let sealed = key.seal(b"record area", &aad).unwrap();
        assert_eq!(sealed.len(), b"record area".len() + SEAL_OVERHEAD);
        assert_eq!(key.open(&sealed, &aad).unwrap(), b"record area");
    }

    #[test]
    fn moved_block_fails_authentication() {
        let key = VolumeKey::from_bytes([7u8; 32]);
        let sealed = key.seal(b"record area", &block_aad(3, 1, 2)).unwrap();
        assert_eq!(key.open(&sealed, &block_aad(4, 1, 2)), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = VolumeKey::from_bytes([1u8; 32]).seal(b"x", b"").unwrap();
        let other = VolumeKey::from_bytes([2u8; 32]);
        assert_eq!(other.open(&sealed, b""), Err(CryptoError::DecryptionFailed));
        assert_eq!(other.open(&sealed[..10], b""), Err(CryptoError::TooShort));
    }
}
