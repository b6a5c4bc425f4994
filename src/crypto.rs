//! At-rest sealing of host credentials with AES-256-GCM.
//!
//! Host passwords and private keys are stored sealed and opened only while
//! hydrating hop credentials. Layout is `nonce (12) || ciphertext || tag`.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("sealing failed")]
    SealFailed,

    #[error("opening failed (wrong key or tampered data)")]
    OpenFailed,

    #[error("sealed data too short")]
    TooShort,

    #[error("sealed data is not valid utf-8")]
    NotUtf8,
}

/// Symmetric vault for the store's secret columns.
///
/// The AES key is derived from the configured key material with SHA-256,
/// so any passphrase length is accepted.
pub struct SecretVault {
    key: Key<Aes256Gcm>,
}

impl SecretVault {
    pub fn new(material: &str) -> Self {
        let digest = Sha256::digest(material.as_bytes());
        Self {
            key: Key::<Aes256Gcm>::clone_from_slice(&digest),
        }
    }

    /// Seal a secret. The nonce is random, so sealing is not deterministic.
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open data produced by [`seal`](Self::seal).
    pub fn open(&self, data: &[u8]) -> Result<String, VaultError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::TooShort);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::OpenFailed)?;

        String::from_utf8(plaintext).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            VaultError::NotUtf8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let vault = SecretVault::new("test key material");
        let sealed = vault.seal("hunter2").unwrap();
        assert_eq!(vault.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn sealing_is_randomized() {
        let vault = SecretVault::new("k");
        let a = vault.seal("same").unwrap();
        let b = vault.seal("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.open(&a).unwrap(), vault.open(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = SecretVault::new("key-one").seal("secret").unwrap();
        let result = SecretVault::new("key-two").open(&sealed);
        assert!(matches!(result, Err(VaultError::OpenFailed)));
    }

    #[test]
    fn tampered_data_fails() {
        let vault = SecretVault::new("k");
        let mut sealed = vault.seal("secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(vault.open(&sealed), Err(VaultError::OpenFailed)));
    }

    #[test]
    fn short_input_rejected() {
        let vault = SecretVault::new("k");
        assert!(matches!(vault.open(b"tiny"), Err(VaultError::TooShort)));
    }
}
