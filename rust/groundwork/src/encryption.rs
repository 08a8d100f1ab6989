//! Encryption of state and plan artifacts at rest.
//!
//! The [`EncryptionHook`] is invoked on every read and write of a persisted
//! artifact. With encryption disabled it is an identity transform. The
//! AES-256-GCM implementation takes its key from a [`KeyProvider`], which
//! may be configured independently per artifact kind.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Which artifact is being transformed; independent keys may be configured
/// per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    State,
    Plan,
}

impl ArtifactKind {
    fn label(&self) -> &'static str {
        match self {
            ArtifactKind::State => "state",
            ArtifactKind::Plan => "plan",
        }
    }
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("failed to encrypt {kind} artifact")]
    Encrypt { kind: &'static str },
    #[error("failed to decrypt {kind} artifact (wrong key, or data corrupted)")]
    Decrypt { kind: &'static str },
    #[error("no key configured for {kind} artifacts")]
    NoKey { kind: &'static str },
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub trait EncryptionHook: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError>;
    fn decrypt(&self, ciphertext: &[u8], kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError>;
}

/// The identity transform used when no encryption is configured.
pub struct Disabled;

impl EncryptionHook for Disabled {
    fn encrypt(&self, plaintext: &[u8], _kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError> {
        Ok(ciphertext.to_vec())
    }
}

/// Supplies a 256-bit key for an artifact kind.
pub trait KeyProvider: Send + Sync {
    fn key(&self, kind: ArtifactKind) -> Result<[u8; 32], EncryptionError>;
}

/// A fixed key given as 64 hex characters.
pub struct StaticKey {
    key: [u8; 32],
}

impl StaticKey {
    pub fn from_hex(hex_key: &str) -> Result<StaticKey, EncryptionError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EncryptionError::InvalidKey("key must be 32 bytes".to_string()))?;
        Ok(StaticKey { key })
    }
}

impl KeyProvider for StaticKey {
    fn key(&self, _kind: ArtifactKind) -> Result<[u8; 32], EncryptionError> {
        Ok(self.key)
    }
}

/// Derives per-kind keys from a passphrase. The artifact kind is folded into
/// the derivation so state and plan artifacts never share a key.
pub struct Passphrase {
    passphrase: String,
}

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> Passphrase {
        Passphrase {
            passphrase: passphrase.into(),
        }
    }
}

impl KeyProvider for Passphrase {
    fn key(&self, kind: ArtifactKind) -> Result<[u8; 32], EncryptionError> {
        let mut hasher = Sha256::new();
        hasher.update(b"groundwork-artifact-key\0");
        hasher.update(kind.label().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.passphrase.as_bytes());
        Ok(hasher.finalize().into())
    }
}

/// AES-256-GCM with a random nonce prepended to the ciphertext.
pub struct AeadEncryption<P> {
    keys: P,
}

const NONCE_LEN: usize = 12;

impl<P: KeyProvider> AeadEncryption<P> {
    pub fn new(keys: P) -> Self {
        AeadEncryption { keys }
    }

    fn cipher(&self, kind: ArtifactKind) -> Result<Aes256Gcm, EncryptionError> {
        let key = self.keys.key(kind)?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
    }
}

impl<P: KeyProvider> EncryptionHook for AeadEncryption<P> {
    fn encrypt(&self, plaintext: &[u8], kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError> {
        let cipher = self.cipher(kind)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::Encrypt { kind: kind.label() })?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], kind: ArtifactKind) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN {
            return Err(EncryptionError::Decrypt { kind: kind.label() });
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = self.cipher(kind)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt { kind: kind.label() })
    }
}
