//! Authenticated encryption for credential payloads.
//!
//! AES-256-GCM keyed from one process-level secret. The secret is rarely a
//! 32-byte key itself, so the key is derived with HKDF-SHA256 under a fixed
//! salt — the same secret always yields the same key, which is what keeps
//! previously stored blobs decryptable across restarts. Decryption fails
//! closed: any tamper, truncation, or key mismatch is an opaque
//! [`CipherError::Decrypt`], never an empty payload.

use std::fmt;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::credential::CredentialPayload;

/// Fixed HKDF salt. Changing it orphans every previously encrypted blob.
const KDF_SALT: &[u8] = b"simstim.credential.kdf.v1";

/// HKDF info string separating this key from any other use of the secret.
const KDF_INFO: &[u8] = b"credential-cipher";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Environment variable the master secret is read from.
pub const MASTER_KEY_ENV: &str = "SIMSTIM_MASTER_KEY";

/// Errors from credential encryption and decryption.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// The master secret is missing or unusable.
    #[error("master secret unavailable: {0}")]
    Secret(String),
    /// Serialization of the payload failed before encryption.
    #[error("failed to serialize credential payload: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Encryption failed.
    #[error("credential encryption failed")]
    Encrypt,
    /// The blob is malformed, tampered with, or keyed differently.
    ///
    /// Deliberately carries no detail: the caller must treat the credential
    /// as unusable, and nothing about the plaintext may leak.
    #[error("credential decryption failed")]
    Decrypt,
}

/// The process-level secret the cipher key derives from.
///
/// Read once at startup; `Debug` never reveals the value.
pub struct MasterSecret(String);

impl MasterSecret {
    /// Wrap an already-obtained secret string.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Secret`] when the secret is empty.
    pub fn new(secret: impl Into<String>) -> Result<Self, CipherError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(CipherError::Secret("secret is empty".to_owned()));
        }
        Ok(Self(secret))
    }

    /// Read the secret from [`MASTER_KEY_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Secret`] when the variable is unset or empty.
    pub fn from_env() -> Result<Self, CipherError> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(value) => Self::new(value),
            Err(_) => Err(CipherError::Secret(format!("{MASTER_KEY_ENV} is not set"))),
        }
    }

    fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSecret(__REDACTED__)")
    }
}

/// AES-256-GCM cipher over credential payloads.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Derive the cipher key from the master secret.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Secret`] if key derivation fails.
    pub fn new(secret: &MasterSecret) -> Result<Self, CipherError> {
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret.expose());
        let mut okm = [0u8; 32];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|_| CipherError::Secret("key derivation failed".to_owned()))?;
        let key = Key::<Aes256Gcm>::from_slice(&okm);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a payload into an opaque base64 blob.
    ///
    /// A fresh random nonce is used per call, so equal payloads produce
    /// different blobs.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Serialize`] or [`CipherError::Encrypt`].
    pub fn encrypt(&self, payload: &CredentialPayload) -> Result<String, CipherError> {
        let plaintext = serde_json::to_vec(payload)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Decrypt`] for any malformed, truncated, or
    /// tampered blob, and for blobs encrypted under a different secret.
    pub fn decrypt(&self, blob: &str) -> Result<CredentialPayload, CipherError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .map_err(|_| CipherError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        serde_json::from_slice(&plaintext).map_err(|_| CipherError::Decrypt)
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher")
    }
}
