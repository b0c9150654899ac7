//! ChaCha20-Poly1305 authenticated encryption for deposited credentials.
//!
//! The opaque blob stored in the persistent store is the concatenation
//! `nonce || tag || ciphertext`, base64-encoded. Tag verification failure is
//! a distinct [`IntegrityError`] so callers can surface it as a configuration
//! problem rather than a client error.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use super::{KEY_SIZE, NONCE_SIZE, PBKDF2_ROUNDS, TAG_SIZE};

/// Fixed process-wide salt for master-key derivation. Changing it is a
/// data-loss event for every existing vault blob.
const MASTER_KEY_SALT: &[u8] = b"feen-vault-master-key-v1";

/// Errors from vault encryption and decryption
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Authentication tag did not verify (tampering or wrong key).
    #[error("authentication tag mismatch")]
    TagMismatch,

    /// Blob is not valid base64 or is shorter than nonce + tag.
    #[error("malformed vault blob")]
    Malformed,

    /// Encryption itself failed (never expected with a valid key).
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Vault cipher holding the process master key.
#[derive(Clone)]
pub struct VaultCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for VaultCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultCipher(**redacted**)")
    }
}

impl VaultCipher {
    /// Build a cipher from the boot-time master key.
    ///
    /// A key of exactly 32 bytes is used as-is; anything else is stretched
    /// into a 256-bit key with PBKDF2-HMAC-SHA256 over the fixed process
    /// salt.
    pub fn new(master_key: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        if master_key.len() == KEY_SIZE {
            key.copy_from_slice(master_key);
        } else {
            pbkdf2_hmac::<Sha256>(master_key, MASTER_KEY_SALT, PBKDF2_ROUNDS, &mut key);
        }
        Self { key }
    }

    /// Encrypt plaintext into the opaque base64 blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, IntegrityError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        // chacha20poly1305 appends the tag to the ciphertext; the wire
        // format wants nonce || tag || ciphertext.
        let ct_and_tag = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| IntegrityError::EncryptionFailed)?;
        let (ct, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_SIZE);

        let mut blob = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ct.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ct);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt an opaque blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, IntegrityError> {
        let raw = BASE64.decode(blob).map_err(|_| IntegrityError::Malformed)?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(IntegrityError::Malformed);
        }

        let (nonce, rest) = raw.split_at(NONCE_SIZE);
        let (tag, ct) = rest.split_at(TAG_SIZE);

        let mut ct_and_tag = Vec::with_capacity(ct.len() + TAG_SIZE);
        ct_and_tag.extend_from_slice(ct);
        ct_and_tag.extend_from_slice(tag);

        let cipher = ChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ct_and_tag.as_ref())
            .map_err(|_| IntegrityError::TagMismatch)
    }

    /// Decrypt a blob into a UTF-8 string (credentials are always text).
    pub fn decrypt_string(&self, blob: &str) -> Result<String, IntegrityError> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| IntegrityError::Malformed)
    }
}
