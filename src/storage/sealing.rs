//! Blob sealing shared by the software-backed adapters
//!
//! Layout: `"PBS1" | policy flags (1) | nonce (24) | ciphertext + tag`.
//! The header and the storage key are bound as associated data, so a blob
//! moved to another key, or with its policy flipped, fails to open.

use super::{AccessPolicy, StorageError};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MAGIC: &[u8; 4] = b"PBS1";
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_LEN;

const FLAG_USER_PRESENCE: u8 = 0b01;
const FLAG_FIRST_UNLOCK: u8 = 0b10;

/// 256-bit sealing key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh key from the OS random source
    pub fn generate() -> Result<Self, StorageError> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| StorageError::Unavailable(format!("OS random source: {}", e)))?;
        Ok(Self(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

fn policy_flags(policy: &AccessPolicy) -> u8 {
    let mut flags = 0;
    if policy.require_user_presence {
        flags |= FLAG_USER_PRESENCE;
    }
    if policy.after_first_unlock_only {
        flags |= FLAG_FIRST_UNLOCK;
    }
    flags
}

fn associated_data(header: &[u8], storage_key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + storage_key.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(storage_key.as_bytes());
    aad
}

/// Seal `plaintext` for storage under `storage_key`
pub(crate) fn seal(
    key: &SealingKey,
    storage_key: &str,
    policy: &AccessPolicy,
    plaintext: &[u8],
) -> Result<Vec<u8>, StorageError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| StorageError::Unavailable(format!("OS random source: {}", e)))?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(policy_flags(policy));
    header.extend_from_slice(&nonce);

    let aad = associated_data(&header, storage_key);
    let ciphertext = key
        .cipher()
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| StorageError::Unavailable("sealing failed".into()))?;

    let mut blob = header;
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a sealed blob, returning the policy it was written with and the plaintext
pub(crate) fn open(
    key: &SealingKey,
    storage_key: &str,
    blob: &[u8],
) -> Result<(AccessPolicy, Vec<u8>), StorageError> {
    if blob.len() < HEADER_LEN || &blob[..MAGIC.len()] != MAGIC {
        return Err(StorageError::Corrupted(format!(
            "'{}' is not a sealed blob",
            storage_key
        )));
    }
    let flags = blob[MAGIC.len()];
    if flags & !(FLAG_USER_PRESENCE | FLAG_FIRST_UNLOCK) != 0 {
        return Err(StorageError::Corrupted(format!(
            "'{}' has unknown policy flags",
            storage_key
        )));
    }
    let header = &blob[..HEADER_LEN];
    let nonce = &header[MAGIC.len() + 1..];
    let aad = associated_data(header, storage_key);

    let plaintext = key
        .cipher()
        .decrypt(
            XNonce::from_slice(nonce),
            Payload { msg: &blob[HEADER_LEN..], aad: &aad },
        )
        .map_err(|_| StorageError::Corrupted(format!("'{}' failed authentication", storage_key)))?;

    let policy = AccessPolicy {
        require_user_presence: flags & FLAG_USER_PRESENCE != 0,
        after_first_unlock_only: flags & FLAG_FIRST_UNLOCK != 0,
    };
    Ok((policy, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SealingKey {
        SealingKey::from_bytes([7u8; 32])
    }

    #[test]
    fn test_seal_open() {
        let policy = AccessPolicy { require_user_presence: true, after_first_unlock_only: false };
        let blob = seal(&key(), "bond:dev-1", &policy, b"record bytes").unwrap();
        let (read_policy, plaintext) = open(&key(), "bond:dev-1", &blob).unwrap();
        assert_eq!(read_policy, policy);
        assert_eq!(plaintext, b"record bytes");
    }

    #[test]
    fn test_tampered_blob_is_corrupted() {
        let mut blob = seal(&key(), "k", &AccessPolicy::default(), b"data").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(matches!(open(&key(), "k", &blob), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_blob_bound_to_storage_key() {
        let blob = seal(&key(), "bond:a", &AccessPolicy::default(), b"data").unwrap();
        assert!(matches!(open(&key(), "bond:b", &blob), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_policy_downgrade_detected() {
        let policy = AccessPolicy { require_user_presence: true, after_first_unlock_only: false };
        let mut blob = seal(&key(), "k", &policy, b"data").unwrap();
        blob[MAGIC.len()] = 0;
        assert!(matches!(open(&key(), "k", &blob), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_wrong_key() {
        let blob = seal(&key(), "k", &AccessPolicy::default(), b"data").unwrap();
        let other = SealingKey::from_bytes([8u8; 32]);
        assert!(open(&other, "k", &blob).is_err());
    }
}
