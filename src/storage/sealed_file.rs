//! Sealed file storage — one sealed blob per key in a directory
//!
//! - File names are the SHA-256 of the storage key, so device ids never
//!   appear on disk in the clear
//! - Writes go to a temp file and are renamed into place
//! - Integrity and policy are verified on every read via the AEAD tag

use super::sealing::{self, SealingKey};
use super::{enforce_policy, AccessPolicy, SecureStorage, StorageError, UserPresence};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCAL_KEY_FILE: &str = "sealing.key";

/// Persistent sealed storage rooted at a directory
pub struct SealedFileStorage {
    dir: PathBuf,
    key: SealingKey,
    presence: Option<Arc<dyn UserPresence>>,
}

impl SealedFileStorage {
    /// Open storage with a sealing key held by the platform
    pub fn new(dir: impl Into<PathBuf>, key: SealingKey) -> Self {
        Self {
            dir: dir.into(),
            key,
            presence: None,
        }
    }

    /// Open storage with a sealing key kept next to the data.
    ///
    /// Only as strong as the file permissions on `dir`; use [`Self::new`] with
    /// a hardware-held key where the platform offers one.
    pub async fn open_with_local_key(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_unavailable("create storage dir", e))?;

        let key_path = dir.join(LOCAL_KEY_FILE);
        let key = match tokio::fs::read_to_string(&key_path).await {
            Ok(hex_key) => {
                let bytes = hex::decode(hex_key.trim())
                    .map_err(|_| StorageError::Corrupted("sealing key is not hex".into()))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("sealing key has wrong length".into()))?;
                SealingKey::from_bytes(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!(
                    "No sealing key in {}, provisioning a software key",
                    dir.display()
                );
                let key = SealingKey::generate()?;
                write_atomic(&dir, &key_path, hex::encode(key.as_bytes()).as_bytes()).await?;
                key
            }
            Err(e) => return Err(io_unavailable("read sealing key", e)),
        };
        Ok(Self::new(dir, key))
    }

    /// Route policy prompts through `presence`
    pub fn with_presence(mut self, presence: Arc<dyn UserPresence>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut h = Sha256::new();
        h.update(key.as_bytes());
        h.update(b"peribond-file-name-v1");
        self.dir.join(format!("{}.sealed", hex::encode(h.finalize())))
    }
}

fn io_unavailable(what: &str, e: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {}", what, e))
}

async fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| io_unavailable("write temp file", e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_unavailable("rename into place", e));
    }
    Ok(())
}

#[async_trait]
impl SecureStorage for SealedFileStorage {
    async fn put(&self, key: &str, value: &[u8], policy: &AccessPolicy) -> Result<(), StorageError> {
        enforce_policy(self.presence.as_deref(), policy, "Save paired device").await?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_unavailable("create storage dir", e))?;
        let blob = sealing::seal(&self.key, key, policy, value)?;
        write_atomic(&self.dir, &self.path_for(key), &blob).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let blob = match tokio::fs::read(self.path_for(key)).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_unavailable("read sealed file", e)),
        };
        let (policy, plaintext) = sealing::open(&self.key, key, &blob)?;
        enforce_policy(self.presence.as_deref(), &policy, "Read paired device").await?;
        Ok(Some(plaintext))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_unavailable("delete sealed file", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peribond-sealed-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = test_dir();
        let storage = SealedFileStorage::new(&dir, SealingKey::from_bytes([3u8; 32]));

        storage.put("bond:dev-1", b"record", &AccessPolicy::default()).await.unwrap();
        assert_eq!(storage.get("bond:dev-1").await.unwrap(), Some(b"record".to_vec()));
        assert_eq!(storage.get("bond:dev-2").await.unwrap(), None);

        storage.delete("bond:dev-1").await.unwrap();
        assert_eq!(storage.get("bond:dev-1").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_name_hides_key() {
        let dir = test_dir();
        let storage = SealedFileStorage::new(&dir, SealingKey::from_bytes([3u8; 32]));
        storage.put("bond:AA:BB", b"x", &AccessPolicy::default()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].contains("AA"));
        assert!(names[0].ends_with(".sealed"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_tampered_file_is_corrupted() {
        let dir = test_dir();
        let storage = SealedFileStorage::new(&dir, SealingKey::from_bytes([3u8; 32]));
        storage.put("k", b"payload", &AccessPolicy::default()).await.unwrap();

        let path = storage.path_for("k");
        let mut blob = std::fs::read(&path).unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x01;
        std::fs::write(&path, blob).unwrap();

        assert!(matches!(storage.get("k").await, Err(StorageError::Corrupted(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_local_key_survives_reopen() {
        let dir = test_dir();
        {
            let storage = SealedFileStorage::open_with_local_key(&dir).await.unwrap();
            storage.put("k", b"persisted", &AccessPolicy::default()).await.unwrap();
        }

        // Reopen from disk (simulates app restart)
        let storage = SealedFileStorage::open_with_local_key(&dir).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"persisted".to_vec()));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
