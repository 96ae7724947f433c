//! In-process secure storage
//!
//! Blobs are sealed exactly like the file adapter so integrity failures look
//! the same. Faults can be queued per operation to exercise the error paths
//! callers must handle (cancelled prompts, missing enclave, corruption).

use super::sealing::{self, SealingKey};
use super::{enforce_policy, AccessPolicy, SecureStorage, StorageError, UserPresence};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation selector for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Put,
    Get,
    Delete,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    faults: HashMap<StorageOp, VecDeque<StorageError>>,
    op_counts: HashMap<StorageOp, usize>,
}

/// Sealed in-memory key-value store
pub struct MemoryStorage {
    key: SealingKey,
    presence: Option<Arc<dyn UserPresence>>,
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            key: SealingKey::from_bytes(rand::random()),
            presence: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Route policy prompts through `presence`
    pub fn with_presence(mut self, presence: Arc<dyn UserPresence>) -> Self {
        self.presence = Some(presence);
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `op` fail with `err`; queued faults fire in order
    pub fn fail_next(&self, op: StorageOp, err: StorageError) {
        self.inner().faults.entry(op).or_default().push_back(err);
    }

    /// Flip a byte of the sealed blob under `key`
    pub fn corrupt(&self, key: &str) -> bool {
        match self.inner().blobs.get_mut(key) {
            Some(blob) if !blob.is_empty() => {
                let last = blob.len() - 1;
                blob[last] ^= 0x5A;
                true
            }
            _ => false,
        }
    }

    /// Overwrite the raw blob under `key`, bypassing sealing
    pub fn insert_raw(&self, key: &str, blob: Vec<u8>) {
        self.inner().blobs.insert(key.to_string(), blob);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().blobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `op` has been attempted
    pub fn op_count(&self, op: StorageOp) -> usize {
        self.inner().op_counts.get(&op).copied().unwrap_or(0)
    }

    fn begin(&self, op: StorageOp) -> Result<(), StorageError> {
        let mut inner = self.inner();
        *inner.op_counts.entry(op).or_insert(0) += 1;
        match inner.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn put(&self, key: &str, value: &[u8], policy: &AccessPolicy) -> Result<(), StorageError> {
        self.begin(StorageOp::Put)?;
        enforce_policy(self.presence.as_deref(), policy, "Save paired device").await?;
        let blob = sealing::seal(&self.key, key, policy, value)?;
        self.inner().blobs.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.begin(StorageOp::Get)?;
        let blob = match self.inner().blobs.get(key) {
            Some(blob) => blob.clone(),
            None => return Ok(None),
        };
        let (policy, plaintext) = sealing::open(&self.key, key, &blob)?;
        enforce_policy(self.presence.as_deref(), &policy, "Read paired device").await?;
        Ok(Some(plaintext))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.begin(StorageOp::Delete)?;
        self.inner().blobs.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        storage.put("k", b"v", &AccessPolicy::default()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));

        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
        // deleting a missing key is fine
        storage.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_injection_fires_once() {
        let storage = MemoryStorage::new();
        storage.fail_next(StorageOp::Put, StorageError::UserCancelled);

        let err = storage.put("k", b"v", &AccessPolicy::default()).await.unwrap_err();
        assert_eq!(err, StorageError::UserCancelled);
        assert!(!storage.contains("k"));

        storage.put("k", b"v", &AccessPolicy::default()).await.unwrap();
        assert_eq!(storage.op_count(StorageOp::Put), 2);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let storage = MemoryStorage::new();
        storage.put("k", b"value", &AccessPolicy::default()).await.unwrap();
        assert!(storage.corrupt("k"));
        assert!(matches!(storage.get("k").await, Err(StorageError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_presence_policy_without_gate() {
        let storage = MemoryStorage::new();
        let policy = AccessPolicy { require_user_presence: true, ..Default::default() };
        let err = storage.put("k", b"v", &policy).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }
}
