//! Bond Record Store — the only persistence path for bond records
//!
//! Records are stored as JSON envelopes carrying a format version and an
//! integrity hash, under `"<namespace><device_id>"`. A separate index key
//! lists the device ids that have been bonded so callers can enumerate them.
//!
//! The store also owns two pieces of shared in-memory state:
//! - per-device write locks, so writes to one record are serialized while
//!   different devices proceed independently; the shared index has its own
//!   lock, held only for its read-modify-write
//! - the set of devices whose revocation has not fully reached storage yet;
//!   those read as absent no matter what storage returns

use super::record::{BondRecord, BondState};
use crate::config::BondConfig;
use crate::storage::{AccessPolicy, SecureStorage, StorageError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const FORMAT_VERSION: u32 = 1;
const INDEX_SUFFIX: &str = "#index";

/// On-storage envelope around a record
#[derive(Serialize, Deserialize)]
struct StoredBond {
    format: u32,
    record: BondRecord,
    integrity: String,
}

fn integrity_hash(record_json: &[u8], device_id: &str) -> String {
    let mut h = Sha256::new();
    h.update(record_json);
    h.update(device_id.as_bytes());
    h.update(b"peribond-bond-integrity-v1");
    hex::encode(h.finalize())
}

/// Serializes bond records through a [`SecureStorage`] adapter
pub struct BondRecordStore {
    storage: Arc<dyn SecureStorage>,
    namespace: String,
    policy: AccessPolicy,
    write_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    index_lock: AsyncMutex<()>,
    pending_revocations: Mutex<HashSet<String>>,
}

impl BondRecordStore {
    pub fn new(storage: Arc<dyn SecureStorage>, config: &BondConfig) -> Self {
        Self {
            storage,
            namespace: config.key_namespace.clone(),
            policy: config.storage_policy,
            write_locks: Mutex::new(HashMap::new()),
            index_lock: AsyncMutex::new(()),
            pending_revocations: Mutex::new(HashSet::new()),
        }
    }

    /// Storage key holding the record for `device_id`
    pub fn storage_key(&self, device_id: &str) -> String {
        format!("{}{}", self.namespace, device_id)
    }

    fn index_key(&self) -> String {
        format!("{}{}", self.namespace, INDEX_SUFFIX)
    }

    fn index_policy(&self) -> AccessPolicy {
        // enumerating ids should not prompt the user
        AccessPolicy {
            require_user_presence: false,
            ..self.policy
        }
    }

    /// Serialize writes to one device's record; hold the guard across the write
    pub async fn lock_device(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().unwrap_or_else(|p| p.into_inner());
            // drop locks nobody else is holding or waiting on
            locks.retain(|id, l| id == device_id || Arc::strong_count(l) > 1);
            locks.entry(device_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending_revocations.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remember that `device_id` is revoked even if storage still holds it
    pub fn mark_revoked(&self, device_id: &str) {
        self.pending().insert(device_id.to_string());
    }

    pub fn is_revoked(&self, device_id: &str) -> bool {
        self.pending().contains(device_id)
    }

    pub fn clear_revoked(&self, device_id: &str) {
        self.pending().remove(device_id);
    }

    /// Devices whose revocation still has a stored entry to clean up
    pub fn pending_revocations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn encode(record: &BondRecord) -> Result<Vec<u8>, StorageError> {
        let record_json = serde_json::to_vec(record)
            .map_err(|e| StorageError::Unavailable(format!("encode bond: {}", e)))?;
        let envelope = StoredBond {
            format: FORMAT_VERSION,
            integrity: integrity_hash(&record_json, &record.device_id),
            record: record.clone(),
        };
        serde_json::to_vec(&envelope).map_err(|e| StorageError::Unavailable(format!("encode bond: {}", e)))
    }

    fn decode(device_id: &str, bytes: &[u8]) -> Result<BondRecord, StorageError> {
        let envelope: StoredBond = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Corrupted(format!("bond for {} does not parse: {}", device_id, e)))?;
        if envelope.format != FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "bond for {} has unknown format {}",
                device_id, envelope.format
            )));
        }
        let record_json = serde_json::to_vec(&envelope.record)
            .map_err(|e| StorageError::Corrupted(e.to_string()))?;
        if integrity_hash(&record_json, device_id) != envelope.integrity {
            return Err(StorageError::Corrupted(format!(
                "bond for {} failed integrity check",
                device_id
            )));
        }
        if envelope.record.device_id != device_id {
            return Err(StorageError::Corrupted(format!(
                "bond stored under {} belongs to {}",
                device_id, envelope.record.device_id
            )));
        }
        envelope
            .record
            .check_consistency()
            .map_err(|reason| StorageError::Corrupted(format!("bond for {}: {}", device_id, reason)))?;
        Ok(envelope.record)
    }

    /// Raw load: whatever storage holds for `device_id`, revoked markers included
    pub async fn load(&self, device_id: &str) -> Result<Option<BondRecord>, StorageError> {
        match self.storage.get(&self.storage_key(device_id)).await? {
            Some(bytes) => Self::decode(device_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The record only if it is currently trusted: bonded and not pending revocation
    pub async fn load_bonded(&self, device_id: &str) -> Result<Option<BondRecord>, StorageError> {
        if self.is_revoked(device_id) {
            return Ok(None);
        }
        let record = self.load(device_id).await?;
        // a revocation may have landed while storage was being read
        if self.is_revoked(device_id) {
            return Ok(None);
        }
        Ok(record.filter(|r| r.state == BondState::Bonded))
    }

    /// Persist a newly bonded record and register it in the index
    pub async fn save(&self, record: &BondRecord) -> Result<(), StorageError> {
        let bytes = Self::encode(record)?;
        self.index_insert(&record.device_id).await?;
        self.storage
            .put(&self.storage_key(&record.device_id), &bytes, &self.policy)
            .await
    }

    /// Overwrite an already indexed record
    pub(crate) async fn write(&self, record: &BondRecord) -> Result<(), StorageError> {
        let bytes = Self::encode(record)?;
        self.storage
            .put(&self.storage_key(&record.device_id), &bytes, &self.policy)
            .await
    }

    /// Delete the record; an index that cannot be updated is only logged
    pub async fn erase(&self, device_id: &str) -> Result<(), StorageError> {
        self.storage.delete(&self.storage_key(device_id)).await?;
        if let Err(e) = self.index_remove(device_id).await {
            log::warn!("Bond for {} erased but index not updated: {}", device_id, e);
        }
        Ok(())
    }

    /// Device ids registered in the index, sorted
    pub async fn device_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.read_index().await?.into_iter().collect())
    }

    async fn read_index(&self) -> Result<BTreeSet<String>, StorageError> {
        match self.storage.get(&self.index_key()).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupted(format!("bond index does not parse: {}", e))),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn write_index(&self, ids: &BTreeSet<String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(ids)
            .map_err(|e| StorageError::Unavailable(format!("encode bond index: {}", e)))?;
        self.storage
            .put(&self.index_key(), &bytes, &self.index_policy())
            .await
    }

    async fn index_insert(&self, device_id: &str) -> Result<(), StorageError> {
        let _index = self.index_lock.lock().await;
        let mut ids = self.read_index().await?;
        if ids.insert(device_id.to_string()) {
            self.write_index(&ids).await?;
        }
        Ok(())
    }

    async fn index_remove(&self, device_id: &str) -> Result<(), StorageError> {
        let _index = self.index_lock.lock().await;
        let mut ids = self.read_index().await?;
        if ids.remove(device_id) {
            self.write_index(&ids).await?;
        }
        Ok(())
    }
}
