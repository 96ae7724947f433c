//! Bond Lifecycle Manager — the bonding state machine
//!
//! ```text
//! Unbonded --begin--> Bonding --complete--> Bonded --revoke--> Revoked
//!              ^          |                                       |
//!              +--abort / expiry / failure                        |
//!              +--------------------------------------------------+
//! ```
//!
//! Ceremony drafts live in memory only; the [`BondRecordStore`] is the only
//! path to storage. Revocation is fail-secure: the device is treated as
//! revoked from the moment revocation starts, whether or not storage
//! cooperates.

use super::record::{now_millis, validate_device_id, BondRecord, BondState, Fingerprint, Peripheral, PeripheralKey};
use super::store::BondRecordStore;
use super::BondError;
use crate::config::{BondConfig, ConfigError};
use crate::storage::StorageError;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the peripheral's key material
    Open,
    /// `complete_bonding` is running
    Completing,
}

struct Ceremony {
    draft: BondRecord,
    started: Instant,
    stage: Stage,
}

/// Removes the ceremony entry when completion ends, however it ends
struct CeremonyGuard<'a> {
    ceremonies: &'a Mutex<HashMap<String, Ceremony>>,
    device_id: String,
}

impl Drop for CeremonyGuard<'_> {
    fn drop(&mut self) {
        let mut ceremonies = self.ceremonies.lock().unwrap_or_else(|p| p.into_inner());
        ceremonies.remove(&self.device_id);
    }
}

/// Creates, completes and revokes bonds
pub struct BondManager {
    store: Arc<BondRecordStore>,
    config: BondConfig,
    ceremonies: Mutex<HashMap<String, Ceremony>>,
}

impl BondManager {
    /// Fails if `config` does not pass [`BondConfig::validate`]
    pub fn new(store: Arc<BondRecordStore>, config: BondConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            ceremonies: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<BondRecordStore> {
        &self.store
    }

    fn ceremonies(&self) -> MutexGuard<'_, HashMap<String, Ceremony>> {
        self.ceremonies.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_expired(&self, ceremony: &Ceremony) -> bool {
        ceremony.stage == Stage::Open && ceremony.started.elapsed() >= self.config.bonding_timeout()
    }

    fn is_live(&self, ceremony: &Ceremony) -> bool {
        !self.is_expired(ceremony)
    }

    /// Start a bonding ceremony; the returned draft is never persisted
    pub async fn begin_bonding(&self, peripheral: &dyn Peripheral) -> Result<BondRecord, BondError> {
        let device_id = peripheral.id();
        validate_device_id(device_id)?;

        let mut ceremonies = self.ceremonies();
        if let Some(existing) = ceremonies.get(device_id) {
            if self.is_live(existing) {
                return Err(BondError::SessionInProgress(device_id.to_string()));
            }
            debug!("Replacing expired bonding ceremony for {}", device_id);
        }

        let draft = BondRecord::draft(peripheral);
        ceremonies.insert(
            device_id.to_string(),
            Ceremony {
                draft: draft.clone(),
                started: Instant::now(),
                stage: Stage::Open,
            },
        );
        info!("Bonding ceremony started for {}", device_id);
        Ok(draft)
    }

    /// Move an open ceremony to `Completing` and hand back its draft
    fn claim(&self, device_id: &str) -> Result<BondRecord, BondError> {
        let mut ceremonies = self.ceremonies();
        let expired = match ceremonies.get(device_id) {
            None => return Err(BondError::NoCeremony(device_id.to_string())),
            Some(c) if c.stage == Stage::Completing => {
                return Err(BondError::SessionInProgress(device_id.to_string()))
            }
            Some(c) => self.is_expired(c),
        };
        if expired {
            ceremonies.remove(device_id);
            info!("Bonding ceremony for {} expired", device_id);
            return Err(BondError::NoCeremony(device_id.to_string()));
        }
        match ceremonies.get_mut(device_id) {
            Some(ceremony) => {
                ceremony.stage = Stage::Completing;
                Ok(ceremony.draft.clone())
            }
            None => Err(BondError::NoCeremony(device_id.to_string())),
        }
    }

    /// Finish the ceremony with the peripheral's key material and persist the bond.
    ///
    /// `fingerprint` is the hex SHA-256 of `public_key`. If the device is
    /// already bonded under a different fingerprint, the old bond is revoked
    /// before the new one is written. Whatever the outcome, the ceremony is
    /// over when this returns.
    pub async fn complete_bonding(
        &self,
        device_id: &str,
        fingerprint: &str,
        public_key: &[u8],
    ) -> Result<BondRecord, BondError> {
        validate_device_id(device_id)?;
        let draft = self.claim(device_id)?;
        let _ceremony = CeremonyGuard {
            ceremonies: &self.ceremonies,
            device_id: device_id.to_string(),
        };

        let fingerprint = Fingerprint::parse(fingerprint)?;
        let key = PeripheralKey::from_bytes(public_key)?;
        if Fingerprint::of_key(&key) != fingerprint {
            return Err(BondError::InvalidFingerprint(
                "fingerprint does not match public key".into(),
            ));
        }

        let _lock = self.store.lock_device(device_id).await;
        let existing = self
            .store
            .load(device_id)
            .await
            .map_err(BondError::PersistenceFailed)?;
        if let Some(prior) = existing {
            if prior.is_bonded() && !self.store.is_revoked(device_id) {
                if prior.pubkey_fingerprint == Some(fingerprint) {
                    return Err(BondError::AlreadyBonded(device_id.to_string()));
                }
                warn!(
                    "Fingerprint for {} changed ({} -> {}), revoking prior bond",
                    device_id,
                    prior.pubkey_fingerprint.map(|f| f.short()).unwrap_or_default(),
                    fingerprint.short()
                );
                self.revoke_locked(device_id).await.map_err(|e| match e {
                    BondError::RevocationIncomplete { source, .. } => BondError::PersistenceFailed(source),
                    other => other,
                })?;
            }
        }

        let record = BondRecord {
            pubkey_fingerprint: Some(fingerprint),
            public_key: Some(key),
            created_at: now_millis(),
            state: BondState::Bonded,
            ..draft
        };
        if let Err(e) = self.store.save(&record).await {
            warn!("Bond for {} not persisted: {}", device_id, e);
            return Err(BondError::PersistenceFailed(e));
        }
        // a stale revocation for this id is superseded by the new record
        self.store.clear_revoked(device_id);
        info!("Bonded {} (fingerprint {})", device_id, fingerprint.short());
        Ok(record)
    }

    /// Discard an open ceremony
    pub async fn abort_bonding(&self, device_id: &str) -> Result<(), BondError> {
        let mut ceremonies = self.ceremonies();
        match ceremonies.get(device_id).map(|c| c.stage) {
            None => Err(BondError::NoCeremony(device_id.to_string())),
            Some(Stage::Completing) => Err(BondError::SessionInProgress(device_id.to_string())),
            Some(Stage::Open) => {
                ceremonies.remove(device_id);
                info!("Bonding ceremony for {} aborted", device_id);
                Ok(())
            }
        }
    }

    /// Drop every ceremony past `bonding_timeout`; returns how many were dropped
    pub fn reap_expired_ceremonies(&self) -> usize {
        let mut ceremonies = self.ceremonies();
        let before = ceremonies.len();
        ceremonies.retain(|_, c| self.is_live(c));
        let reaped = before - ceremonies.len();
        if reaped > 0 {
            info!("Reaped {} expired bonding ceremonies", reaped);
        }
        reaped
    }

    /// Current lifecycle state of `device_id`.
    ///
    /// `Revoked` is only reported while a revocation still has storage to
    /// clean up; a fully revoked device is `Unbonded`.
    pub async fn bond_state(&self, device_id: &str) -> Result<BondState, BondError> {
        validate_device_id(device_id)?;
        if self.store.load_bonded(device_id).await?.is_some() {
            return Ok(BondState::Bonded);
        }
        if self.store.is_revoked(device_id) {
            return Ok(BondState::Revoked);
        }
        let bonding = self
            .ceremonies()
            .get(device_id)
            .map(|c| self.is_live(c))
            .unwrap_or(false);
        Ok(if bonding { BondState::Bonding } else { BondState::Unbonded })
    }

    /// The trusted bond for `device_id`, if any; revoked bonds read as absent
    pub async fn load_bond(&self, device_id: &str) -> Result<Option<BondRecord>, BondError> {
        validate_device_id(device_id)?;
        Ok(self.store.load_bonded(device_id).await?)
    }

    /// All trusted bonds. Unreadable entries are skipped with a warning;
    /// `load_bond` on that device surfaces the error.
    pub async fn list_bonds(&self) -> Result<Vec<BondRecord>, BondError> {
        let mut bonds = Vec::new();
        for device_id in self.store.device_ids().await? {
            match self.store.load_bonded(&device_id).await {
                Ok(Some(record)) => bonds.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable bond for {}: {}", device_id, e),
            }
        }
        Ok(bonds)
    }

    /// Revoke the bond for `device_id`.
    ///
    /// The device stops being trusted before storage is touched. If the
    /// stored entry cannot be deleted the result is `RevocationIncomplete`,
    /// the device stays revoked and `retry_pending_revocations` finishes
    /// the job later.
    pub async fn revoke_bond(&self, device_id: &str) -> Result<(), BondError> {
        validate_device_id(device_id)?;
        let _lock = self.store.lock_device(device_id).await;
        self.revoke_locked(device_id).await
    }

    /// Revocation body; the caller holds the device write lock
    async fn revoke_locked(&self, device_id: &str) -> Result<(), BondError> {
        let pending = self.store.is_revoked(device_id);
        let stored = match self.store.load(device_id).await {
            Ok(None) if !pending => return Err(BondError::NotBonded(device_id.to_string())),
            Ok(record) => record,
            Err(StorageError::Corrupted(reason)) => {
                warn!("Revoking unreadable bond for {}: {}", device_id, reason);
                None
            }
            // the bond may still be intact; let the caller retry
            Err(e) => return Err(BondError::Storage(e)),
        };

        self.store.mark_revoked(device_id);

        if let Some(mut record) = stored.filter(|r| r.is_bonded()) {
            record.state = BondState::Revoked;
            if let Err(e) = self.store.write(&record).await {
                warn!("Could not write revoked marker for {}: {}", device_id, e);
            }
        }

        match self.store.erase(device_id).await {
            Ok(()) => {
                self.store.clear_revoked(device_id);
                info!("Revoked bond for {}", device_id);
                Ok(())
            }
            Err(source) => {
                warn!("Bond for {} revoked but still stored: {}", device_id, source);
                Err(BondError::RevocationIncomplete {
                    device_id: device_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Finish revocations whose storage cleanup failed earlier.
    ///
    /// Returns how many were completed; if any are still stuck, the first
    /// failure is returned after every pending device has been tried.
    pub async fn retry_pending_revocations(&self) -> Result<usize, BondError> {
        let mut completed = 0;
        let mut first_failure = None;
        for device_id in self.store.pending_revocations() {
            let _lock = self.store.lock_device(&device_id).await;
            // a new bond may have superseded it while we waited
            if !self.store.is_revoked(&device_id) {
                continue;
            }
            match self.store.erase(&device_id).await {
                Ok(()) => {
                    self.store.clear_revoked(&device_id);
                    info!("Finished pending revocation for {}", device_id);
                    completed += 1;
                }
                Err(source) => {
                    warn!("Revocation for {} still pending: {}", device_id, source);
                    first_failure.get_or_insert(BondError::RevocationIncomplete { device_id, source });
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }
}
