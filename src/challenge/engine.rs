//! Challenge-Response Engine
//!
//! One session per reconnection:
//! 1. build a nonce from the bond's next challenge counter (8 bytes,
//!    big-endian) followed by random bytes, so no nonce ever repeats
//! 2. send it over the [`PeripheralLink`] and wait at most `response_timeout`
//! 3. check the response echoes the nonce and carries a valid Ed25519
//!    signature under the key retained at bonding time
//! 4. record the consumed nonce under the device write lock
//!
//! A rejected session leaves the bond untouched.

use super::link::PeripheralLink;
use super::protocol::{challenge_message, ChallengeFrame, ResponseFrame};
use super::{AuthError, AuthenticatedSession, RejectReason, SessionResult};
use crate::bond::{
    nonce_counter, nonce_digest, now_millis, validate_device_id, BondRecordStore, Fingerprint,
    NONCE_COUNTER_LEN,
};
use crate::config::{BondConfig, ConfigError};
use crate::random::{draw_with_retry, RandomSource};
use crate::storage::StorageError;
use ed25519_dalek::Signature;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Marks a device as having a live session until dropped
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashSet<String>>,
    device_id: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(&self.device_id);
    }
}

/// Re-authenticates bonded peripherals
pub struct ChallengeEngine {
    store: Arc<BondRecordStore>,
    random: Arc<dyn RandomSource>,
    link: Arc<dyn PeripheralLink>,
    config: BondConfig,
    sessions: Mutex<HashSet<String>>,
}

impl ChallengeEngine {
    pub fn new(
        store: Arc<BondRecordStore>,
        random: Arc<dyn RandomSource>,
        link: Arc<dyn PeripheralLink>,
        config: BondConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            random,
            link,
            config,
            sessions: Mutex::new(HashSet::new()),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashSet<String>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_session(&self, device_id: &str) -> Result<SessionGuard<'_>, AuthError> {
        if !self.sessions().insert(device_id.to_string()) {
            return Err(AuthError::SessionInProgress(device_id.to_string()));
        }
        Ok(SessionGuard {
            sessions: &self.sessions,
            device_id: device_id.to_string(),
        })
    }

    /// Whether a session for `device_id` is running right now
    pub fn session_active(&self, device_id: &str) -> bool {
        self.sessions().contains(device_id)
    }

    /// Run one challenge-response session against `device_id`.
    ///
    /// `Ok(Rejected { .. })` is a verdict on the peripheral; `Err` means the
    /// session could not reach a verdict.
    pub async fn authenticate(&self, device_id: &str) -> Result<SessionResult, AuthError> {
        if validate_device_id(device_id).is_err() {
            return Ok(SessionResult::rejected(RejectReason::NoBond));
        }
        let _session = self.open_session(device_id)?;

        let record = match self.store.load_bonded(device_id).await? {
            Some(record) => record,
            None => {
                info!("Rejecting {}: no bond", device_id);
                return Ok(SessionResult::rejected(RejectReason::NoBond));
            }
        };
        let (fingerprint, key) = record.trust_material().ok_or_else(|| {
            StorageError::Corrupted(format!("bond for {} has no key material", device_id))
        })?;
        if Fingerprint::of_key(&key) != fingerprint {
            return Err(StorageError::Corrupted(format!(
                "bond for {} holds a key that does not match its fingerprint",
                device_id
            ))
            .into());
        }

        let counter = record
            .next_challenge_counter()
            .ok_or_else(|| AuthError::CounterExhausted(device_id.to_string()))?;
        let random = draw_with_retry(
            self.random.as_ref(),
            self.config.nonce_len - NONCE_COUNTER_LEN,
            self.config.random_retry_limit,
        )
        .map_err(AuthError::RandomUnavailable)?;
        let mut nonce = counter.to_be_bytes().to_vec();
        nonce.extend_from_slice(&random);
        if !record.is_fresh(&nonce) {
            warn!("Drawn challenge for {} was already consumed", device_id);
            return Ok(SessionResult::rejected(RejectReason::NonceReplay));
        }

        let request = ChallengeFrame { nonce: nonce.clone() }.encode()?;
        debug!("Challenging {} ({} byte nonce)", device_id, nonce.len());
        let exchange = self.link.exchange(device_id, request);
        let response = match tokio::time::timeout(self.config.response_timeout(), exchange).await {
            Ok(response) => response?,
            Err(_) => {
                warn!("No challenge response from {} within {:?}", device_id, self.config.response_timeout());
                return Ok(SessionResult::rejected(RejectReason::Timeout));
            }
        };

        let frame = match ResponseFrame::decode(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed challenge response from {}: {}", device_id, e);
                return Ok(SessionResult::rejected(RejectReason::BadSignature));
            }
        };
        if frame.nonce != nonce {
            let stale = nonce_counter(&frame.nonce).is_some_and(|c| c <= record.challenge_counter);
            let reason = if stale || record.has_consumed(&nonce_digest(&frame.nonce)) {
                RejectReason::NonceReplay
            } else {
                RejectReason::BadSignature
            };
            warn!("Response from {} answers a different challenge ({:?})", device_id, reason);
            return Ok(SessionResult::rejected(reason));
        }
        let signature = Signature::from_bytes(&frame.signature);
        if key
            .verifying_key()
            .verify_strict(&challenge_message(device_id, &nonce), &signature)
            .is_err()
        {
            warn!("Bad challenge signature from {} (fingerprint {})", device_id, fingerprint.short());
            return Ok(SessionResult::rejected(RejectReason::BadSignature));
        }

        self.commit(device_id, fingerprint, &nonce).await
    }

    /// Persist the consumed nonce, provided the bond is still the one we verified against
    async fn commit(
        &self,
        device_id: &str,
        fingerprint: Fingerprint,
        nonce: &[u8],
    ) -> Result<SessionResult, AuthError> {
        let _lock = self.store.lock_device(device_id).await;
        let mut current = match self.store.load_bonded(device_id).await? {
            Some(record) if record.pubkey_fingerprint == Some(fingerprint) => record,
            _ => {
                info!("Bond for {} changed during authentication", device_id);
                return Ok(SessionResult::rejected(RejectReason::NoBond));
            }
        };
        // another session may have consumed this counter while we waited
        if !current.is_fresh(nonce) {
            return Ok(SessionResult::rejected(RejectReason::NonceReplay));
        }

        current.record_authentication(nonce, now_millis(), self.config.nonce_history_len);
        self.store.write(&current).await?;

        let authenticated_at = current.last_authenticated_at.unwrap_or_else(now_millis);
        let session = AuthenticatedSession {
            device_id: device_id.to_string(),
            session_id: Uuid::new_v4(),
            authenticated_at,
        };
        info!(
            "Authenticated {} (fingerprint {}, session {})",
            device_id,
            fingerprint.short(),
            &session.session_id.to_string()[..8]
        );
        Ok(SessionResult::Authenticated(session))
    }
}
