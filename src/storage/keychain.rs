//! OS keychain storage via the `keyring` crate
//!
//! Blobs are hex-encoded into the credential's password slot under a single
//! service name. Keychain calls block, so they run on the blocking pool.
//! User-presence prompts are enforced by the OS item settings where the
//! platform supports them; the policy gate here covers the rest.

use super::{enforce_policy, AccessPolicy, SecureStorage, StorageError, UserPresence};
use async_trait::async_trait;
use std::sync::Arc;

/// Secure storage backed by the platform credential store
pub struct KeyringStorage {
    service: String,
    presence: Option<Arc<dyn UserPresence>>,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            presence: None,
        }
    }

    /// Route policy prompts through `presence`
    pub fn with_presence(mut self, presence: Arc<dyn UserPresence>) -> Self {
        self.presence = Some(presence);
        self
    }

    async fn blocking<T, F>(&self, key: &str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let user = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &user)?;
            f(entry)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("keyring task: {}", e)))?
        .map_err(map_keyring_error)
    }
}

fn map_keyring_error(e: keyring::Error) -> StorageError {
    match e {
        keyring::Error::NoStorageAccess(inner) => {
            StorageError::Unavailable(format!("keychain locked or denied: {}", inner))
        }
        keyring::Error::BadEncoding(_) => StorageError::Corrupted("keychain item is not text".into()),
        other => StorageError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn put(&self, key: &str, value: &[u8], policy: &AccessPolicy) -> Result<(), StorageError> {
        enforce_policy(self.presence.as_deref(), policy, "Save paired device").await?;
        let encoded = hex::encode(value);
        self.blocking(key, move |entry| entry.set_password(&encoded)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let found = self
            .blocking(key, |entry| match entry.get_password() {
                Ok(secret) => Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e),
            })
            .await?;
        match found {
            Some(encoded) => hex::decode(encoded.trim())
                .map(Some)
                .map_err(|_| StorageError::Corrupted(format!("keychain item '{}' is not hex", key))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}
