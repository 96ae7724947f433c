//! Secure Storage — capability-only seam over an encrypted key-value store
//!
//! Every bond record ends up here as an opaque blob. Adapters provided:
//! - **Memory**: sealed in-process store with fault injection (tests, simulation)
//! - **Sealed file**: one XChaCha20-Poly1305 sealed file per key
//! - **Keyring**: OS keychain via the `keyring` crate (feature `os-keyring`)
//!
//! Adapters carry no business logic. Any operation may block on a
//! user-presence prompt, so all of them are async and may come back
//! `UserCancelled` or `AuthenticationFailed`.

pub mod memory;
pub mod sealed_file;
mod sealing;
#[cfg(feature = "os-keyring")]
pub mod keychain;

pub use memory::{MemoryStorage, StorageOp};
pub use sealed_file::SealedFileStorage;
pub use sealing::SealingKey;
#[cfg(feature = "os-keyring")]
pub use keychain::KeyringStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Access options recognized by every adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Reads and writes need biometric or device-credential confirmation
    pub require_user_presence: bool,
    /// Item stays unreadable until the device has been unlocked once since boot
    pub after_first_unlock_only: bool,
}

/// Encrypted key-value store backed by the platform
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Store `value` under `key`, replacing any previous blob atomically
    async fn put(&self, key: &str, value: &[u8], policy: &AccessPolicy) -> Result<(), StorageError>;

    /// Fetch the blob under `key`; a missing key is `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `key`; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Platform hook for user-presence prompts (biometrics / device passcode)
#[async_trait]
pub trait UserPresence: Send + Sync {
    /// Ask the user to confirm an access; `reason` is shown in the prompt
    async fn confirm(&self, reason: &str) -> Result<(), StorageError>;

    /// Whether the device has been unlocked at least once since boot
    fn unlocked_since_boot(&self) -> bool {
        true
    }
}

/// Gate an access against a policy, prompting through `presence` when needed
pub(crate) async fn enforce_policy(
    presence: Option<&dyn UserPresence>,
    policy: &AccessPolicy,
    reason: &str,
) -> Result<(), StorageError> {
    if policy.after_first_unlock_only {
        if let Some(gate) = presence {
            if !gate.unlocked_since_boot() {
                return Err(StorageError::Unavailable(
                    "device not unlocked since boot".into(),
                ));
            }
        }
    }
    if policy.require_user_presence {
        match presence {
            Some(gate) => gate.confirm(reason).await?,
            None => {
                return Err(StorageError::Unavailable(
                    "user presence required but no prompt is available".into(),
                ))
            }
        }
    }
    Ok(())
}

/// Secure storage failures, surfaced to callers with their specific kind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Secure storage unavailable: {0}")]
    Unavailable(String),

    #[error("User cancelled the authentication prompt")]
    UserCancelled,

    #[error("User authentication failed")]
    AuthenticationFailed,

    #[error("Stored data failed integrity check: {0}")]
    Corrupted(String),
}
