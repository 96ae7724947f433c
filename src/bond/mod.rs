//! Bonds — durable trust anchors for paired peripherals
//!
//! - **Record**: the bond record, its fingerprint and retained public key
//! - **Store**: serialization of records through secure storage, per-device
//!   write serialization, pending-revocation tracking
//! - **Manager**: the bonding state machine (begin / complete / abort / revoke)

mod record;
mod store;
mod manager;

pub use record::{
    nonce_counter, nonce_digest, now_millis, validate_device_id, BondRecord, BondState,
    DiscoveredPeripheral, Fingerprint, Peripheral, PeripheralKey, MAX_DEVICE_ID_LEN,
    NONCE_COUNTER_LEN,
};
pub use store::BondRecordStore;
pub use manager::BondManager;

use crate::storage::StorageError;

/// Bond lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BondError {
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Failed to persist bond: {0}")]
    PersistenceFailed(#[source] StorageError),

    #[error("Another bonding ceremony is in progress for {0}")]
    SessionInProgress(String),

    #[error("No bond for {0}")]
    NotBonded(String),

    #[error("No open bonding ceremony for {0}")]
    NoCeremony(String),

    #[error("{0} is already bonded with this key; revoke it first")]
    AlreadyBonded(String),

    #[error("Revocation of {device_id} left a stored entry behind: {source}")]
    RevocationIncomplete {
        device_id: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
