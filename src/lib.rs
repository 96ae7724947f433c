//! Peribond — trust anchors for paired peripherals
//!
//! Creates, persists, verifies and revokes the bond record that ties a
//! peripheral's identity to its Ed25519 key, and re-authenticates the
//! peripheral with a signed challenge on every reconnection.

pub mod bond;
pub mod challenge;
pub mod config;
pub mod random;
pub mod storage;

pub use bond::{BondError, BondManager, BondRecord, BondRecordStore, BondState, DiscoveredPeripheral, Peripheral};
pub use challenge::{AuthError, AuthenticatedSession, ChallengeEngine, PeripheralLink, RejectReason, SessionResult};
pub use config::BondConfig;
pub use random::{OsRandom, RandomSource};
pub use storage::{AccessPolicy, SecureStorage, StorageError};

#[cfg(test)]
mod tests;
