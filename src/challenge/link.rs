//! Peripheral link — the live connection, owned outside this crate

use async_trait::async_trait;

/// Request/response exchange with a connected peripheral.
///
/// Implemented by the application on top of its wireless stack; the engine
/// only ever sends one challenge and waits for one response.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    async fn exchange(&self, device_id: &str, request: Vec<u8>) -> Result<Vec<u8>, LinkError>;
}

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Peripheral {0} is not connected")]
    NotConnected(String),

    #[error("Link error: {0}")]
    Io(String),
}
