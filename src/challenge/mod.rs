//! Challenge-Response — re-authenticating a bonded peripheral on reconnect
//!
//! - **Protocol**: challenge/response frames and the signed message layout
//! - **Link**: the externally owned transport to a live peripheral
//! - **Engine**: runs one session: nonce, exchange, verify, commit
//! - **Simulated**: an in-process peripheral that answers challenges

pub mod engine;
pub mod link;
pub mod protocol;
pub mod simulated;

pub use engine::ChallengeEngine;
pub use link::{LinkError, PeripheralLink};
pub use protocol::{challenge_message, ChallengeFrame, FrameError, ResponseFrame};
pub use simulated::{ResponseMode, SimulatedPeripheral, SimulatedRadio};

use crate::random::RandomError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a peripheral was not authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Response did not carry a valid signature over this session's challenge
    BadSignature,
    /// A nonce already consumed by this bond came back
    NonceReplay,
    /// No response within `response_timeout`
    Timeout,
    /// The device has no trusted bond
    NoBond,
}

/// A successfully authenticated link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedSession {
    pub device_id: String,
    pub session_id: Uuid,
    /// Epoch milliseconds, as persisted in `last_authenticated_at`
    pub authenticated_at: i64,
}

/// Outcome of one challenge-response session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResult {
    Authenticated(AuthenticatedSession),
    Rejected { reason: RejectReason },
}

impl SessionResult {
    pub fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason } => Some(*reason),
            Self::Authenticated(_) => None,
        }
    }
}

/// Failures that end a session without a verdict on the peripheral
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("A challenge session is already running for {0}")]
    SessionInProgress(String),

    #[error("Cannot draw a challenge nonce: {0}")]
    RandomUnavailable(#[source] RandomError),

    #[error("Cannot guarantee a fresh challenge for {0}: counter exhausted")]
    CounterExhausted(String),

    #[error("Cannot build challenge frame: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] LinkError),
}
