//! Bond record — the durable trust anchor for one peripheral

use super::BondError;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest device identifier accepted (hardware addresses, UUIDs, resolved RPAs)
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// What the application knows about a discovered peripheral.
///
/// Scanning libraries hand out their own device objects; the core only ever
/// asks for these three things.
pub trait Peripheral: Send + Sync {
    /// Resolved identity address of the peripheral
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn rssi(&self) -> Option<i16> {
        None
    }
}

/// Plain-data peripheral, for callers without their own type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

impl Peripheral for DiscoveredPeripheral {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

/// Device ids become storage keys, so the alphabet is kept to what
/// addresses and UUIDs actually use.
pub fn validate_device_id(device_id: &str) -> Result<(), BondError> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(BondError::InvalidDeviceId(format!(
            "length must be 1..={}",
            MAX_DEVICE_ID_LEN
        )));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'))
    {
        return Err(BondError::InvalidDeviceId(format!(
            "unsupported characters in {:?}",
            device_id
        )));
    }
    Ok(())
}

/// Lifecycle state of a bond
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BondState {
    Unbonded,
    Bonding,
    Bonded,
    Revoked,
}

/// SHA-256 digest of a peripheral's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    /// Parse a hex-encoded fingerprint (64 hex characters)
    pub fn parse(hex_str: &str) -> Result<Self, BondError> {
        let hex_str = hex_str.trim();
        if hex_str.is_empty() {
            return Err(BondError::InvalidFingerprint("fingerprint is empty".into()));
        }
        if hex_str.len() != Self::LEN * 2 {
            return Err(BondError::InvalidFingerprint(format!(
                "expected {} hex characters, got {}",
                Self::LEN * 2,
                hex_str.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|_| BondError::InvalidFingerprint("fingerprint is not hex".into()))?;
        Ok(Self(bytes))
    }

    /// Fingerprint of a peripheral key
    pub fn of_key(key: &PeripheralKey) -> Self {
        let mut h = Sha256::new();
        h.update(key.as_bytes());
        Self(h.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = BondError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

/// A peripheral's Ed25519 verifying key, retained so responses can be verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeripheralKey(VerifyingKey);

impl PeripheralKey {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BondError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            BondError::InvalidFingerprint(format!(
                "public key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| BondError::InvalidFingerprint("public key is not a valid Ed25519 point".into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl From<VerifyingKey> for PeripheralKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl TryFrom<String> for PeripheralKey {
    type Error = BondError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(value.trim())
            .map_err(|_| BondError::InvalidFingerprint("public key is not hex".into()))?;
        Self::from_bytes(&bytes)
    }
}

impl From<PeripheralKey> for String {
    fn from(key: PeripheralKey) -> Self {
        hex::encode(key.as_bytes())
    }
}

/// Digest under which a consumed nonce is remembered
pub fn nonce_digest(nonce: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(b"peribond-nonce-v1");
    h.update(nonce);
    hex::encode(h.finalize())
}

/// Width of the big-endian challenge counter that prefixes every nonce
pub const NONCE_COUNTER_LEN: usize = 8;

/// Challenge counter carried in the first bytes of `nonce`
pub fn nonce_counter(nonce: &[u8]) -> Option<u64> {
    let prefix: [u8; NONCE_COUNTER_LEN] = nonce.get(..NONCE_COUNTER_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The durable trust anchor for one peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondRecord {
    pub device_id: String,
    /// Advisory only; never consulted for trust decisions
    pub device_name: Option<String>,
    /// Set once at bonding time and never changed afterwards
    pub pubkey_fingerprint: Option<Fingerprint>,
    pub public_key: Option<PeripheralKey>,
    /// Signal strength at bonding time, diagnostic only
    pub rssi: Option<i16>,
    pub created_at: i64,
    pub state: BondState,
    pub last_authenticated_at: Option<i64>,
    /// Digest of the most recently consumed nonce
    pub last_nonce: Option<String>,
    /// Digests of recently consumed nonces, oldest first
    #[serde(default)]
    pub nonce_history: Vec<String>,
    /// Counter of the most recently consumed nonce; only ever grows
    #[serde(default)]
    pub challenge_counter: u64,
}

impl BondRecord {
    /// In-memory draft for a ceremony that has just started
    pub fn draft(peripheral: &dyn Peripheral) -> Self {
        Self {
            device_id: peripheral.id().to_string(),
            device_name: peripheral.name().map(str::to_string),
            pubkey_fingerprint: None,
            public_key: None,
            rssi: peripheral.rssi(),
            created_at: now_millis(),
            state: BondState::Bonding,
            last_authenticated_at: None,
            last_nonce: None,
            nonce_history: Vec::new(),
            challenge_counter: 0,
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.state == BondState::Bonded
    }

    /// Fingerprint and key, present on every bonded record
    pub fn trust_material(&self) -> Option<(Fingerprint, PeripheralKey)> {
        match (self.pubkey_fingerprint, self.public_key) {
            (Some(fp), Some(key)) => Some((fp, key)),
            _ => None,
        }
    }

    /// Whether `digest` was already consumed by this bond
    pub fn has_consumed(&self, digest: &str) -> bool {
        self.last_nonce.as_deref() == Some(digest) || self.nonce_history.iter().any(|d| d == digest)
    }

    /// Whether `nonce` could still be accepted: its counter is past every
    /// consumed one and its digest is not in the history
    pub fn is_fresh(&self, nonce: &[u8]) -> bool {
        match nonce_counter(nonce) {
            Some(counter) => counter > self.challenge_counter && !self.has_consumed(&nonce_digest(nonce)),
            None => false,
        }
    }

    /// Counter for the next challenge, `None` once the counter space is spent
    pub fn next_challenge_counter(&self) -> Option<u64> {
        self.challenge_counter.checked_add(1)
    }

    /// Record a successful authentication, keeping at most `history_len` digests
    pub fn record_authentication(&mut self, nonce: &[u8], at_millis: i64, history_len: usize) {
        if let Some(counter) = nonce_counter(nonce) {
            self.challenge_counter = self.challenge_counter.max(counter);
        }
        let digest = nonce_digest(nonce);
        // never let the timestamp run backwards
        let at = match self.last_authenticated_at {
            Some(prev) => at_millis.max(prev),
            None => at_millis,
        };
        self.last_authenticated_at = Some(at);
        self.nonce_history.push(digest.clone());
        if self.nonce_history.len() > history_len {
            let excess = self.nonce_history.len() - history_len;
            self.nonce_history.drain(..excess);
        }
        self.last_nonce = Some(digest);
    }

    /// A bonded record must carry a key whose digest is the fingerprint
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.state != BondState::Bonded {
            return Ok(());
        }
        match self.trust_material() {
            Some((fp, key)) if Fingerprint::of_key(&key) == fp => Ok(()),
            Some(_) => Err("fingerprint does not match public key".into()),
            None => Err("bonded record without trust material".into()),
        }
    }
}
