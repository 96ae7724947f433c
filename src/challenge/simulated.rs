//! Simulated peripherals
//!
//! A [`SimulatedPeripheral`] holds an Ed25519 signing key and answers
//! challenge frames the way real firmware does. It can also misbehave:
//! stay silent, replay an old response, or corrupt its signature.
//! [`SimulatedRadio`] routes exchanges to several of them by device id.

use super::link::{LinkError, PeripheralLink};
use super::protocol::{challenge_message, ChallengeFrame, ResponseFrame};
use crate::bond::{Fingerprint, Peripheral, PeripheralKey};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How a simulated peripheral answers the next challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Sign the challenge it was sent
    Honest,
    /// Resend the first response it ever produced
    Replay,
    /// Never answer
    Silent,
    /// Sign correctly, then flip a signature bit
    Tamper,
}

struct State {
    mode: ResponseMode,
    recorded: Option<Vec<u8>>,
    challenges: Vec<Vec<u8>>,
}

/// An in-process peripheral holding its own signing key
pub struct SimulatedPeripheral {
    device_id: String,
    name: Option<String>,
    signing_key: SigningKey,
    latency: Duration,
    state: Mutex<State>,
}

impl SimulatedPeripheral {
    pub fn new(device_id: impl Into<String>, secret: [u8; 32]) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            signing_key: SigningKey::from_bytes(&secret),
            latency: Duration::ZERO,
            state: Mutex::new(State {
                mode: ResponseMode::Honest,
                recorded: None,
                challenges: Vec::new(),
            }),
        }
    }

    /// Peripheral with a freshly generated key
    pub fn generate(device_id: impl Into<String>) -> Self {
        Self::new(device_id, rand::random())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Delay every response by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_mode(&self, mode: ResponseMode) {
        self.state().mode = mode;
    }

    pub fn challenges_seen(&self) -> usize {
        self.state().challenges.len()
    }

    /// Every nonce this peripheral has been challenged with, oldest first
    pub fn challenges(&self) -> Vec<Vec<u8>> {
        self.state().challenges.clone()
    }

    /// Raw Ed25519 public key, as handed over during bonding
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex fingerprint of the public key, as handed over during bonding
    pub fn fingerprint(&self) -> String {
        let key = PeripheralKey::from(self.signing_key.verifying_key());
        Fingerprint::of_key(&key).to_string()
    }

    /// Answer one challenge frame according to the current mode.
    ///
    /// `None` means the peripheral stays silent.
    pub fn respond(&self, request: &[u8]) -> Result<Option<Vec<u8>>, LinkError> {
        let challenge =
            ChallengeFrame::decode(request).map_err(|e| LinkError::Io(format!("bad challenge: {}", e)))?;
        let signature = self
            .signing_key
            .sign(&challenge_message(&self.device_id, &challenge.nonce))
            .to_bytes();
        let mut state = self.state();
        state.challenges.push(challenge.nonce.clone());
        let mut response = ResponseFrame {
            nonce: challenge.nonce,
            signature,
        };

        match state.mode {
            ResponseMode::Silent => return Ok(None),
            ResponseMode::Tamper => response.signature[0] ^= 0x01,
            ResponseMode::Replay => {
                if let Some(old) = &state.recorded {
                    return Ok(Some(old.clone()));
                }
            }
            ResponseMode::Honest => {}
        }
        let bytes = response
            .encode()
            .map_err(|e| LinkError::Io(format!("cannot encode response: {}", e)))?;
        state.recorded.get_or_insert_with(|| bytes.clone());
        Ok(Some(bytes))
    }
}

impl Peripheral for SimulatedPeripheral {
    fn id(&self) -> &str {
        &self.device_id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn rssi(&self) -> Option<i16> {
        Some(-40)
    }
}

#[async_trait]
impl PeripheralLink for SimulatedPeripheral {
    async fn exchange(&self, device_id: &str, request: Vec<u8>) -> Result<Vec<u8>, LinkError> {
        if device_id != self.device_id {
            return Err(LinkError::NotConnected(device_id.to_string()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.respond(&request)? {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }
}

/// Routes exchanges to simulated peripherals by device id
#[derive(Default)]
pub struct SimulatedRadio {
    peripherals: Mutex<HashMap<String, Arc<SimulatedPeripheral>>>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a peripheral into range
    pub fn connect(&self, peripheral: Arc<SimulatedPeripheral>) {
        self.peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peripheral.device_id.clone(), peripheral);
    }

    pub fn disconnect(&self, device_id: &str) -> bool {
        self.peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(device_id)
            .is_some()
    }

    fn get(&self, device_id: &str) -> Option<Arc<SimulatedPeripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .cloned()
    }
}

#[async_trait]
impl PeripheralLink for SimulatedRadio {
    async fn exchange(&self, device_id: &str, request: Vec<u8>) -> Result<Vec<u8>, LinkError> {
        let peripheral = self
            .get(device_id)
            .ok_or_else(|| LinkError::NotConnected(device_id.to_string()))?;
        peripheral.exchange(device_id, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, VerifyingKey};

    fn challenge(nonce: &[u8]) -> Vec<u8> {
        ChallengeFrame { nonce: nonce.to_vec() }.encode().unwrap()
    }

    #[test]
    fn test_honest_response_verifies() {
        let p = SimulatedPeripheral::new("AA:BB", [1u8; 32]);
        let response = p.respond(&challenge(&[4u8; 32])).unwrap().unwrap();
        let frame = ResponseFrame::decode(&response).unwrap();
        assert_eq!(frame.nonce, vec![4u8; 32]);

        let vk = VerifyingKey::from_bytes(&p.public_key()).unwrap();
        vk.verify_strict(
            &challenge_message("AA:BB", &frame.nonce),
            &Signature::from_bytes(&frame.signature),
        )
        .unwrap();
        assert_eq!(p.fingerprint().len(), 64);
    }

    #[test]
    fn test_replay_resends_first_response() {
        let p = SimulatedPeripheral::new("AA:BB", [1u8; 32]);
        let first = p.respond(&challenge(&[1u8; 16])).unwrap().unwrap();
        p.set_mode(ResponseMode::Replay);
        let replayed = p.respond(&challenge(&[2u8; 16])).unwrap().unwrap();
        assert_eq!(first, replayed);
        assert_eq!(p.challenges_seen(), 2);
    }

    #[test]
    fn test_silent_and_tamper() {
        let p = SimulatedPeripheral::new("AA:BB", [1u8; 32]);
        p.set_mode(ResponseMode::Silent);
        assert_eq!(p.respond(&challenge(&[1u8; 16])).unwrap(), None);

        let honest = SimulatedPeripheral::new("AA:BB", [1u8; 32]);
        let good = honest.respond(&challenge(&[1u8; 16])).unwrap().unwrap();
        p.set_mode(ResponseMode::Tamper);
        let bad = p.respond(&challenge(&[1u8; 16])).unwrap().unwrap();
        assert_ne!(good, bad);
    }

    #[tokio::test]
    async fn test_radio_routes_by_device() {
        let radio = SimulatedRadio::new();
        radio.connect(Arc::new(SimulatedPeripheral::generate("AA:BB")));

        assert!(radio.exchange("AA:BB", challenge(&[0u8; 16])).await.is_ok());
        assert_eq!(
            radio.exchange("CC:DD", challenge(&[0u8; 16])).await,
            Err(LinkError::NotConnected("CC:DD".into()))
        );
        assert!(radio.disconnect("AA:BB"));
    }
}
