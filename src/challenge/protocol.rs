//! Wire frames exchanged with the peripheral
//!
//! Challenge: `[version][nonce_len][nonce]`
//! Response:  `[version][nonce_len][nonce][signature; 64]`
//!
//! The peripheral signs [`challenge_message`], never the raw nonce, so a
//! signature is bound to both the protocol and the device it came from.

pub const PROTOCOL_VERSION: u8 = 1;
pub const SIGNATURE_LEN: usize = 64;

const SIGNING_DOMAIN: &[u8] = b"peribond-challenge-v1";

/// Bytes the peripheral signs for a challenge
pub fn challenge_message(device_id: &str, nonce: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNING_DOMAIN.len() + 2 + device_id.len() + nonce.len());
    msg.extend_from_slice(SIGNING_DOMAIN);
    msg.extend_from_slice(&(device_id.len() as u16).to_be_bytes());
    msg.extend_from_slice(device_id.as_bytes());
    msg.extend_from_slice(nonce);
    msg
}

/// Read `[version][len][bytes]`, returning the bytes and what follows them
fn split_header(bytes: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let (&version, rest) = bytes.split_first().ok_or(FrameError::Truncated)?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let (&len, rest) = rest.split_first().ok_or(FrameError::Truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(FrameError::Truncated);
    }
    Ok(rest.split_at(len))
}

fn nonce_len_byte(nonce: &[u8]) -> Result<u8, FrameError> {
    u8::try_from(nonce.len()).map_err(|_| FrameError::NonceTooLong(nonce.len()))
}

/// Engine to peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeFrame {
    pub nonce: Vec<u8>,
}

impl ChallengeFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(2 + self.nonce.len());
        out.push(PROTOCOL_VERSION);
        out.push(nonce_len_byte(&self.nonce)?);
        out.extend_from_slice(&self.nonce);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (nonce, rest) = split_header(bytes)?;
        if !rest.is_empty() {
            return Err(FrameError::TrailingBytes(rest.len()));
        }
        Ok(Self { nonce: nonce.to_vec() })
    }
}

/// Peripheral to engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub nonce: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl ResponseFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(2 + self.nonce.len() + SIGNATURE_LEN);
        out.push(PROTOCOL_VERSION);
        out.push(nonce_len_byte(&self.nonce)?);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (nonce, rest) = split_header(bytes)?;
        if rest.len() < SIGNATURE_LEN {
            return Err(FrameError::Truncated);
        }
        if rest.len() > SIGNATURE_LEN {
            return Err(FrameError::TrailingBytes(rest.len() - SIGNATURE_LEN));
        }
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(rest);
        Ok(Self {
            nonce: nonce.to_vec(),
            signature,
        })
    }
}

/// Malformed frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame truncated")]
    Truncated,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Frame has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("Nonce of {0} bytes does not fit a frame")]
    NonceTooLong(usize),
}
