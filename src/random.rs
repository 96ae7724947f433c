//! Random Source — cryptographically secure bytes for challenge nonces

use rand::rngs::OsRng;
use rand::RngCore;

/// Supplier of cryptographically secure random bytes
pub trait RandomSource: Send + Sync {
    /// Fill `dest` entirely or fail; partial output is never used
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<(), RandomError>;
}

/// Operating-system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<(), RandomError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| RandomError::Unavailable(e.to_string()))
    }
}

/// Draw `len` bytes, retrying up to `retry_limit` extra times on failure
pub fn draw_with_retry(
    source: &dyn RandomSource,
    len: usize,
    retry_limit: u32,
) -> Result<Vec<u8>, RandomError> {
    let mut buf = vec![0u8; len];
    let mut attempt = 0;
    loop {
        match source.fill_bytes(&mut buf) {
            Ok(()) => return Ok(buf),
            Err(e) if attempt < retry_limit => {
                attempt += 1;
                log::warn!("Random source read failed (attempt {}): {}", attempt, e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Random source failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RandomError {
    #[error("Random source unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
    }

    impl RandomSource for Flaky {
        fn fill_bytes(&self, dest: &mut [u8]) -> Result<(), RandomError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(RandomError::Unavailable("entropy pool not ready".into()));
            }
            dest.fill(0xAB);
            Ok(())
        }
    }

    #[test]
    fn test_os_random_fills() {
        let a = draw_with_retry(&OsRandom, 32, 0).unwrap();
        let b = draw_with_retry(&OsRandom, 32, 0).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_retry_recovers() {
        let source = Flaky { failures_left: AtomicU32::new(2) };
        let bytes = draw_with_retry(&source, 16, 3).unwrap();
        assert_eq!(bytes, vec![0xAB; 16]);
    }

    #[test]
    fn test_retry_is_bounded() {
        let source = Flaky { failures_left: AtomicU32::new(10) };
        assert!(draw_with_retry(&source, 16, 3).is_err());
        // one initial attempt plus three retries
        assert_eq!(source.failures_left.load(Ordering::SeqCst), 6);
    }
}
