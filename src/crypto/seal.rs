//! Authenticated symmetric sealing.
//!
//! A [`Sealer`] wraps AES-256-GCM and stamps every sealed value with its
//! creation time so stale ciphertexts can be rejected on open. The output
//! is `base64url(nonce || ciphertext)`; the plaintext carried inside is
//! `8-byte BE unix seconds || payload`.
//!
//! Tampering with any byte, or presenting a value older than the caller's
//! `max_age`, fails closed.

use std::time::Duration;

use aes_gcm::{
    aead::Aead,
    Aes256Gcm, Key, KeyInit, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

use crate::{Error, Result};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Length of the embedded timestamp in bytes.
const STAMP_LEN: usize = 8;

/// Authenticated encryption with an embedded freshness stamp.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Create a sealer from a 256-bit key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is not exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Config(format!(
                "Sealing key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Seal a payload, stamping it with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if encryption fails, which indicates a
    /// broken cipher state rather than bad input.
    pub fn seal(&self, payload: &[u8]) -> Result<String> {
        self.seal_at(payload, chrono::Utc::now().timestamp())
    }

    /// Seal with an explicit timestamp. Split out so tests can age values.
    pub(crate) fn seal_at(&self, payload: &[u8], stamp: i64) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut plaintext = Vec::with_capacity(STAMP_LEN + payload.len());
        plaintext.extend_from_slice(&stamp.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| Error::Internal("AEAD encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Open a sealed value, rejecting tampering and staleness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the value does not decode, fails
    /// authentication, carries a garbled stamp, or is older than `max_age`.
    pub fn open(&self, sealed: &str, max_age: Duration) -> Result<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| rejected())?;
        if raw.len() <= NONCE_LEN {
            return Err(rejected());
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| rejected())?;
        if plaintext.len() < STAMP_LEN {
            return Err(rejected());
        }

        let mut stamp_bytes = [0u8; STAMP_LEN];
        stamp_bytes.copy_from_slice(&plaintext[..STAMP_LEN]);
        let stamp = i64::from_be_bytes(stamp_bytes);
        let age = chrono::Utc::now().timestamp() - stamp;
        if age < 0 || age as u64 > max_age.as_secs() {
            return Err(rejected());
        }

        Ok(plaintext[STAMP_LEN..].to_vec())
    }
}

fn rejected() -> Error {
    Error::Validation("Sealed value rejected".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sealer() -> Sealer {
        let key: [u8; 32] = rand::rng().random();
        Sealer::new(&key).unwrap()
    }

    #[test]
    fn round_trip_recovers_payload() {
        // GIVEN: a sealer and a payload
        let sealer = make_sealer();
        let payload = b"gt-aaaaaaaaaaaaaaaaaaaaaa.bbbbbbbbbbbbbbbbbbbbbb";

        // WHEN: sealed and opened within the age window
        let sealed = sealer.seal(payload).unwrap();
        let opened = sealer.open(&sealed, Duration::from_secs(60)).unwrap();

        // THEN: the payload is recovered
        assert_eq!(opened, payload);
    }

    #[test]
    fn tampering_one_byte_is_rejected() {
        // GIVEN: a sealed value
        let sealer = make_sealer();
        let sealed = sealer.seal(b"payload").unwrap();

        // WHEN: one byte of the encoding is flipped
        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        // THEN: opening fails
        assert!(sealer.open(&tampered, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn stale_values_are_rejected() {
        // GIVEN: a value sealed ten minutes in the past
        let sealer = make_sealer();
        let old = chrono::Utc::now().timestamp() - 600;
        let sealed = sealer.seal_at(b"payload", old).unwrap();

        // THEN: a five-minute max age rejects it, a one-hour max age accepts
        assert!(sealer.open(&sealed, Duration::from_secs(300)).is_err());
        assert!(sealer.open(&sealed, Duration::from_secs(3600)).is_ok());
    }

    #[test]
    fn future_stamps_are_rejected() {
        let sealer = make_sealer();
        let future = chrono::Utc::now().timestamp() + 600;
        let sealed = sealer.seal_at(b"payload", future).unwrap();
        assert!(sealer.open(&sealed, Duration::from_secs(3600)).is_err());
    }

    #[test]
    fn wrong_key_cannot_open() {
        let sealed = make_sealer().seal(b"payload").unwrap();
        let other = make_sealer();
        assert!(other.open(&sealed, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn sealer_requires_256_bit_key() {
        assert!(Sealer::new(&[0u8; 16]).is_err());
        assert!(Sealer::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let sealer = make_sealer();
        for bad in ["", "!!!", "c2hvcnQ"] {
            assert!(sealer.open(bad, Duration::from_secs(60)).is_err());
        }
    }
}
