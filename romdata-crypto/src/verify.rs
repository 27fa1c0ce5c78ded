//! Key verification.
//!
//! A key slot may carry verification data: the string
//! [`VERIFY_TEST_STRING`] encrypted with the key in AES-128-ECB. Decrypting
//! it with the candidate key must give the string back.

use core::fmt;

use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128, Block};

use crate::keystore::KeyStore;

/// Known plaintext for key verification data.
pub const VERIFY_TEST_STRING: [u8; 16] = *b"AES-128-ECB-TEST";

/// Outcome of obtaining and validating the keys for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyResult {
    /// Keys were found and (where possible) validated.
    Ok,
    /// A required key slot (or seed) is missing from the key store.
    KeyNotFound,
    /// Key material exists but has the wrong size or fails its test vector.
    KeyInvalid,
    /// Derived keys did not reproduce a known-plaintext hash.
    Mismatch,
    /// The container is not encrypted.
    NotEncrypted,
    /// Encryption scheme not recognized.
    Unknown,
}

impl VerifyResult {
    /// Whether reads of encrypted regions may proceed.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::KeyNotFound => "key not found",
            Self::KeyInvalid => "key invalid",
            Self::Mismatch => "key mismatch",
            Self::NotEncrypted => "not encrypted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Check `key` against its verification data.
#[must_use]
pub fn verify_key(key: &[u8; 16], verify_data: &[u8; 16]) -> bool {
    let cipher = Aes128::new(key.into());
    let mut block = Block::clone_from_slice(verify_data);
    cipher.decrypt_block(&mut block);
    block.as_slice() == VERIFY_TEST_STRING
}

/// Fetch a 16-byte key from `store`, validating its length and, when the
/// store has verification data for the slot, its test vector.
pub fn fetch_key<K: KeyStore + ?Sized>(store: &K, slot: &str) -> Result<[u8; 16], VerifyResult> {
    let Some(raw) = store.get(slot) else {
        #[cfg(feature = "logging")]
        tracing::debug!("key slot {slot} not present");
        return Err(VerifyResult::KeyNotFound);
    };

    let key: [u8; 16] = raw.try_into().map_err(|_| {
        #[cfg(feature = "logging")]
        tracing::debug!("key slot {slot} has {} bytes, expected 16", raw.len());
        VerifyResult::KeyInvalid
    })?;

    if let Some(verify_data) = store.verify_data(slot)
        && !verify_key(&key, &verify_data)
    {
        #[cfg(feature = "logging")]
        tracing::debug!("key slot {slot} failed its verification vector");
        return Err(VerifyResult::KeyInvalid);
    }

    Ok(key)
}
