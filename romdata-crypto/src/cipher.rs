//! AES-128-CTR cipher engine.

use aes::Aes128;
use ctr::Ctr128BE;
use cipher::{KeyIvInit, StreamCipher};

use crate::error::CryptoError;

/// AES block size in bytes. Counter values advance once per block.
pub const AES_BLOCK_SIZE: usize = 16;

/// Counter-mode block decryption capability.
///
/// Readers only ever call [`CipherEngine::decrypt`] with a key, the counter
/// value of the first block in `data`, and the ciphertext to decrypt in place.
/// Implementations must be deterministic: the same inputs always produce the
/// same plaintext.
pub trait CipherEngine {
    /// Decrypt `data` in place, starting at counter block `ctr`.
    fn decrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError>;

    /// Encrypt `data` in place. For counter mode this is the same keystream.
    fn encrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError> {
        self.decrypt(key, ctr, data)
    }
}

impl<T: CipherEngine + ?Sized> CipherEngine for &T {
    fn decrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError> {
        (**self).decrypt(key, ctr, data)
    }
}

impl<T: CipherEngine + ?Sized> CipherEngine for Box<T> {
    fn decrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError> {
        (**self).decrypt(key, ctr, data)
    }
}

/// AES-128 in counter mode with a 128-bit big-endian counter.
///
/// The full 128-bit counter wraps, matching the 3DS AES engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCtrEngine;

impl AesCtrEngine {
    pub const fn new() -> Self {
        Self
    }
}

impl CipherEngine for AesCtrEngine {
    fn decrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError> {
        let iv = ctr.to_be_bytes();
        let mut cipher = Ctr128BE::<Aes128>::new(key.into(), (&iv).into());
        cipher
            .try_apply_keystream(data)
            .map_err(|e| CryptoError::AesError(format!("keystream exhausted: {e}")))
    }
}
