//! Cryptographic capabilities used by the ROM container readers.
//!
//! This crate provides the pieces a container reader consumes but does not
//! own: an AES-128-CTR [`CipherEngine`], a [`KeyStore`] of named key slots
//! (with [`KeyConfig`] loading `keys.conf` files), and the 3DS AES engine key
//! scrambler used to derive normal keys from KeyX/KeyY pairs.

pub mod cipher;
pub mod error;
pub mod keystore;
pub mod scrambler;
pub mod verify;

pub use self::cipher::{AES_BLOCK_SIZE, AesCtrEngine, CipherEngine};
pub use error::{CryptoError, KeyConfigError};
pub use keystore::{KeyConfig, KeyStore};
pub use scrambler::{CTR_SCRAMBLER, derive_normal_key, scramble, seeded_key_y};
pub use verify::{VERIFY_TEST_STRING, VerifyResult, fetch_key, verify_key};
