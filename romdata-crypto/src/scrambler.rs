//! 3DS AES engine key scrambler.
//!
//! The console never stores "normal" keys for most keyslots. Instead it feeds
//! a KeyX and a KeyY through a fixed scrambler:
//!
//! ```text
//! normal = ROL128((ROL128(KeyX, 2) ^ KeyY) + C, 87)
//! ```
//!
//! All operands are 128-bit big-endian integers.

use sha2::{Digest, Sha256};

/// Scrambler constant `C`.
pub const CTR_SCRAMBLER: u128 = 0x1FF9_E9AA_C5FE_0408_0245_91DC_5D52_768A;

/// Run the scrambler on a KeyX/KeyY pair.
#[must_use]
pub fn scramble(key_x: &[u8; 16], key_y: &[u8; 16]) -> [u8; 16] {
    let x = u128::from_be_bytes(*key_x);
    let y = u128::from_be_bytes(*key_y);

    (x.rotate_left(2) ^ y)
        .wrapping_add(CTR_SCRAMBLER)
        .rotate_left(87)
        .to_be_bytes()
}

/// KeyY replacement used by titles with the "new KeyY generator" flag.
///
/// `KeyY' = SHA256(KeyY || seed)[0..16]`
#[must_use]
pub fn seeded_key_y(key_y: &[u8; 16], seed: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(key_y);
    hasher.update(seed);
    let digest = hasher.finalize();

    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Derive a container key from a base key (KeyX), the container's KeyY and an
/// optional per-title seed.
///
/// Pure and deterministic: no I/O, no hidden state.
#[must_use]
pub fn derive_normal_key(key_x: &[u8; 16], key_y: &[u8; 16], seed: Option<&[u8; 16]>) -> [u8; 16] {
    match seed {
        Some(seed) => scramble(key_x, &seeded_key_y(key_y, seed)),
        None => scramble(key_x, key_y),
    }
}
