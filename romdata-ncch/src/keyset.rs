//! NCCH key selection.
//!
//! Every NCCH uses two normal keys. Key 0 always comes from keyslot 0x2C and
//! covers the ExHeader, the ExeFS header and the `icon`/`banner` files. Key 1
//! comes from the keyslot selected by the crypto method and covers the rest.
//! Both share the KeyY stored at the start of the header signature.

use romdata_crypto::{KeyStore, VerifyResult, derive_normal_key, fetch_key};
use sha2::{Digest, Sha256};

use crate::structs::{CryptoMethod, NcchFlag, NcchHeader};

/// Key pair used to decrypt one NCCH.
pub type NcchKeys = [[u8; 16]; 2];

/// Which console keyset a key slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyIssuer {
    /// Production consoles.
    #[default]
    Retail,
    /// Development units.
    Debug,
}

impl KeyIssuer {
    /// Order in which keysets are tried when the caller doesn't pick one.
    pub const FALLBACK_ORDER: [Self; 2] = [Self::Retail, Self::Debug];

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Retail => "ctr-",
            Self::Debug => "ctr-dev-",
        }
    }

    /// Full key slot name, e.g. `ctr-dev-Slot0x2CKeyX`.
    #[must_use]
    pub fn slot_name(self, name: &str) -> String {
        format!("{}{name}", self.prefix())
    }

    #[must_use]
    pub fn keyx_slot(self, keyslot: u8) -> String {
        self.slot_name(&format!("Slot0x{keyslot:02X}KeyX"))
    }

    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

/// How a header says its content is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoScheme {
    /// `NoCrypto` is set.
    None,
    /// Fixed key: the system fixed key for system titles, zeroes otherwise.
    Fixed { system: bool },
    /// Scrambled keys from keyslot 0x2C and the crypto method's keyslot.
    Standard { method: CryptoMethod, seeded: bool },
    /// Crypto method byte we don't know.
    Unknown(u8),
}

impl CryptoScheme {
    #[must_use]
    pub fn from_header(header: &NcchHeader) -> Self {
        let flags = header.flags_bits();
        if flags.contains(NcchFlag::NoCrypto) {
            return Self::None;
        }
        if flags.contains(NcchFlag::FixedCryptoKey) {
            return Self::Fixed {
                system: header.is_system_title(),
            };
        }
        match header.crypto_method() {
            Ok(method) => Self::Standard {
                method,
                seeded: flags.contains(NcchFlag::NewKeyYGenerator),
            },
            Err(raw) => Self::Unknown(raw),
        }
    }
}

/// Seed check value: the first 4 bytes of `SHA256(seed || program_id)`.
#[must_use]
pub fn seed_check(seed: &[u8; 16], program_id: u64) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(program_id.to_le_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Load the key pair for `header` from one keyset.
///
/// Content that isn't encrypted yields [`VerifyResult::NotEncrypted`] and an
/// unknown crypto method yields [`VerifyResult::Unknown`]; neither is
/// retried with another keyset.
pub fn load_ncch_keys<K: KeyStore + ?Sized>(
    store: &K,
    header: &NcchHeader,
    issuer: KeyIssuer,
) -> Result<NcchKeys, VerifyResult> {
    match CryptoScheme::from_header(header) {
        CryptoScheme::None => Err(VerifyResult::NotEncrypted),
        CryptoScheme::Unknown(_raw) => {
            #[cfg(feature = "logging")]
            tracing::debug!("unknown NCCH crypto method {_raw:#04X}");
            Err(VerifyResult::Unknown)
        }
        CryptoScheme::Fixed { system: true } => {
            let key = fetch_key(store, &issuer.slot_name("FixedSystemKey"))?;
            Ok([key, key])
        }
        CryptoScheme::Fixed { system: false } => Ok([[0u8; 16]; 2]),
        CryptoScheme::Standard { method, seeded } => {
            let key_y = header.key_y();

            let primary_x = fetch_key(store, &issuer.keyx_slot(0x2C))?;
            let secondary_x = match method {
                CryptoMethod::Original => primary_x,
                other => fetch_key(store, &issuer.keyx_slot(other.keyslot()))?,
            };

            let seed = if seeded {
                Some(load_seed(store, header)?)
            } else {
                None
            };

            Ok([
                derive_normal_key(&primary_x, &key_y, None),
                derive_normal_key(&secondary_x, &key_y, seed.as_ref()),
            ])
        }
    }
}

fn load_seed<K: KeyStore + ?Sized>(store: &K, header: &NcchHeader) -> Result<[u8; 16], VerifyResult> {
    let Some(seed) = store.seed(header.program_id) else {
        #[cfg(feature = "logging")]
        tracing::debug!("no seed for title {:016X}", header.program_id);
        return Err(VerifyResult::KeyNotFound);
    };

    if seed_check(&seed, header.program_id) != header.seed_check {
        #[cfg(feature = "logging")]
        tracing::debug!("seed for title {:016X} fails its check", header.program_id);
        return Err(VerifyResult::KeyInvalid);
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use romdata_crypto::KeyConfig;

    use super::*;
    use crate::structs::flag_index;

    const KEY_X: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
        0x0F,
    ];
    const KEY_Y: [u8; 16] = [
        0xF0, 0xE0, 0xD0, 0xC0, 0xB0, 0xA0, 0x90, 0x80, 0x70, 0x60, 0x50, 0x40, 0x30, 0x20, 0x10,
        0x00,
    ];
    const SEED: [u8; 16] = [
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E,
        0x1F,
    ];
    const PROGRAM_ID: u64 = 0x0004_0000_00AB_CD00;

    fn header(crypto_method: u8, bits: u8) -> NcchHeader {
        let mut raw = vec![0u8; 0x200];
        raw[..16].copy_from_slice(&KEY_Y);
        raw[0x100..0x104].copy_from_slice(b"NCCH");
        raw[0x118..0x120].copy_from_slice(&PROGRAM_ID.to_le_bytes());
        raw[0x188 + flag_index::CRYPTO_METHOD] = crypto_method;
        raw[0x188 + flag_index::BIT_MASKS] = bits;
        NcchHeader::parse(&raw).unwrap()
    }

    #[test]
    fn slot_names() {
        assert_eq!(KeyIssuer::Retail.keyx_slot(0x2C), "ctr-Slot0x2CKeyX");
        assert_eq!(KeyIssuer::Debug.keyx_slot(0x1B), "ctr-dev-Slot0x1BKeyX");
        assert_eq!(
            KeyIssuer::Debug.slot_name("FixedSystemKey"),
            "ctr-dev-FixedSystemKey"
        );
    }

    #[test]
    fn seed_check_vector() {
        assert_eq!(
            seed_check(&SEED, PROGRAM_ID).to_le_bytes(),
            [0x82, 0xDA, 0x57, 0x39]
        );
    }

    #[test]
    fn no_crypto_and_unknown_method() {
        let store = KeyConfig::new();
        assert_eq!(
            load_ncch_keys(&store, &header(0, 0x04), KeyIssuer::Retail),
            Err(VerifyResult::NotEncrypted)
        );
        assert_eq!(
            load_ncch_keys(&store, &header(0x7F, 0), KeyIssuer::Retail),
            Err(VerifyResult::Unknown)
        );
    }

    #[test]
    fn fixed_key_beats_method_and_seed() {
        let store = KeyConfig::new();
        let keys = load_ncch_keys(&store, &header(0x7F, 0x01 | 0x20), KeyIssuer::Retail).unwrap();
        assert_eq!(keys, [[0u8; 16]; 2]);
    }

    #[test]
    fn standard_keys_are_scrambled() {
        let mut store = KeyConfig::new();
        store.insert_key("ctr-Slot0x2CKeyX", KEY_X.to_vec());

        let keys = load_ncch_keys(&store, &header(0, 0), KeyIssuer::Retail).unwrap();
        let expected = 0x242E_B34F_6308_6F61_3BB3_5946_5229_4505u128.to_be_bytes();
        assert_eq!(keys, [expected, expected]);

        assert_eq!(
            load_ncch_keys(&store, &header(0, 0), KeyIssuer::Debug),
            Err(VerifyResult::KeyNotFound)
        );
        assert_eq!(
            load_ncch_keys(&store, &header(0x0B, 0), KeyIssuer::Retail),
            Err(VerifyResult::KeyNotFound)
        );
    }

    #[test]
    fn seeded_secondary_key() {
        let mut store = KeyConfig::new();
        store.insert_key("ctr-Slot0x2CKeyX", KEY_X.to_vec());

        let mut hdr = header(0, 0x20);
        assert_eq!(
            load_ncch_keys(&store, &hdr, KeyIssuer::Retail),
            Err(VerifyResult::KeyNotFound)
        );

        store.insert_seed(PROGRAM_ID, SEED);
        assert_eq!(
            load_ncch_keys(&store, &hdr, KeyIssuer::Retail),
            Err(VerifyResult::KeyInvalid)
        );

        hdr.seed_check = u32::from_le_bytes([0x82, 0xDA, 0x57, 0x39]);
        let keys = load_ncch_keys(&store, &hdr, KeyIssuer::Retail).unwrap();
        assert_eq!(
            keys[0],
            0x242E_B34F_6308_6F61_3BB3_5946_5229_4505u128.to_be_bytes()
        );
        assert_eq!(
            keys[1],
            0xD11D_83FC_94E6_941A_DCA9_93B2_53BA_08D5u128.to_be_bytes()
        );
    }

    #[test]
    fn bad_verify_data_is_key_invalid() {
        let mut store = KeyConfig::new();
        store.insert_key("ctr-Slot0x2CKeyX", KEY_X.to_vec());
        store.insert_verify_data("ctr-Slot0x2CKeyX", [0u8; 16]);
        assert_eq!(
            load_ncch_keys(&store, &header(0, 0), KeyIssuer::Retail),
            Err(VerifyResult::KeyInvalid)
        );
    }
}
