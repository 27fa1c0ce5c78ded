//! Key store capability and the `keys.conf` loader.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::KeyConfigError;

/// Read-only lookup of named key slots.
///
/// Readers borrow a key store during setup only; nothing is written back.
pub trait KeyStore {
    /// Raw key material for `slot`, or `None` if the slot is absent.
    fn get(&self, slot: &str) -> Option<&[u8]>;

    /// Verification data for `slot` (see [`crate::verify_key`]).
    fn verify_data(&self, _slot: &str) -> Option<[u8; 16]> {
        None
    }

    /// Per-title seed used by the new KeyY generator.
    fn seed(&self, _program_id: u64) -> Option<[u8; 16]> {
        None
    }
}

impl<T: KeyStore + ?Sized> KeyStore for &T {
    fn get(&self, slot: &str) -> Option<&[u8]> {
        (**self).get(slot)
    }

    fn verify_data(&self, slot: &str) -> Option<[u8; 16]> {
        (**self).verify_data(slot)
    }

    fn seed(&self, program_id: u64) -> Option<[u8; 16]> {
        (**self).seed(program_id)
    }
}

#[derive(Clone, Copy)]
enum Section {
    Keys,
    Verify,
    Seeds,
}

/// In-memory key store, usually loaded from a `keys.conf` file.
///
/// ```text
/// [Keys]
/// ctr-Slot0x2CKeyX=00112233445566778899AABBCCDDEEFF
///
/// [Verify]
/// ctr-Slot0x2CKeyX=...   ; AES-128-ECB("AES-128-ECB-TEST") under the key
///
/// [Seeds]
/// 0004000000123400=...   ; title ID -> 16-byte seed
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyConfig {
    keys: HashMap<String, Vec<u8>>,
    verify: HashMap<String, [u8; 16]>,
    seeds: HashMap<u64, [u8; 16]>,
}

impl KeyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and parse a `keys.conf` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn insert_key(&mut self, slot: impl Into<String>, key: impl Into<Vec<u8>>) {
        self.keys.insert(slot.into(), key.into());
    }

    pub fn insert_verify_data(&mut self, slot: impl Into<String>, data: [u8; 16]) {
        self.verify.insert(slot.into(), data);
    }

    pub fn insert_seed(&mut self, program_id: u64, seed: [u8; 16]) {
        self.seeds.insert(program_id, seed);
    }

    pub fn remove_key(&mut self, slot: &str) -> Option<Vec<u8>> {
        self.keys.remove(slot)
    }

    /// Number of key slots (not counting verification data or seeds).
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for KeyConfig {
    fn get(&self, slot: &str) -> Option<&[u8]> {
        self.keys.get(slot).map(Vec::as_slice)
    }

    fn verify_data(&self, slot: &str) -> Option<[u8; 16]> {
        self.verify.get(slot).copied()
    }

    fn seed(&self, program_id: u64) -> Option<[u8; 16]> {
        self.seeds.get(&program_id).copied()
    }
}

fn parse_block(line: usize, value: &str) -> Result<[u8; 16], KeyConfigError> {
    let bytes = hex::decode(value).map_err(|source| KeyConfigError::InvalidHex { line, source })?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyConfigError::InvalidLength {
            line,
            expected: 16,
            actual,
        })
}

impl FromStr for KeyConfig {
    type Err = KeyConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut config = Self::new();
        let mut section = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw
                .split([';', '#'])
                .next()
                .unwrap_or_default()
                .trim();
            if content.is_empty() {
                continue;
            }

            if let Some(name) = content
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                section = Some(match name.trim() {
                    "Keys" => Section::Keys,
                    "Verify" => Section::Verify,
                    "Seeds" => Section::Seeds,
                    other => {
                        return Err(KeyConfigError::UnknownSection {
                            line,
                            name: other.to_string(),
                        });
                    }
                });
                continue;
            }

            let (name, value) = content
                .split_once('=')
                .ok_or(KeyConfigError::MalformedLine { line })?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                return Err(KeyConfigError::MalformedLine { line });
            }

            match section.ok_or(KeyConfigError::NoSection { line })? {
                Section::Keys => {
                    // Empty values are placeholders for keys the user doesn't have.
                    if value.is_empty() {
                        continue;
                    }
                    let key = hex::decode(value)
                        .map_err(|source| KeyConfigError::InvalidHex { line, source })?;
                    config.insert_key(name, key);
                }
                Section::Verify => {
                    config.insert_verify_data(name, parse_block(line, value)?);
                }
                Section::Seeds => {
                    let program_id = u64::from_str_radix(name, 16).map_err(|_| {
                        KeyConfigError::InvalidTitleId {
                            line,
                            value: name.to_string(),
                        }
                    })?;
                    config.insert_seed(program_id, parse_block(line, value)?);
                }
            }
        }

        #[cfg(feature = "logging")]
        tracing::debug!(
            "loaded {} key slots, {} seeds",
            config.keys.len(),
            config.seeds.len()
        );

        Ok(config)
    }
}
