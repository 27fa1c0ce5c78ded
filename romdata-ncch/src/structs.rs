//! NCCH header structures and parsing
//!
//! An NCCH container has the following layout. Offsets and sizes stored in
//! the header are in media units (`1 << media_unit_shift` bytes, normally
//! 0x200).
//!
//! | Region          | Offset          | Encryption                         |
//! |-----------------|-----------------|------------------------------------|
//! | NCCH header     | `0x000`         | Always plaintext                   |
//! | ExHeader        | `0x200`         | Key 0                              |
//! | Plain region    | header          | Plaintext                          |
//! | Logo            | header          | Plaintext                          |
//! | ExeFS           | header          | Header, `icon`, `banner`: key 0; other files: key 1 |
//! | RomFS           | header          | Key 1                              |

use std::io::Cursor;

use binrw::BinRead;
use enumflags2::{BitFlags, bitflags};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::NcchError;

/// Expected NCCH magic, at offset 0x100.
pub const NCCH_MAGIC: [u8; 4] = *b"NCCH";

/// Size of the NCCH header, including the RSA signature.
pub const NCCH_HEADER_SIZE: usize = 0x200;

/// Size of the ExHeader region (ExHeader plus access descriptor).
pub const EXHEADER_REGION_SIZE: usize = 0x800;

/// Size of the ExHeader proper, as declared in the NCCH header.
pub const EXHEADER_SIZE: u32 = 0x400;

/// Size of the ExeFS header.
pub const EXEFS_HEADER_SIZE: usize = 0x200;

/// Number of file slots in the ExeFS header.
pub const EXEFS_MAX_FILES: usize = 10;

/// Default media unit shift (0x200-byte media units).
pub const DEFAULT_MEDIA_UNIT_SHIFT: u8 = 9;

/// Indexes into [`NcchHeader::flags`].
pub mod flag_index {
    pub const CRYPTO_METHOD: usize = 3;
    pub const PLATFORM: usize = 4;
    pub const CONTENT_TYPE: usize = 5;
    pub const CONTENT_UNIT_SIZE: usize = 6;
    pub const BIT_MASKS: usize = 7;
}

/// NCCH flags[7] bitmask
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NcchFlag {
    FixedCryptoKey = 0x01,
    NoMountRomFs = 0x02,
    NoCrypto = 0x04,
    NewKeyYGenerator = 0x20,
}

/// NCCH flags[5] content type bits
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentTypeFlag {
    Data = 0x01,
    Executable = 0x02,
    SystemUpdate = 0x04,
    Manual = 0x08,
    Trial = 0x10,
}

/// NCCH flags[3]: which keyslot generates the secondary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CryptoMethod {
    /// Keyslot 0x2C, same as the primary key.
    Original = 0x00,
    /// Keyslot 0x25 (firmware 7.x).
    Seven = 0x01,
    /// Keyslot 0x18 (New3DS 9.3).
    NineThree = 0x0A,
    /// Keyslot 0x1B (New3DS 9.6).
    NineSix = 0x0B,
}

impl CryptoMethod {
    /// Keyslot whose KeyX is used for the secondary key.
    #[must_use]
    pub const fn keyslot(self) -> u8 {
        match self {
            Self::Original => 0x2C,
            Self::Seven => 0x25,
            Self::NineThree => 0x18,
            Self::NineSix => 0x1B,
        }
    }
}

/// Content that failed the NCCH magic check but was recognized anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NonNcchContentType {
    #[default]
    Unknown,
    /// DS cartridge whitelist.
    Ndht,
    /// Nitro archive.
    Narc,
}

impl NonNcchContentType {
    /// Classify content by the first bytes of the window.
    #[must_use]
    pub fn detect(magic: &[u8]) -> Self {
        match magic.get(..4) {
            Some(b"NDHT") => Self::Ndht,
            Some(b"NARC") => Self::Narc,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Ndht => Some("NDHT"),
            Self::Narc => Some("NARC"),
        }
    }
}

/// NCCH header, including the RSA-2048 signature (all little-endian).
#[repr(C)]
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct NcchHeader {
    pub signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub content_size: u32,
    pub partition_id: u64,
    pub maker_code: [u8; 2],
    pub version: u16,
    pub seed_check: u32,
    pub program_id: u64,
    pub reserved1: [u8; 0x10],
    pub logo_hash: [u8; 0x20],
    pub product_code: [u8; 0x10],
    pub exheader_hash: [u8; 0x20],
    pub exheader_size: u32,
    pub reserved2: u32,
    pub flags: [u8; 8],
    pub plain_region_offset: u32,
    pub plain_region_size: u32,
    pub logo_region_offset: u32,
    pub logo_region_size: u32,
    pub exefs_offset: u32,
    pub exefs_size: u32,
    pub exefs_hash_region_size: u32,
    pub reserved3: u32,
    pub romfs_offset: u32,
    pub romfs_size: u32,
    pub romfs_hash_region_size: u32,
    pub reserved4: u32,
    pub exefs_superblock_hash: [u8; 0x20],
    pub romfs_superblock_hash: [u8; 0x20],
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl NcchHeader {
    /// Parse an NCCH header from a byte buffer.
    ///
    /// The magic is not checked here: callers use [`Self::has_valid_magic`]
    /// to decide between NCCH and non-NCCH content.
    pub fn parse(buffer: &[u8]) -> Result<Self, NcchError> {
        if buffer.len() < NCCH_HEADER_SIZE {
            return Err(NcchError::InvalidHeader(format!(
                "header needs {NCCH_HEADER_SIZE:#X} bytes, got {:#X}",
                buffer.len()
            )));
        }
        let mut cursor = Cursor::new(buffer);
        Self::read(&mut cursor)
            .map_err(|e| NcchError::InvalidHeader(format!("Failed to read NCCH header: {e}")))
    }

    #[must_use]
    pub fn has_valid_magic(&self) -> bool {
        self.magic == NCCH_MAGIC
    }

    #[must_use]
    pub fn flags_bits(&self) -> BitFlags<NcchFlag> {
        BitFlags::from_bits_truncate(self.flags[flag_index::BIT_MASKS])
    }

    #[must_use]
    pub fn content_type_bits(&self) -> BitFlags<ContentTypeFlag> {
        BitFlags::from_bits_truncate(self.flags[flag_index::CONTENT_TYPE])
    }

    /// Crypto method, or the raw value if it isn't one we know.
    pub fn crypto_method(&self) -> Result<CryptoMethod, u8> {
        let raw = self.flags[flag_index::CRYPTO_METHOD];
        CryptoMethod::try_from(raw).map_err(|_| raw)
    }

    /// 1 = Old3DS, 2 = New3DS.
    #[must_use]
    pub const fn platform(&self) -> u8 {
        self.flags[flag_index::PLATFORM]
    }

    /// Is the content encrypted at all?
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        !self.flags_bits().contains(NcchFlag::NoCrypto)
    }

    /// System titles have bit 4 set in the title ID high word.
    #[must_use]
    pub const fn is_system_title(&self) -> bool {
        (self.program_id >> 32) & 0x10 != 0
    }

    /// KeyY for the NCCH keys: the first 16 bytes of the signature.
    #[must_use]
    pub fn key_y(&self) -> [u8; 16] {
        let mut key_y = [0u8; 16];
        key_y.copy_from_slice(&self.signature[..16]);
        key_y
    }

    #[must_use]
    pub fn product_code_str(&self) -> String {
        ascii_field(&self.product_code)
    }

    #[must_use]
    pub fn maker_code_str(&self) -> String {
        ascii_field(&self.maker_code)
    }

    /// Human-readable content type.
    #[must_use]
    pub fn content_type_name(&self) -> Option<&'static str> {
        let bits = self.content_type_bits();
        let child = ContentTypeFlag::SystemUpdate | ContentTypeFlag::Manual;

        if bits.contains(child) {
            Some("Download Play")
        } else if bits.contains(ContentTypeFlag::Trial) {
            Some("Demo")
        } else if bits.contains(ContentTypeFlag::Executable) {
            Some("CXI")
        } else if bits.contains(ContentTypeFlag::Manual) {
            Some("Manual")
        } else if bits.contains(ContentTypeFlag::SystemUpdate) {
            Some("Update")
        } else if bits.contains(ContentTypeFlag::Data) {
            Some("CFA")
        } else {
            None
        }
    }
}

/// One file slot in the ExeFS header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct ExeFsFileHeader {
    pub name: [u8; 8],
    /// Offset relative to the end of the ExeFS header.
    pub offset: u32,
    pub size: u32,
}

impl ExeFsFileHeader {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        ascii_field(&self.name)
    }

    /// Does this slot hold the file called `name`?
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..end] == name.as_bytes()
    }
}

/// ExeFS header (0x200 bytes, little-endian).
///
/// ```text
/// 0x000  10 x { [u8;8] name, u32 offset, u32 size }
/// 0x0A0  [u8;0x20] reserved
/// 0x0C0  10 x [u8;0x20] SHA-256, stored in reverse file order
/// ```
#[derive(Debug, Clone, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct ExeFsHeader {
    pub files: [ExeFsFileHeader; EXEFS_MAX_FILES],
    pub reserved: [u8; 0x20],
    pub hashes: [[u8; 0x20]; EXEFS_MAX_FILES],
}

impl ExeFsHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self, NcchError> {
        if buffer.len() < EXEFS_HEADER_SIZE {
            return Err(NcchError::InvalidHeader(format!(
                "ExeFS header needs {EXEFS_HEADER_SIZE:#X} bytes, got {:#X}",
                buffer.len()
            )));
        }

        let mut cursor = Cursor::new(buffer);
        Self::read(&mut cursor)
            .map_err(|e| NcchError::InvalidHeader(format!("Failed to read ExeFS header: {e}")))
    }

    /// Find a file by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(usize, &ExeFsFileHeader)> {
        self.files
            .iter()
            .enumerate()
            .find(|(_, f)| !f.is_empty() && f.is_named(name))
    }

    /// SHA-256 of file slot `index`.
    #[must_use]
    pub fn hash_for(&self, index: usize) -> Option<&[u8; 0x20]> {
        index
            .checked_add(1)
            .and_then(|n| EXEFS_MAX_FILES.checked_sub(n))
            .map(|slot| &self.hashes[slot])
    }

    /// Iterate over the occupied file slots.
    pub fn iter_files(&self) -> impl Iterator<Item = &ExeFsFileHeader> {
        self.files.iter().filter(|f| !f.is_empty())
    }
}

/// Code segment description in the system control info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct CodeSetInfo {
    pub address: u32,
    /// Size in pages.
    pub physical_region_size: u32,
    pub size: u32,
}

/// ExHeader system control info (0x200 bytes).
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct SystemControlInfo {
    pub title: [u8; 8],
    pub reserved1: [u8; 5],
    /// bit 0: compressed `.code`, bit 1: SD application.
    pub flags: u8,
    pub remaster_version: u16,
    pub text: CodeSetInfo,
    pub stack_size: u32,
    pub ro: CodeSetInfo,
    pub reserved2: u32,
    pub data: CodeSetInfo,
    pub bss_size: u32,
    pub dependencies: [u64; 48],
    pub save_data_size: u64,
    pub jump_id: u64,
    pub reserved3: [u8; 0x30],
}

impl SystemControlInfo {
    #[must_use]
    pub fn title_str(&self) -> String {
        ascii_field(&self.title)
    }

    #[must_use]
    pub const fn is_code_compressed(&self) -> bool {
        self.flags & 0x01 != 0
    }

    #[must_use]
    pub const fn is_sd_application(&self) -> bool {
        self.flags & 0x02 != 0
    }

    /// Non-zero dependency title IDs.
    pub fn dependencies(&self) -> impl Iterator<Item = u64> + '_ {
        self.dependencies.iter().copied().filter(|&tid| tid != 0)
    }
}

/// ARM11 local system capabilities (0x170 bytes).
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct Arm11LocalCaps {
    pub program_id: u64,
    pub core_version: u32,
    pub flag1: u8,
    pub flag2: u8,
    pub flag0: u8,
    pub priority: u8,
    pub resource_limits: [u16; 16],
    pub storage_info: [u8; 0x30],
    pub service_access: [[u8; 8]; 32],
    pub reserved: [u8; 0xF],
    pub resource_limit_category: u8,
}

impl Arm11LocalCaps {
    /// Names of the services this title may access.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        self.service_access
            .iter()
            .filter(|s| s[0] != 0)
            .map(|s| ascii_field(s))
            .collect()
    }
}

/// Access control info (0x200 bytes).
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct AccessControlInfo {
    pub arm11_local: Arm11LocalCaps,
    pub arm11_kernel: [u8; 0x80],
    pub arm9: [u8; 0x10],
}

/// NCCH extended header, including the access descriptor (0x800 bytes).
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct ExHeader {
    pub sci: SystemControlInfo,
    pub aci: AccessControlInfo,
    pub access_desc_signature: [u8; 0x100],
    pub ncch_public_key: [u8; 0x100],
    pub access_desc_aci: AccessControlInfo,
}

impl ExHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self, NcchError> {
        if buffer.len() < EXHEADER_REGION_SIZE {
            return Err(NcchError::InvalidHeader(format!(
                "ExHeader needs {EXHEADER_REGION_SIZE:#X} bytes, got {:#X}",
                buffer.len()
            )));
        }
        let mut cursor = Cursor::new(buffer);
        Self::read(&mut cursor)
            .map_err(|e| NcchError::InvalidHeader(format!("Failed to read ExHeader: {e}")))
    }
}
