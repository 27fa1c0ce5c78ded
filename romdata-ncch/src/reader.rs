use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use romdata_crypto::{AES_BLOCK_SIZE, AesCtrEngine, CipherEngine, KeyStore, VerifyResult};
use sha2::{Digest, Sha256};

use crate::error::NcchError;
use crate::keyset::{CryptoScheme, KeyIssuer, NcchKeys, load_ncch_keys};
use crate::options::NcchOpenOptions;
use crate::partition::PartitionFile;
use crate::sections::{EncSection, SectionMap, SectionRegion, counter_for, region_counter};
use crate::stream::{DecryptStream, resolve_seek};
use crate::structs::{
    EXEFS_HEADER_SIZE, EXHEADER_REGION_SIZE, EXHEADER_SIZE, ExHeader, ExeFsHeader, NCCH_HEADER_SIZE,
    NcchHeader, NonNcchContentType,
};
use crate::window::{Upstream, Window};

/// Offset of the ExHeader within the container.
const EXHEADER_OFFSET: u64 = NCCH_HEADER_SIZE as u64;

/// Hash regions are read in chunks of this size. Multiple of the AES block size.
const HASH_CHUNK_SIZE: u64 = 0x10000;

/// Where the reader is in its setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    Unopened,
    /// Header read and recognized; keys not yet set up.
    HeaderLoaded,
    /// Keys loaded and verified, or the content isn't encrypted.
    KeysVerified,
    /// Plaintext reads work; encrypted reads fail with the verify result.
    KeysUnavailable,
    /// Not an NCCH. The whole window is passed through.
    PlaintextFallback,
    Closed,
}

/// What the window turned out to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Ncch,
    NonNcch(NonNcchContentType),
}

/// Regions declared by the NCCH header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NcchRegion {
    Plain,
    Logo,
    ExeFs,
    RomFs,
}

impl NcchRegion {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "plain region",
            Self::Logo => "logo region",
            Self::ExeFs => "ExeFS",
            Self::RomFs => "RomFS",
        }
    }
}

#[derive(Debug, Default)]
enum LoadState<T> {
    #[default]
    NotLoaded,
    Loaded(T),
    Failed,
}

impl<T> LoadState<T> {
    const fn get(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            _ => None,
        }
    }
}

/// Random-access reader over the decrypted contents of an NCCH container.
///
/// The reader parses the header on open, picks and verifies a key pair, and
/// then decrypts on every read. Encrypted regions must be read in 16-byte
/// aligned chunks; [`PartitionFile`] lifts that restriction for a single
/// region or ExeFS file.
pub struct NcchReader<'a, R, C = AesCtrEngine> {
    stream: DecryptStream<'a, R, C>,
    state: ReaderState,
    classification: Classification,
    header: Option<NcchHeader>,
    issuer: Option<KeyIssuer>,
    exheader: LoadState<Box<ExHeader>>,
    exefs_header: LoadState<ExeFsHeader>,
}

impl NcchReader<'static, File> {
    /// Open a standalone `.cxi`/`.cfa` file.
    pub fn open_file<K: KeyStore + ?Sized>(
        path: impl AsRef<Path>,
        keys: &K,
    ) -> Result<Self, NcchError> {
        let file = File::open(path)?;
        Self::open(file, &NcchOpenOptions::default(), keys, AesCtrEngine)
    }
}

impl<'a, R: Read + Seek, C: CipherEngine> NcchReader<'a, R, C> {
    /// Open a container in a source the reader takes ownership of.
    pub fn open<K: KeyStore + ?Sized>(
        source: R,
        options: &NcchOpenOptions,
        keys: &K,
        cipher: C,
    ) -> Result<Self, NcchError> {
        Self::with_upstream(Upstream::Owned(source), options, keys, cipher)
    }

    /// Open a container in a source owned by the caller, e.g. the decrypted
    /// view of an enclosing container. The source is not closed with the
    /// reader.
    pub fn open_borrowed<K: KeyStore + ?Sized>(
        source: &'a mut R,
        options: &NcchOpenOptions,
        keys: &K,
        cipher: C,
    ) -> Result<Self, NcchError> {
        Self::with_upstream(Upstream::Borrowed(source), options, keys, cipher)
    }

    fn with_upstream<K: KeyStore + ?Sized>(
        mut source: Upstream<'a, R>,
        options: &NcchOpenOptions,
        keys: &K,
        cipher: C,
    ) -> Result<Self, NcchError> {
        let length = match options.length {
            Some(length) => length,
            None => {
                let source_size = source.get_mut().seek(SeekFrom::End(0))?;
                source_size.checked_sub(options.offset).ok_or(NcchError::OutOfRange {
                    position: options.offset,
                    size: source_size,
                })?
            }
        };
        let window =
            Window::new(options.offset, length).with_media_unit_shift(options.media_unit_shift);

        let mut reader = Self {
            stream: DecryptStream::new(source, window, cipher)?,
            state: ReaderState::Unopened,
            classification: Classification::Ncch,
            header: None,
            issuer: None,
            exheader: LoadState::NotLoaded,
            exefs_header: LoadState::NotLoaded,
        };

        if reader.load_header()? {
            reader.setup_keys(keys, options.issuer);
        }
        Ok(reader)
    }

    /// Read and classify the header. Returns `false` for fallback content.
    fn load_header(&mut self) -> Result<bool, NcchError> {
        let mut buf = vec![0u8; NCCH_HEADER_SIZE];
        let read = self.stream.read_at(0, &mut buf)?;
        buf.truncate(read);

        let header = if read == NCCH_HEADER_SIZE {
            Some(NcchHeader::parse(&buf)?).filter(NcchHeader::has_valid_magic)
        } else {
            None
        };

        let Some(header) = header else {
            let content = NonNcchContentType::detect(&buf);
            #[cfg(feature = "logging")]
            tracing::debug!(
                "no NCCH magic at {:#X}, treating as plaintext ({content:?})",
                self.stream.window().offset
            );
            self.classification = Classification::NonNcch(content);
            self.stream.set_keys([[0u8; 16]; 2], VerifyResult::NotEncrypted);
            self.state = ReaderState::PlaintextFallback;
            return Ok(false);
        };

        #[cfg(feature = "logging")]
        tracing::debug!(
            "NCCH {:016X} ({}), version {}",
            header.program_id,
            header.product_code_str(),
            header.version
        );
        self.header = Some(header);
        self.state = ReaderState::HeaderLoaded;
        Ok(true)
    }

    fn setup_keys<K: KeyStore + ?Sized>(&mut self, store: &K, issuer: Option<KeyIssuer>) {
        let Some(header) = self.header.clone() else {
            return;
        };

        match CryptoScheme::from_header(&header) {
            CryptoScheme::None => {
                self.stream.set_keys([[0u8; 16]; 2], VerifyResult::NotEncrypted);
                self.state = ReaderState::KeysVerified;
                return;
            }
            CryptoScheme::Unknown(_) => {
                self.build_sections(false);
                self.stream.set_keys([[0u8; 16]; 2], VerifyResult::Unknown);
                self.state = ReaderState::KeysUnavailable;
                return;
            }
            CryptoScheme::Fixed { .. } | CryptoScheme::Standard { .. } => {}
        }

        let issuers = match issuer {
            Some(issuer) => vec![issuer],
            None => KeyIssuer::FALLBACK_ORDER.to_vec(),
        };

        let mut first_failure = None;
        for issuer in issuers {
            let result = match load_ncch_keys(store, &header, issuer) {
                Ok(keys) => self.try_keys(keys),
                Err(result) => result,
            };

            #[cfg(feature = "logging")]
            tracing::debug!("{issuer:?} keyset: {result}");

            if result.is_ok() {
                self.issuer = Some(issuer);
                self.state = ReaderState::KeysVerified;
                #[cfg(feature = "logging")]
                tracing::debug!("{} encrypted sections", self.stream.sections().len());
                return;
            }
            first_failure.get_or_insert(result);
        }

        let result = first_failure.unwrap_or(VerifyResult::KeyNotFound);
        #[cfg(feature = "logging")]
        tracing::warn!("NCCH {:016X}: no usable keys ({result})", header.program_id);

        self.reset_loaded();
        self.stream.set_keys([[0u8; 16]; 2], result);
        self.build_sections(false);
        self.state = ReaderState::KeysUnavailable;
    }

    /// Install `keys`, map the sections and check them against the hashes in
    /// the header.
    fn try_keys(&mut self, keys: NcchKeys) -> VerifyResult {
        self.reset_loaded();
        self.stream.set_keys(keys, VerifyResult::Ok);
        self.build_sections(true);

        let result = self.verify_hashes();
        if !result.is_ok() {
            self.reset_loaded();
        }
        result
    }

    fn reset_loaded(&mut self) {
        self.exheader = LoadState::NotLoaded;
        self.exefs_header = LoadState::NotLoaded;
    }

    /// Rebuild the section map.
    ///
    /// Without `detailed`, ExeFS is mapped as its header plus one key 0 run.
    /// With it, the ExeFS header is decrypted and every file gets its own
    /// section; if the header can't be used the coarse map is kept.
    fn build_sections(&mut self, detailed: bool) {
        let Some(header) = self.header.as_ref() else {
            return;
        };
        let coarse = coarse_sections(header, self.stream.window());
        *self.stream.sections_mut() = coarse;

        if !detailed || header.exefs_size == 0 {
            return;
        }

        let Ok(exefs_header) = self.read_exefs_header() else {
            return;
        };
        let Some(header) = self.header.as_ref() else {
            return;
        };

        match detailed_sections(header, self.stream.window(), &exefs_header) {
            Some(map) => {
                *self.stream.sections_mut() = map;
                self.exefs_header = LoadState::Loaded(exefs_header);
            }
            None => {
                #[cfg(feature = "logging")]
                tracing::debug!("ExeFS header doesn't describe a valid layout");
            }
        }
    }

    /// Check the keys against the first hash the header provides.
    fn verify_hashes(&mut self) -> VerifyResult {
        let Some(header) = self.header.as_ref() else {
            return VerifyResult::Unknown;
        };
        let window = *self.stream.window();

        let (offset, length, expected) = if header.exheader_size != 0 {
            (EXHEADER_OFFSET, u64::from(EXHEADER_SIZE), header.exheader_hash)
        } else if header.exefs_size != 0 && header.exefs_hash_region_size != 0 {
            (
                window.units_to_bytes(header.exefs_offset),
                window.units_to_bytes(header.exefs_hash_region_size),
                header.exefs_superblock_hash,
            )
        } else if header.romfs_size != 0 && header.romfs_hash_region_size != 0 {
            (
                window.units_to_bytes(header.romfs_offset),
                window.units_to_bytes(header.romfs_hash_region_size),
                header.romfs_superblock_hash,
            )
        } else {
            return VerifyResult::Ok;
        };

        let end = match offset.checked_add(length) {
            Some(end) if end <= window.length => end,
            _ => {
                #[cfg(feature = "logging")]
                tracing::debug!("hash region {offset:#X}+{length:#X} runs past the container");
                return VerifyResult::Mismatch;
            }
        };

        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; length.min(HASH_CHUNK_SIZE) as usize];
        let mut pos = offset;
        while pos < end {
            let n = (end - pos).min(HASH_CHUNK_SIZE) as usize;
            match self.stream.read_at(pos, &mut chunk[..n]) {
                Ok(read) if read == n => hasher.update(&chunk[..n]),
                _ => return VerifyResult::Mismatch,
            }
            pos += n as u64;
        }

        if hasher.finalize().as_slice() == expected {
            VerifyResult::Ok
        } else {
            VerifyResult::Mismatch
        }
    }

    fn read_exefs_header(&mut self) -> Result<ExeFsHeader, NcchError> {
        let header = self.header.as_ref().ok_or(NcchError::NotPresent("NCCH header"))?;
        if header.exefs_size == 0 {
            return Err(NcchError::NotPresent("ExeFS"));
        }
        let offset = self.stream.window().units_to_bytes(header.exefs_offset);

        let mut buf = vec![0u8; EXEFS_HEADER_SIZE];
        let n = self.stream.read_at(offset, &mut buf)?;
        ExeFsHeader::parse(&buf[..n])
    }

    fn read_exheader(&mut self) -> Result<ExHeader, NcchError> {
        let header = self.header.as_ref().ok_or(NcchError::NotPresent("NCCH header"))?;
        match header.exheader_size {
            0 => return Err(NcchError::NotPresent("ExHeader")),
            EXHEADER_SIZE => {}
            other => {
                return Err(NcchError::InvalidHeader(format!(
                    "ExHeader size {other:#X}, expected {EXHEADER_SIZE:#X}"
                )));
            }
        }

        let mut buf = vec![0u8; EXHEADER_REGION_SIZE];
        let n = self.stream.read_at(EXHEADER_OFFSET, &mut buf)?;
        ExHeader::parse(&buf[..n])
    }

    /// Load and cache the ExHeader.
    ///
    /// A failed load can be retried; it never replaces a header that was
    /// already loaded.
    pub fn load_exheader(&mut self) -> Result<&ExHeader, NcchError> {
        if self.exheader.get().is_none() {
            match self.read_exheader() {
                Ok(exheader) => self.exheader = LoadState::Loaded(Box::new(exheader)),
                Err(e) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("failed to load ExHeader: {e}");
                    self.exheader = LoadState::Failed;
                    return Err(e);
                }
            }
        }
        self.exheader
            .get()
            .map(|exheader| &**exheader)
            .ok_or(NcchError::NotPresent("ExHeader"))
    }

    /// Load and cache the ExeFS header.
    pub fn load_exefs_header(&mut self) -> Result<&ExeFsHeader, NcchError> {
        if self.exefs_header.get().is_none() {
            match self.read_exefs_header() {
                Ok(exefs_header) => self.exefs_header = LoadState::Loaded(exefs_header),
                Err(e) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("failed to load ExeFS header: {e}");
                    self.exefs_header = LoadState::Failed;
                    return Err(e);
                }
            }
        }
        self.exefs_header
            .get()
            .ok_or(NcchError::NotPresent("ExeFS header"))
    }

    pub fn exheader_failed(&self) -> bool {
        matches!(self.exheader, LoadState::Failed)
    }

    pub fn exefs_header_failed(&self) -> bool {
        matches!(self.exefs_header, LoadState::Failed)
    }

    pub const fn state(&self) -> ReaderState {
        self.state
    }

    pub const fn verify_result(&self) -> VerifyResult {
        self.stream.verify_result()
    }

    /// Were debug (development unit) keys used?
    pub fn is_debug(&self) -> bool {
        self.issuer.is_some_and(KeyIssuer::is_debug)
    }

    pub const fn issuer(&self) -> Option<KeyIssuer> {
        self.issuer
    }

    pub const fn classification(&self) -> Classification {
        self.classification
    }

    /// Content type of fallback content; `None` for NCCH.
    pub const fn non_ncch_content_type(&self) -> Option<NonNcchContentType> {
        match self.classification {
            Classification::Ncch => None,
            Classification::NonNcch(content) => Some(content),
        }
    }

    pub const fn header(&self) -> Option<&NcchHeader> {
        self.header.as_ref()
    }

    /// Descriptive content type, e.g. `CXI` or `NARC`.
    pub fn content_type(&self) -> Option<&'static str> {
        match self.classification {
            Classification::Ncch => self.header.as_ref().and_then(NcchHeader::content_type_name),
            Classification::NonNcch(content) => content.name(),
        }
    }

    pub const fn media_unit_shift(&self) -> u8 {
        self.stream.window().media_unit_shift
    }

    /// Container size as declared by the header, or the window length for
    /// fallback content.
    pub fn partition_size(&self) -> u64 {
        match &self.header {
            Some(header) => self.stream.window().units_to_bytes(header.content_size),
            None => self.stream.size(),
        }
    }

    /// Byte offset and length of a region. `None` if the header doesn't
    /// declare it.
    pub fn region(&self, kind: NcchRegion) -> Option<(u64, u64)> {
        let header = self.header.as_ref()?;
        let (offset, size) = match kind {
            NcchRegion::Plain => (header.plain_region_offset, header.plain_region_size),
            NcchRegion::Logo => (header.logo_region_offset, header.logo_region_size),
            NcchRegion::ExeFs => (header.exefs_offset, header.exefs_size),
            NcchRegion::RomFs => (header.romfs_offset, header.romfs_size),
        };
        let window = self.stream.window();
        (size != 0).then(|| (window.units_to_bytes(offset), window.units_to_bytes(size)))
    }

    pub const fn sections(&self) -> &SectionMap {
        self.stream.sections()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, NcchError> {
        self.stream.read(buf)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, NcchError> {
        self.stream.read_at(offset, buf)
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), NcchError> {
        self.stream.seek(pos)
    }

    pub const fn tell(&self) -> u64 {
        self.stream.tell()
    }

    pub const fn size(&self) -> u64 {
        self.stream.size()
    }

    /// Open one ExeFS file for reading.
    pub fn open_exefs_file(&mut self, name: &str) -> Result<PartitionFile<'_, 'a, R, C>, NcchError> {
        let exefs_offset = self
            .region(NcchRegion::ExeFs)
            .map(|(offset, _)| offset)
            .ok_or(NcchError::NotPresent("ExeFS"))?;

        let (_, file) = self
            .load_exefs_header()?
            .find(name)
            .ok_or(NcchError::NotPresent("ExeFS file"))?;
        let start = exefs_offset + EXEFS_HEADER_SIZE as u64 + u64::from(file.offset);
        let length = u64::from(file.size);

        PartitionFile::new(self, start, length)
    }

    /// Open a whole region for reading.
    pub fn open_region(&mut self, kind: NcchRegion) -> Result<PartitionFile<'_, 'a, R, C>, NcchError> {
        let (start, length) = self.region(kind).ok_or(NcchError::NotPresent(kind.name()))?;
        PartitionFile::new(self, start, length)
    }

    /// Release the source. Later reads fail with [`NcchError::Closed`].
    pub fn close(&mut self) {
        drop(self.stream.close());
        self.reset_loaded();
        self.state = ReaderState::Closed;
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self.state, ReaderState::Closed)
    }

    /// Consume the reader, returning the source if it was owned.
    pub fn into_inner(self) -> Option<R> {
        self.stream.into_inner()
    }
}

/// Sections that don't need the ExeFS header: the ExHeader, the ExeFS header
/// followed by one key 0 run over the rest of ExeFS, and RomFS.
fn coarse_sections(header: &NcchHeader, window: &Window) -> SectionMap {
    let mut map = SectionMap::new();
    let mut add = |region: SectionRegion, origin: u64, address: u64, length: u64, key_index: u8| {
        let base = region_counter(header.program_id, header.version, region, origin);
        let section = EncSection {
            address,
            counter_base: counter_for(base, origin, address),
            length,
            key_index,
            region,
        };
        if let Err(_e) = map.insert(section) {
            #[cfg(feature = "logging")]
            tracing::debug!("skipping section: {_e}");
        }
    };

    if header.exheader_size != 0 {
        add(
            SectionRegion::ExHeader,
            EXHEADER_OFFSET,
            EXHEADER_OFFSET,
            EXHEADER_REGION_SIZE as u64,
            0,
        );
    }

    if header.exefs_size != 0 {
        let exefs_offset = window.units_to_bytes(header.exefs_offset);
        let exefs_size = window.units_to_bytes(header.exefs_size);
        let header_size = (EXEFS_HEADER_SIZE as u64).min(exefs_size);
        add(SectionRegion::ExeFsHeader, exefs_offset, exefs_offset, header_size, 0);
        add(
            SectionRegion::ExeFsFile,
            exefs_offset,
            exefs_offset + header_size,
            exefs_size - header_size,
            0,
        );
    }

    if header.romfs_size != 0 {
        let romfs_offset = window.units_to_bytes(header.romfs_offset);
        add(
            SectionRegion::RomFs,
            romfs_offset,
            romfs_offset,
            window.units_to_bytes(header.romfs_size),
            1,
        );
    }

    map
}

/// Full section map with one section per ExeFS file. `None` if the ExeFS
/// header describes files outside ExeFS or overlapping each other.
fn detailed_sections(
    header: &NcchHeader,
    window: &Window,
    exefs_header: &ExeFsHeader,
) -> Option<SectionMap> {
    let mut map = SectionMap::new();

    if header.exheader_size != 0 {
        let base = region_counter(
            header.program_id,
            header.version,
            SectionRegion::ExHeader,
            EXHEADER_OFFSET,
        );
        map.insert(EncSection {
            address: EXHEADER_OFFSET,
            counter_base: base,
            length: EXHEADER_REGION_SIZE as u64,
            key_index: 0,
            region: SectionRegion::ExHeader,
        })
        .ok()?;
    }

    let exefs_offset = window.units_to_bytes(header.exefs_offset);
    let exefs_end = exefs_offset + window.units_to_bytes(header.exefs_size);
    let base = region_counter(
        header.program_id,
        header.version,
        SectionRegion::ExeFsHeader,
        exefs_offset,
    );
    map.insert(EncSection {
        address: exefs_offset,
        counter_base: base,
        length: EXEFS_HEADER_SIZE as u64,
        key_index: 0,
        region: SectionRegion::ExeFsHeader,
    })
    .ok()?;

    for file in exefs_header.iter_files() {
        let address = exefs_offset + EXEFS_HEADER_SIZE as u64 + u64::from(file.offset);
        let length = u64::from(file.size).next_multiple_of(AES_BLOCK_SIZE as u64);
        if address % AES_BLOCK_SIZE as u64 != 0 || address + length > exefs_end {
            return None;
        }

        let key_index = if file.is_named("icon") || file.is_named("banner") {
            0
        } else {
            1
        };
        map.insert(EncSection {
            address,
            counter_base: counter_for(base, exefs_offset, address),
            length,
            key_index,
            region: SectionRegion::ExeFsFile,
        })
        .ok()?;
    }

    if header.romfs_size != 0 {
        let romfs_offset = window.units_to_bytes(header.romfs_offset);
        map.insert(EncSection {
            address: romfs_offset,
            counter_base: region_counter(
                header.program_id,
                header.version,
                SectionRegion::RomFs,
                romfs_offset,
            ),
            length: window.units_to_bytes(header.romfs_size),
            key_index: 1,
            region: SectionRegion::RomFs,
        })
        .ok()?;
    }

    Some(map)
}

impl<R: Read + Seek, C: CipherEngine> Read for NcchReader<'_, R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut self.stream, buf)
    }
}

impl<R: Read + Seek, C: CipherEngine> Seek for NcchReader<'_, R, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.tell(), self.size())?;
        NcchReader::seek(self, target)?;
        Ok(target)
    }
}
