//! Random-access reader for Nintendo 3DS NCCH containers.
//!
//! [`NcchReader`] opens an NCCH inside any `Read + Seek` source, picks the
//! keys it needs from a [`romdata_crypto::KeyStore`] and exposes the
//! decrypted contents as a seekable stream. Decryption happens on demand,
//! only for the bytes that are read. Content that isn't an NCCH is passed
//! through unchanged.

pub mod error;
pub mod keyset;
pub mod options;
pub mod partition;
pub mod reader;
pub mod sections;
pub mod stream;
pub mod structs;
pub mod window;

pub use error::NcchError;
pub use keyset::{CryptoScheme, KeyIssuer, NcchKeys, load_ncch_keys, seed_check};
pub use options::{NcchOpenOptions, NcchOpenOptionsBuilder};
pub use partition::PartitionFile;
pub use reader::{Classification, NcchReader, NcchRegion, ReaderState};
pub use sections::{EncSection, SectionMap, SectionOverlap, SectionRegion};
pub use stream::DecryptStream;
pub use structs::{ExHeader, ExeFsFileHeader, ExeFsHeader, NcchHeader, NonNcchContentType};
pub use window::{Upstream, Window};
