//! Options for opening an NCCH reader.

use derive_builder::Builder;

use crate::keyset::KeyIssuer;
use crate::structs::DEFAULT_MEDIA_UNIT_SHIFT;

/// Where the container lives within its source and how to interpret it.
///
/// ```ignore
/// let options = NcchOpenOptionsBuilder::default()
///     .offset(0x4000u64)
///     .length(0x10_0000u64)
///     .build()?;
/// ```
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default)]
pub struct NcchOpenOptions {
    /// Start of the container within the source, in bytes.
    pub offset: u64,
    /// Length of the container. `None` runs to the end of the source.
    #[builder(setter(into, strip_option))]
    pub length: Option<u64>,
    /// log2 of the media unit size used by header offsets.
    pub media_unit_shift: u8,
    /// Only try one keyset instead of retail then debug.
    #[builder(setter(into, strip_option))]
    pub issuer: Option<KeyIssuer>,
}

impl Default for NcchOpenOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            length: None,
            media_unit_shift: DEFAULT_MEDIA_UNIT_SHIFT,
            issuer: None,
        }
    }
}

impl NcchOpenOptions {
    /// Options for a container at `offset` spanning `length` bytes.
    #[must_use]
    pub fn window(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
            ..Self::default()
        }
    }
}
