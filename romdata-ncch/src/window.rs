//! Container window and upstream ownership.

use std::io::{Read, Seek};

use crate::structs::DEFAULT_MEDIA_UNIT_SHIFT;

/// Largest supported media unit shift (16 MiB media units).
pub const MAX_MEDIA_UNIT_SHIFT: u8 = 24;

/// Byte range of the upstream source that one container occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Absolute start within the source.
    pub offset: u64,
    /// Logical size of the container.
    pub length: u64,
    /// log2 of the media unit size.
    pub media_unit_shift: u8,
}

impl Window {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            media_unit_shift: DEFAULT_MEDIA_UNIT_SHIFT,
        }
    }

    #[must_use]
    pub const fn with_media_unit_shift(mut self, shift: u8) -> Self {
        self.media_unit_shift = shift;
        self
    }

    /// Convert a media unit count to bytes.
    #[must_use]
    pub const fn units_to_bytes(&self, units: u32) -> u64 {
        (units as u64) << self.media_unit_shift
    }

    /// Absolute source position of a window-relative offset, or `None` if it
    /// doesn't fit in a `u64`.
    #[must_use]
    pub const fn absolute(&self, relative: u64) -> Option<u64> {
        self.offset.checked_add(relative)
    }

    /// Absolute end of the window, or `None` on overflow.
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Is the media unit shift small enough that any `u32` unit count,
    /// converted to bytes and added to another, still fits in a `u64`?
    #[must_use]
    pub const fn has_valid_media_unit_shift(&self) -> bool {
        self.media_unit_shift <= MAX_MEDIA_UNIT_SHIFT
    }
}

/// The source a reader pulls bytes from.
///
/// A reader opened on a file owns it and drops it on close. A reader nested
/// inside another container (or opened on a caller's handle) only borrows it,
/// and the caller keeps responsibility for closing it.
#[derive(Debug)]
pub enum Upstream<'a, R> {
    Owned(R),
    Borrowed(&'a mut R),
}

impl<R: Read + Seek> Upstream<'_, R> {
    pub fn get_mut(&mut self) -> &mut R {
        match self {
            Self::Owned(r) => r,
            Self::Borrowed(r) => r,
        }
    }

    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// The source, if this reader owns it.
    pub fn into_owned(self) -> Option<R> {
        match self {
            Self::Owned(r) => Some(r),
            Self::Borrowed(_) => None,
        }
    }
}
