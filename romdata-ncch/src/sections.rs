//! Encrypted section map.
//!
//! Sections are stored in an ordered map keyed by their window-relative start
//! address. A lookup for address `a` takes the entry with the largest start
//! address `<= a` (the map's comparator is plain `u64` ordering, so this is
//! `range(..=a).next_back()`) and then checks that `a` falls before that
//! entry's end. Ranges are start-inclusive and end-exclusive.

use std::collections::BTreeMap;
use std::ops::Bound;

use romdata_crypto::AES_BLOCK_SIZE;
use thiserror::Error;

/// Logical area of the container a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionRegion {
    ExHeader,
    ExeFsHeader,
    ExeFsFile,
    RomFs,
}

impl SectionRegion {
    /// Section type byte mixed into the AES-CTR counter.
    #[must_use]
    pub const fn ctr_type(self) -> u8 {
        match self {
            Self::ExHeader => 1,
            Self::ExeFsHeader | Self::ExeFsFile => 2,
            Self::RomFs => 3,
        }
    }
}

/// A contiguous encrypted range sharing one key and one counter baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncSection {
    /// Start address, relative to the window.
    pub address: u64,
    /// AES-CTR counter of the block at `address`.
    pub counter_base: u128,
    pub length: u64,
    /// Index into the reader's key pair.
    pub key_index: u8,
    pub region: SectionRegion,
}

impl EncSection {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address + self.length
    }

    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }

    /// Counter for the block starting at `address`.
    #[must_use]
    pub const fn counter_at(&self, address: u64) -> u128 {
        let blocks = (address - self.address) / AES_BLOCK_SIZE as u64;
        self.counter_base.wrapping_add(blocks as u128)
    }
}

#[derive(Debug, Error)]
#[error("section {new_address:#X}+{new_length:#X} overlaps section at {existing:#X}")]
pub struct SectionOverlap {
    pub new_address: u64,
    pub new_length: u64,
    pub existing: u64,
}

/// Sparse map of encrypted sections.
#[derive(Debug, Clone, Default)]
pub struct SectionMap {
    sections: BTreeMap<u64, EncSection>,
}

impl SectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section. Zero-length sections are ignored.
    ///
    /// The map stays ordered after every insert, so lookups never need a
    /// separate sort step.
    pub fn insert(&mut self, section: EncSection) -> Result<(), SectionOverlap> {
        if section.length == 0 {
            return Ok(());
        }

        let overlap = |existing: &EncSection| SectionOverlap {
            new_address: section.address,
            new_length: section.length,
            existing: existing.address,
        };

        if let Some((_, prev)) = self.sections.range(..=section.address).next_back()
            && prev.end() > section.address
        {
            return Err(overlap(prev));
        }
        if let Some((_, next)) = self
            .sections
            .range((Bound::Excluded(section.address), Bound::Unbounded))
            .next()
            && next.address < section.end()
        {
            return Err(overlap(next));
        }

        self.sections.insert(section.address, section);
        Ok(())
    }

    /// Section covering `address`, or `None` if it's plaintext.
    #[must_use]
    pub fn find_containing(&self, address: u64) -> Option<&EncSection> {
        self.sections
            .range(..=address)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.contains(address))
    }

    /// Start of the first section beginning after `address`.
    #[must_use]
    pub fn next_start_after(&self, address: u64) -> Option<u64> {
        self.sections
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(&start, _)| start)
    }

    /// Does `[start, start + length)` touch any section?
    #[must_use]
    pub fn intersects(&self, start: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        self.find_containing(start).is_some()
            || self
                .next_start_after(start)
                .is_some_and(|next| next < start.saturating_add(length))
    }

    /// Sections in descending address order.
    pub fn iter(&self) -> impl Iterator<Item = &EncSection> {
        self.sections.values().rev()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }
}

/// AES-CTR counter for the block at `origin` of a region.
///
/// `origin` is the window-relative byte offset the region's counter starts
/// from. NCCH version 1 embeds it in the counter; versions 0 and 2 use a
/// per-region type byte instead. Advance the result by one per 16-byte block
/// past `origin`.
#[must_use]
pub fn region_counter(program_id: u64, version: u16, region: SectionRegion, origin: u64) -> u128 {
    if version == 1 {
        let tid = u64::from_be_bytes(program_id.to_le_bytes());
        (u128::from(tid) << 64) | u128::from(origin)
    } else {
        (u128::from(program_id) << 64) | (u128::from(region.ctr_type()) << 56)
    }
}

/// Counter for the block at `address`, within a region counting from `origin`.
#[must_use]
pub fn counter_for(base: u128, origin: u64, address: u64) -> u128 {
    let blocks = (address - origin) / AES_BLOCK_SIZE as u64;
    base.wrapping_add(u128::from(blocks))
}
