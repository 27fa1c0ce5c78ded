//! Byte-granular reader over one region of an NCCH.

use std::io::{self, Read, Seek, SeekFrom};

use romdata_crypto::{AES_BLOCK_SIZE, CipherEngine};

use crate::error::NcchError;
use crate::reader::NcchReader;
use crate::stream::resolve_seek;

const BLOCK: u64 = AES_BLOCK_SIZE as u64;

/// A sub-window of an [`NcchReader`], such as one ExeFS file or the RomFS.
///
/// Reads may start and end anywhere: the file widens every request to
/// 16-byte boundaries, reads that through the container and copies out the
/// requested part. It borrows the reader mutably, so the reader can't be used
/// while the file is open.
pub struct PartitionFile<'r, 'a, R, C> {
    reader: &'r mut NcchReader<'a, R, C>,
    /// Start within the container.
    start: u64,
    length: u64,
    pos: u64,
    bounce: Vec<u8>,
}

impl<'r, 'a, R: Read + Seek, C: CipherEngine> PartitionFile<'r, 'a, R, C> {
    /// Anything past the end of the container is cut off.
    pub(crate) fn new(
        reader: &'r mut NcchReader<'a, R, C>,
        start: u64,
        length: u64,
    ) -> Result<Self, NcchError> {
        let size = reader.size();
        if start > size {
            return Err(NcchError::OutOfRange {
                position: start,
                size,
            });
        }

        Ok(Self {
            reader,
            start,
            length: length.min(size - start),
            pos: 0,
            bounce: Vec::new(),
        })
    }

    /// Offset of this file within the container.
    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn len(&self) -> u64 {
        self.length
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub const fn tell(&self) -> u64 {
        self.pos
    }

    fn read_inner(&mut self, out: &mut [u8]) -> Result<usize, NcchError> {
        if self.pos >= self.length || out.is_empty() {
            return Ok(0);
        }

        let want = (out.len() as u64).min(self.length - self.pos);
        let abs = self.start + self.pos;
        let aligned_start = abs - abs % BLOCK;
        let aligned_end = (abs + want)
            .next_multiple_of(BLOCK)
            .min(self.reader.size());

        self.bounce.resize((aligned_end - aligned_start) as usize, 0);
        let n = self.reader.read_at(aligned_start, &mut self.bounce)?;

        let skip = (abs - aligned_start) as usize;
        let copied = (want as usize).min(n.saturating_sub(skip));
        out[..copied].copy_from_slice(&self.bounce[skip..skip + copied]);

        self.pos += copied as u64;
        Ok(copied)
    }

    /// Read the whole file into memory.
    pub fn read_all(&mut self) -> Result<Vec<u8>, NcchError> {
        self.pos = 0;
        let mut data = vec![0u8; self.length as usize];
        let mut done = 0;
        while done < data.len() {
            match self.read_inner(&mut data[done..])? {
                0 => break,
                n => done += n,
            }
        }
        data.truncate(done);
        Ok(data)
    }
}

impl<R: Read + Seek, C: CipherEngine> Read for PartitionFile<'_, '_, R, C> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.read_inner(out).map_err(Into::into)
    }
}

impl<R: Read + Seek, C: CipherEngine> Seek for PartitionFile<'_, '_, R, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.pos, self.length)?;
        if target > self.length {
            return Err(NcchError::OutOfRange {
                position: target,
                size: self.length,
            }
            .into());
        }
        self.pos = target;
        Ok(target)
    }
}
