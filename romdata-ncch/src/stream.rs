//! Decrypting random-access stream over a container window.
//!
//! [`DecryptStream`] is the read engine behind [`crate::NcchReader`]. It knows
//! nothing about NCCH headers: it translates window offsets to source
//! offsets, consults the [`SectionMap`] and runs the cipher over the parts of
//! each request that fall inside encrypted sections.

use std::io::{self, Read, Seek, SeekFrom};

use romdata_crypto::{AES_BLOCK_SIZE, AesCtrEngine, CipherEngine, VerifyResult};

use crate::error::NcchError;
use crate::sections::SectionMap;
use crate::window::{MAX_MEDIA_UNIT_SHIFT, Upstream, Window};

const BLOCK: u64 = AES_BLOCK_SIZE as u64;

/// Seekable stream of the logical (decrypted) bytes of one container.
pub struct DecryptStream<'a, R, C = AesCtrEngine> {
    source: Option<Upstream<'a, R>>,
    window: Window,
    cipher: C,
    sections: SectionMap,
    keys: [[u8; 16]; 2],
    verify_result: VerifyResult,
    pos: u64,
}

impl<'a, R: Read + Seek, C: CipherEngine> DecryptStream<'a, R, C> {
    /// Bind a stream to `window` within `source`.
    ///
    /// The stream starts with no sections and [`VerifyResult::NotEncrypted`],
    /// i.e. as a plain passthrough.
    pub fn new(mut source: Upstream<'a, R>, window: Window, cipher: C) -> Result<Self, NcchError> {
        if !window.has_valid_media_unit_shift() {
            return Err(NcchError::Unsupported(format!(
                "media unit shift {} (maximum {MAX_MEDIA_UNIT_SHIFT})",
                window.media_unit_shift
            )));
        }

        let source_size = source.get_mut().seek(SeekFrom::End(0))?;
        match window.end() {
            Some(end) if end <= source_size => {}
            end => {
                return Err(NcchError::OutOfRange {
                    position: end.unwrap_or(window.offset),
                    size: source_size,
                });
            }
        }

        Ok(Self {
            source: Some(source),
            window,
            cipher,
            sections: SectionMap::new(),
            keys: [[0u8; 16]; 2],
            verify_result: VerifyResult::NotEncrypted,
            pos: 0,
        })
    }

    pub const fn window(&self) -> &Window {
        &self.window
    }

    pub const fn sections(&self) -> &SectionMap {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut SectionMap {
        &mut self.sections
    }

    pub const fn verify_result(&self) -> VerifyResult {
        self.verify_result
    }

    pub const fn cipher(&self) -> &C {
        &self.cipher
    }

    /// Install key material. Encrypted reads only proceed when `result` is
    /// [`VerifyResult::Ok`].
    pub fn set_keys(&mut self, keys: [[u8; 16]; 2], result: VerifyResult) {
        self.keys = keys;
        self.verify_result = result;
    }

    pub const fn size(&self) -> u64 {
        self.window.length
    }

    pub const fn tell(&self) -> u64 {
        self.pos
    }

    pub const fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Move the read position. Seeking to exactly `size()` is allowed.
    pub fn seek(&mut self, pos: u64) -> Result<(), NcchError> {
        if self.source.is_none() {
            return Err(NcchError::Closed);
        }
        if pos > self.window.length {
            return Err(NcchError::OutOfRange {
                position: pos,
                size: self.window.length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Read at the current position and advance it by the bytes read.
    ///
    /// On error the position is left unchanged.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, NcchError> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read at a window-relative offset without touching the position.
    ///
    /// The request is clamped to the window; reading at or past the end
    /// returns 0. If any part of the clamped request lies in an encrypted
    /// section, both the offset and the length must be multiples of 16.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, NcchError> {
        if self.source.is_none() {
            return Err(NcchError::Closed);
        }
        if offset >= self.window.length || buf.is_empty() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(self.window.length - offset);
        let out = &mut buf[..len as usize];

        if self.sections.intersects(offset, len) {
            if offset % BLOCK != 0 || len % BLOCK != 0 {
                return Err(NcchError::Unaligned {
                    offset,
                    length: len,
                });
            }
            if !self.verify_result.is_ok() {
                return Err(NcchError::from_verify_result(self.verify_result));
            }
        }

        let mut done = 0usize;
        while done < out.len() {
            let cur = offset + done as u64;
            let remaining = (out.len() - done) as u64;

            match self.sections.find_containing(cur).copied() {
                Some(section) => {
                    let chunk = remaining.min(section.end() - cur) as usize;
                    let dst = &mut out[done..done + chunk];
                    self.read_raw(cur, dst)?;
                    let key = self.keys.get(usize::from(section.key_index)).ok_or_else(|| {
                        NcchError::Unsupported(format!(
                            "section at {:#X} uses key index {}",
                            section.address, section.key_index
                        ))
                    })?;
                    self.cipher.decrypt(key, section.counter_at(cur), dst)?;
                    done += chunk;
                }
                None => {
                    let limit = self
                        .sections
                        .next_start_after(cur)
                        .map_or(remaining, |next| remaining.min(next - cur));
                    let chunk = limit as usize;
                    self.read_raw(cur, &mut out[done..done + chunk])?;
                    done += chunk;
                }
            }
        }

        Ok(out.len())
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NcchError> {
        let abs = self.window.absolute(offset).ok_or(NcchError::OutOfRange {
            position: offset,
            size: self.window.length,
        })?;
        let source = self.source.as_mut().ok_or(NcchError::Closed)?.get_mut();
        source.seek(SeekFrom::Start(abs))?;
        source.read_exact(buf)?;
        Ok(())
    }

    /// Release the source. An owned source is returned so the caller can
    /// drop it; a borrowed one is simply let go.
    pub fn close(&mut self) -> Option<Upstream<'a, R>> {
        self.source.take()
    }

    /// Consume the stream, returning the source if it was owned.
    pub fn into_inner(mut self) -> Option<R> {
        self.source.take().and_then(Upstream::into_owned)
    }
}

impl<R: Read + Seek, C: CipherEngine> Read for DecryptStream<'_, R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DecryptStream::read(self, buf).map_err(Into::into)
    }
}

impl<R: Read + Seek, C: CipherEngine> Seek for DecryptStream<'_, R, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.pos, self.window.length)?;
        DecryptStream::seek(self, target)?;
        Ok(target)
    }
}

/// Resolve a [`SeekFrom`] against the current position and size.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(p) => Some(p),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    use romdata_crypto::CryptoError;

    use super::*;
    use crate::sections::{EncSection, SectionRegion};

    const KEY: [u8; 16] = [0x42; 16];
    const CTR_BASE: u128 = 0x0004_0000_0012_3400_0300_0000_0000_0000;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Call {
        key: [u8; 16],
        ctr: u128,
        len: usize,
    }

    /// Records every decrypt call, then defers to AES-CTR.
    #[derive(Clone, Default)]
    struct SpyCipher {
        calls: Rc<RefCell<Vec<Call>>>,
    }

    impl CipherEngine for SpyCipher {
        fn decrypt(&self, key: &[u8; 16], ctr: u128, data: &mut [u8]) -> Result<(), CryptoError> {
            self.calls.borrow_mut().push(Call {
                key: *key,
                ctr,
                len: data.len(),
            });
            AesCtrEngine.decrypt(key, ctr, data)
        }
    }

    fn plaintext() -> Vec<u8> {
        (0..1024u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// 1024-byte window whose first 512 bytes are encrypted with `KEY`.
    fn half_encrypted(spy: SpyCipher) -> DecryptStream<'static, Cursor<Vec<u8>>, SpyCipher> {
        let mut image = plaintext();
        AesCtrEngine.encrypt(&KEY, CTR_BASE, &mut image[..512]).unwrap();

        let mut stream = DecryptStream::new(
            Upstream::Owned(Cursor::new(image)),
            Window::new(0, 1024),
            spy,
        )
        .unwrap();
        stream
            .sections_mut()
            .insert(EncSection {
                address: 0,
                counter_base: CTR_BASE,
                length: 512,
                key_index: 0,
                region: SectionRegion::RomFs,
            })
            .unwrap();
        stream.set_keys([KEY, [0u8; 16]], VerifyResult::Ok);
        stream
    }

    #[test]
    fn encrypted_section_uses_one_call() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());

        let mut buf = vec![0u8; 512];
        assert_eq!(stream.read(&mut buf).unwrap(), 512);
        assert_eq!(buf, plaintext()[..512]);

        let calls = spy.calls.borrow();
        assert_eq!(
            *calls,
            vec![Call {
                key: KEY,
                ctr: CTR_BASE,
                len: 512
            }]
        );
        // 32 blocks: counters CTR_BASE..=CTR_BASE + 31.
        assert_eq!(calls[0].len / AES_BLOCK_SIZE, 32);
    }

    #[test]
    fn plaintext_half_is_passthrough() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());

        stream.seek(512).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(stream.read(&mut buf).unwrap(), 512);
        assert_eq!(buf, plaintext()[512..]);
        assert!(spy.calls.borrow().is_empty());
        assert_eq!(stream.tell(), 1024);
    }

    #[test]
    fn straddling_read_is_split() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());

        let mut buf = vec![0u8; 512];
        assert_eq!(stream.read_at(256, &mut buf).unwrap(), 512);
        assert_eq!(buf, plaintext()[256..768]);

        let calls = spy.calls.borrow();
        assert_eq!(
            *calls,
            vec![Call {
                key: KEY,
                ctr: CTR_BASE + 16,
                len: 256
            }]
        );
    }

    #[test]
    fn reads_are_idempotent() {
        let mut stream = half_encrypted(SpyCipher::default());

        let mut first = vec![0u8; 1024];
        let mut second = vec![0u8; 1024];
        stream.read_at(0, &mut first).unwrap();
        stream.read_at(0, &mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, plaintext());
    }

    #[test]
    fn unaligned_encrypted_read_is_rejected() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());
        stream.seek(16).unwrap();

        let mut buf = vec![0u8; 20];
        assert!(matches!(
            stream.read(&mut buf),
            Err(NcchError::Unaligned {
                offset: 16,
                length: 20
            })
        ));
        stream.seek(8).unwrap();
        let mut buf = vec![0u8; 32];
        assert!(matches!(stream.read(&mut buf), Err(NcchError::Unaligned { .. })));

        assert_eq!(stream.tell(), 8);
        assert!(spy.calls.borrow().is_empty());
    }

    #[test]
    fn unaligned_plaintext_read_is_fine() {
        let mut stream = half_encrypted(SpyCipher::default());
        stream.seek(517).unwrap();

        let mut buf = vec![0u8; 11];
        assert_eq!(stream.read(&mut buf).unwrap(), 11);
        assert_eq!(buf, plaintext()[517..528]);
    }

    #[test]
    fn missing_key_blocks_encrypted_reads_only() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());
        stream.set_keys([[0u8; 16]; 2], VerifyResult::KeyNotFound);

        let mut buf = vec![0u8; 16];
        assert!(matches!(stream.read(&mut buf), Err(NcchError::KeyNotFound)));
        assert_eq!(stream.tell(), 0);
        assert_eq!(stream.size(), 1024);

        assert_eq!(stream.read_at(512, &mut buf).unwrap(), 16);
        assert_eq!(buf, plaintext()[512..528]);
        assert!(spy.calls.borrow().is_empty());
    }

    #[test]
    fn seek_contract() {
        let mut stream = half_encrypted(SpyCipher::default());

        for p in [0, 1, 511, 512, 1023, 1024] {
            stream.seek(p).unwrap();
            assert_eq!(stream.tell(), p);
        }

        stream.seek(100).unwrap();
        assert!(matches!(
            stream.seek(1025),
            Err(NcchError::OutOfRange {
                position: 1025,
                size: 1024
            })
        ));
        assert_eq!(stream.tell(), 100);
    }

    #[test]
    fn reads_clamp_to_window() {
        let mut stream = half_encrypted(SpyCipher::default());
        stream.seek(1008).unwrap();

        let mut buf = vec![0u8; 64];
        assert_eq!(stream.read(&mut buf).unwrap(), 16);
        assert_eq!(&buf[..16], &plaintext()[1008..]);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn window_offset_is_applied() {
        let mut image = vec![0xEEu8; 0x100];
        image.extend_from_slice(b"inner container bytes");
        image.extend_from_slice(&[0xEE; 0x10]);
        let len = 21;

        let mut stream = DecryptStream::new(
            Upstream::Owned(Cursor::new(image)),
            Window::new(0x100, len),
            AesCtrEngine,
        )
        .unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"inner container bytes");
    }

    #[test]
    fn window_past_source_end_is_rejected() {
        let result = DecryptStream::new(
            Upstream::Owned(Cursor::new(vec![0u8; 64])),
            Window::new(32, 64),
            AesCtrEngine,
        );
        assert!(matches!(result, Err(NcchError::OutOfRange { .. })));
    }

    #[test]
    fn window_end_overflow_is_rejected() {
        let result = DecryptStream::new(
            Upstream::Owned(Cursor::new(vec![0u8; 64])),
            Window::new(u64::MAX - 1, 4),
            AesCtrEngine,
        );
        assert!(matches!(
            result,
            Err(NcchError::OutOfRange { position, size: 64 }) if position == u64::MAX - 1
        ));
    }

    #[test]
    fn oversized_media_unit_shift_is_rejected() {
        for shift in [MAX_MEDIA_UNIT_SHIFT + 1, 64, u8::MAX] {
            let result = DecryptStream::new(
                Upstream::Owned(Cursor::new(vec![0u8; 64])),
                Window::new(0, 64).with_media_unit_shift(shift),
                AesCtrEngine,
            );
            assert!(matches!(result, Err(NcchError::Unsupported(_))), "shift {shift}");
        }

        assert!(
            DecryptStream::new(
                Upstream::Owned(Cursor::new(vec![0u8; 64])),
                Window::new(0, 64).with_media_unit_shift(MAX_MEDIA_UNIT_SHIFT),
                AesCtrEngine,
            )
            .is_ok()
        );
    }

    #[test]
    fn unknown_key_index_is_an_error() {
        let spy = SpyCipher::default();
        let mut stream = half_encrypted(spy.clone());
        stream
            .sections_mut()
            .insert(EncSection {
                address: 512,
                counter_base: CTR_BASE,
                length: 16,
                key_index: 2,
                region: SectionRegion::RomFs,
            })
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            stream.read_at(512, &mut buf),
            Err(NcchError::Unsupported(_))
        ));
        assert!(spy.calls.borrow().is_empty());

        // Sections with a valid key index still read.
        assert_eq!(stream.read_at(0, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..], &plaintext()[..16]);
    }

    #[test]
    fn borrowed_source_survives_close() {
        let mut source = Cursor::new(vec![7u8; 32]);
        {
            let mut stream = DecryptStream::new(
                Upstream::Borrowed(&mut source),
                Window::new(0, 32),
                AesCtrEngine,
            )
            .unwrap();
            let released = stream.close();
            assert!(released.is_some_and(|s| !s.is_owned()));

            let mut buf = [0u8; 4];
            assert!(matches!(stream.read(&mut buf), Err(NcchError::Closed)));
        }
        assert_eq!(source.get_ref().len(), 32);
    }

    #[test]
    fn io_traits_map_errors() {
        let mut stream = half_encrypted(SpyCipher::default());

        assert_eq!(Seek::seek(&mut stream, SeekFrom::End(-16)).unwrap(), 1008);
        assert_eq!(
            Seek::seek(&mut stream, SeekFrom::End(1)).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            Seek::seek(&mut stream, SeekFrom::Current(-2000))
                .unwrap_err()
                .kind(),
            io::ErrorKind::InvalidInput
        );

        Seek::seek(&mut stream, SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            Read::read(&mut stream, &mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
