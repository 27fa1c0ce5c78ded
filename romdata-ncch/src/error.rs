//! Error types for NCCH operations

use std::io;

use romdata_crypto::{CryptoError, VerifyResult};
use thiserror::Error;

/// Main error type for NCCH operations
#[derive(Debug, Error)]
pub enum NcchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid NCCH header: {0}")]
    InvalidHeader(String),
    #[error("Decryption key not found")]
    KeyNotFound,
    #[error("Decryption key is invalid")]
    KeyInvalid,
    #[error("Decryption key does not match this content")]
    Mismatch,
    #[error("Unaligned read: offset {offset:#X}, length {length:#X} (must be multiples of 16)")]
    Unaligned { offset: u64, length: u64 },
    #[error("Position {position:#X} is outside of the container (size {size:#X})")]
    OutOfRange { position: u64, size: u64 },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("{0} is not present in this container")]
    NotPresent(&'static str),
    #[error("Reader is closed")]
    Closed,
    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] CryptoError),
}

impl NcchError {
    /// Error returned for a read that needs keys the reader doesn't have.
    pub(crate) fn from_verify_result(result: VerifyResult) -> Self {
        match result {
            VerifyResult::KeyNotFound => Self::KeyNotFound,
            VerifyResult::KeyInvalid => Self::KeyInvalid,
            VerifyResult::Mismatch => Self::Mismatch,
            other => Self::Unsupported(format!("cannot decrypt content ({other})")),
        }
    }
}

impl From<NcchError> for io::Error {
    fn from(err: NcchError) -> Self {
        match err {
            NcchError::Io(e) => e,
            NcchError::Unaligned { .. } | NcchError::OutOfRange { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            NcchError::KeyNotFound | NcchError::KeyInvalid | NcchError::Mismatch => {
                io::Error::new(io::ErrorKind::PermissionDenied, err)
            }
            NcchError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            NcchError::NotPresent(_) => io::Error::new(io::ErrorKind::NotFound, err),
            other => io::Error::other(other),
        }
    }
}
