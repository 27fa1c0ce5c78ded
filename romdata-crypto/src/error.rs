//! Error types for key handling and cipher operations

use thiserror::Error;

/// Cipher operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AES operation failed: {0}")]
    AesError(String),
}

/// Errors raised while loading a `keys.conf` file
#[derive(Debug, Error)]
pub enum KeyConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected `name=value`")]
    MalformedLine { line: usize },
    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },
    #[error("line {line}: entry outside of any section")]
    NoSection { line: usize },
    #[error("line {line}: invalid hex value: {source}")]
    InvalidHex {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("line {line}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error("line {line}: invalid title ID `{value}`")]
    InvalidTitleId { line: usize, value: String },
}
