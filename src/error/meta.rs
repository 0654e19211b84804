use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Bencoded data ended unexpectedly.")]
    UnexpectedEnd,
    #[error("Bencoded data has {remaining} trailing bytes.")]
    TrailingData { remaining: usize },
    #[error("Invalid bencoded integer '{text}'.")]
    InvalidInteger { text: String },
    #[error("Invalid bencoded string length '{text}'.")]
    InvalidLength { text: String },
    #[error("Bencoded dictionary keys out of order: '{previous}' before '{current}'.")]
    UnsortedKeys { previous: String, current: String },
    #[error("Bencoded dictionary key is not a string.")]
    InvalidKey,
    #[error("Unknown bencode prefix byte 0x{byte:02x}.")]
    UnknownPrefix { byte: u8 },
    #[error("Piece length must be > 0.")]
    PieceLengthZero,
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
