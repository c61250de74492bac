use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeaconError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Identifier failed to parse.
    #[error("malformed identifier: {0}")]
    MalformedId(String),
}
