use thiserror::Error;

/// Errors returned by record encode/decode operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A field is present but does not parse.
    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    /// The record kind marker is unknown.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
    /// The encoded record exceeds the substrate field budget.
    #[error("record too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}
