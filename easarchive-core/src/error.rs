//! Error types for header validation and alert log parsing

use thiserror::Error;

/// Errors that can occur when reading a WAV container header
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeaderError {
    /// File is too short to contain the canonical header
    #[error("Header too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// A chunk marker is missing from its canonical offset
    #[error("Invalid marker at offset {offset}: expected {expected:?}, got {actual:?}")]
    InvalidMarker {
        offset: usize,
        expected: String,
        actual: String,
    },
}

/// Errors that abort parsing of a whole alert log batch.
///
/// Lines that merely fail the grammar are skipped and never surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// A field the record cannot exist without was present but unusable
    #[error("Mandatory field '{field}' is invalid: '{value}'")]
    MandatoryFieldMissing { field: &'static str, value: String },
}
