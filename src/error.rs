//! Error types for the tagwire codec.

use thiserror::Error;

/// Result type alias using [`CodecError`].
pub type Result<T> = std::result::Result<T, CodecError>;

/// Codec error type.
///
/// Read-side corruption is reported through the precise variants
/// (`UnexpectedEof`, `UnknownMarker`, `BadReference`, `InvalidTrait`,
/// `MalformedStream`); all of them abort the current decode — after a
/// misaligned reference table every later back-reference in the stream
/// would resolve to the wrong slot, so there is no partial recovery.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Unexpected end of data while reading.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Unknown one-byte type marker.
    #[error("unknown type marker: 0x{0:02x}")]
    UnknownMarker(u8),

    /// A back-reference index exceeds the current table size.
    #[error("{table} reference {index} out of range (table has {len} entries)")]
    BadReference {
        table: &'static str,
        index: u32,
        len: usize,
    },

    /// Stream data is malformed (bad UTF-8, trailing bytes, bad flags).
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// Class-shape validation failed (dynamic + externalizable, or an
    /// externalizable shape declaring properties).
    #[error("invalid trait: {0}")]
    InvalidTrait(String),

    /// Integer outside the 29-bit signed domain `[-2^28, 2^28 - 1]`.
    #[error("integer {0} outside the 29-bit encodable range")]
    IntegerRange(i64),

    /// Writer was given a value it cannot map to any marker or
    /// registered serializer.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Duplicate property within one trait, or a consumer field that
    /// cannot be resolved against a non-dynamic wire trait in strict mode.
    #[error("ambiguous schema: {0}")]
    AmbiguousSchema(String),

    /// Alias already registered with a conflicting serializer.
    #[error("alias {0:?} is already registered with a different serializer")]
    DuplicateAlias(String),
}

impl CodecError {
    /// Create a malformed-stream error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedStream(msg.into())
    }

    /// Create an unsupported-value error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        CodecError::UnsupportedValue(msg.into())
    }

    /// Create an ambiguous-schema error.
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        CodecError::AmbiguousSchema(msg.into())
    }
}
