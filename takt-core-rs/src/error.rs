//! Error types for takt

use crate::codec::FieldId;
use thiserror::Error;

/// Errors raised while encoding or decoding field blocks and frames
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("field 0x{0:08x} not present")]
    MissingField(FieldId),

    #[error("field 0x{field:08x} holds {actual} bytes, expected {expected}")]
    InvalidLength {
        field: FieldId,
        expected: usize,
        actual: usize,
    },

    #[error("field block truncated at offset {0}")]
    Truncated(usize),

    #[error("field 0x{0:08x} is not valid UTF-8")]
    InvalidUtf8(FieldId),

    #[error("invalid value in field 0x{field:08x}: {reason}")]
    InvalidValue { field: FieldId, reason: String },

    #[error("bad frame magic 0x{0:04x}")]
    BadMagic(u16),

    #[error("bad frame sentinel 0x{0:02x}")]
    BadSentinel(u8),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("expected data type {expected}, got {actual}")]
    DataTypeMismatch { expected: i32, actual: i32 },
}

/// Errors from the configuration store
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the discovery handshake
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no supercomponent answered after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors on a module connection (either side)
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection closed by peer")]
    Closed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("module {0} is already connected")]
    DuplicateModule(String),
}

/// Top-level error for the takt runtime
#[derive(Debug, Error)]
pub enum TaktError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conference id {0} out of range (2..=254)")]
    InvalidConferenceId(u8),

    #[error("frequency {0} Hz is not a positive number")]
    InvalidFrequency(f64),
}
