//! Error types for protocol decoding and kinematics queries

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when decoding NatNet messages.
///
/// Every variant means the message is malformed. Receive loops drop the
/// message and keep the session open.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// A declared field or count would read past the end of the buffer
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Length field doesn't match actual packet length
    #[error("Length mismatch: header says {header_len} bytes, packet has {actual_len}")]
    LengthMismatch { header_len: usize, actual_len: usize },

    /// A count field holds a negative value
    #[error("Negative {field} count: {value}")]
    NegativeCount { field: &'static str, value: i32 },

    /// A null-terminated string has no terminator inside the buffer
    #[error("String at offset {offset} has no null terminator")]
    MissingTerminator { offset: usize },

    /// Invalid UTF-8 in string field
    #[error("Invalid string encoding")]
    InvalidString,

    /// Failed to deserialize a fixed-size record
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// A value does not fit its wire field when encoding
    #[error("{field} {value} does not fit its wire field")]
    OutOfRange { field: &'static str, value: i64 },
}

impl From<bincode::Error> for ParseError {
    fn from(e: bincode::Error) -> Self {
        ParseError::DeserializationFailed(e.to_string())
    }
}

/// A listener refused or failed to handle a decoded batch.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        ListenerError(msg.into())
    }
}

/// Errors surfaced by kinematics queries.
///
/// These are caller or configuration errors. The engine never retries, the
/// consumer is expected to treat them as fatal for the current trial.
#[derive(Error, Debug)]
pub enum KinematicsError {
    /// No data source path has been configured
    #[error("No data source has been configured")]
    MissingDataSource,

    /// The configured data file does not exist
    #[error("Frame data not found at {}", .0.display())]
    DataNotFound(PathBuf),

    /// Header columns missing or a row could not be parsed
    #[error("Invalid frame data format: {0}")]
    InvalidFormat(String),

    /// The requested window cannot be served
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// The source holds fewer frames than the computation needs
    #[error("Need at least {needed} frames, only {available} available")]
    InsufficientFrames { needed: usize, available: usize },

    /// The source holds no frames at all
    #[error("No frames recorded yet")]
    NoFrames,

    /// Rows violate the per-frame layout invariant
    #[error("Frame data integrity error: {0}")]
    Integrity(String),

    /// Engine configured with an out-of-range parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error reading frame data: {0}")]
    Io(#[from] std::io::Error),
}
