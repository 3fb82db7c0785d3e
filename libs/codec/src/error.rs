//! Codec error types

use thiserror::Error;

/// Failure to decode a received frame
///
/// These are protocol faults in the sense of the error-handling design:
/// the owning component logs them, raises an alarm and drops the frame.
/// They never tear down the connection by themselves.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The frame contained no bytes before its terminator
    #[error("empty frame")]
    EmptyFrame,

    /// The frame body is not a valid message object
    #[error("invalid message JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    /// The peer speaks a different protocol version
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// A binary field value is not valid base64
    #[error("field '{field}' carries invalid base64: {source}")]
    InvalidBase64 {
        field: String,
        #[source]
        source: base64::DecodeError,
    },
}
