//! Socket event layer error types

use crate::sockset::SocketId;
use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for socket event layer operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Main socket event layer error type
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The URL does not name a transport this layer understands
    #[error("invalid socket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Host name resolution failed
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket creation failed
    #[error("failed to create socket for '{url}': {source}")]
    Socket {
        url: String,
        #[source]
        source: Errno,
    },

    /// Local bind failed; the caller decides whether this is fatal
    #[error("failed to bind '{url}': {source}")]
    Bind {
        url: String,
        #[source]
        source: Errno,
    },

    /// Immediate connect failure (asynchronous failures surface as
    /// `NotEstablished` events instead)
    #[error("failed to connect to '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: Errno,
    },

    /// Pipe creation failed
    #[error("pipe creation failed: {source}")]
    Pipe {
        #[source]
        source: Errno,
    },

    /// The socket id does not name a live socket in this set
    #[error("socket id {id} is not valid")]
    InvalidSocket { id: SocketId },

    /// The operation needs a comm socket but got a server socket
    #[error("socket id {id} is a server socket and cannot exchange data")]
    NotCommSocket { id: SocketId },

    /// Unexpected OS-level failure
    #[error("I/O failure: {source}")]
    Io {
        #[from]
        source: Errno,
    },
}

impl NetworkError {
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> NetworkError {
        NetworkError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
