//! Actor runtime error types

use thiserror::Error;

/// Errors surfaced by [`crate::Runtime`]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The router daemon could not be reached during startup
    #[error("router daemon unreachable at '{url}'")]
    DaemonUnreachable { url: String },

    /// The daemon handshake did not complete
    #[error("daemon handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// An actor with this name already exists in this process
    #[error("actor name '{name}' is already taken")]
    DuplicateActor { name: String },

    /// Actor names must be non-empty ASCII without '@', and must not
    /// collide with runtime-reserved names
    #[error("'{name}' is not a valid actor name")]
    InvalidActorName { name: String },

    /// The process is shutting down; no new actors are accepted
    #[error("runtime is terminating")]
    Terminating,

    /// Socket-layer failure during startup
    #[error(transparent)]
    Network(#[from] network::NetworkError),
}
