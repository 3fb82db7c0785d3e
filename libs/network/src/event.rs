//! Socket events
//!
//! [`SocketSet::poll`](crate::SocketSet::poll) reports everything that
//! happens on a socket set as a stream of these events, exactly one per
//! call. For a `Connected` event the reporting socket is the *server*; the
//! freshly created comm socket rides in the event.

use crate::sockset::SocketId;
use bytes::Bytes;

/// One occurrence on a socket set
#[derive(Debug, Clone)]
pub struct Event {
    /// Id of the socket that originated the event
    pub socket: SocketId,
    pub kind: EventKind,
}

/// What happened
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A server socket accepted a connection (emulated for connectionless
    /// transports: first datagram from an unseen address)
    Connected {
        /// Id of the newly created comm socket
        comm: SocketId,
    },

    /// A peer disconnected. For a connectionless virtual peer this means
    /// "idle for longer than the configured timeout"; the owner is
    /// expected to destroy the socket, and later traffic from the same
    /// address will create a fresh peer.
    Disconnected,

    /// Data arrived on a comm socket (or the read end of a pipe)
    DataIn { data: Bytes },

    /// The socket can accept more outgoing data without blocking
    /// (requested through [`crate::SocketSet::want_send`])
    CanSend,

    /// An outgoing connection completed
    Established,

    /// An outgoing connection could not be established; destroy the socket
    NotEstablished,

    /// The OS reported an error on this socket; destroy the socket
    Error,
}

impl Event {
    pub(crate) fn new(socket: SocketId, kind: EventKind) -> Event {
        Event { socket, kind }
    }

    /// Payload accessor for `DataIn` events
    pub fn data(&self) -> Option<&Bytes> {
        match &self.kind {
            EventKind::DataIn { data } => Some(data),
            _ => None,
        }
    }
}
