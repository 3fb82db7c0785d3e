//! # Plexus Socket Event Layer
//!
//! ## Purpose
//! A uniform, event-driven abstraction over heterogeneous transports:
//! anonymous pipes, UNIX sockets (seqpacket, stream and datagram), TCP and
//! UDP. The daemon and the per-process master actor both sit in a single
//! blocking [`SocketSet::poll`] call and react to the events it yields.
//!
//! ## Architecture Role
//! ```text
//! owner thread ──poll()──▶ SocketSet ──poll(2)──▶ kernel
//!      ▲                      │
//!      └── one Event ◀── event FIFO ◀── readiness scan + idle-peer scan
//! ```
//!
//! There are two kinds of sockets:
//! - **server** sockets accept incoming connections and never exchange
//!   data themselves (exception: the read end of a pipe);
//! - **comm** sockets exchange data; they are created either by a server
//!   socket when a peer connects, or directly when connecting out.
//!
//! Connectionless transports (UDP, UNIX datagram) are folded into the same
//! model: a connectionless server socket spawns a *virtual peer* comm
//! socket for every distinct source address, sharing the server's file
//! descriptor. Virtual peers time out after a configurable idle period.
//!
//! A `SocketSet` is single-threaded by design: every method is `&mut self`
//! and the one blocking point is `poll`. Cross-thread senders must hold a
//! duplicated fd of their own (see `messaging-actors`).

pub mod error;
pub mod event;
pub mod sockset;
pub mod url;

pub use error::{NetworkError, Result};
pub use event::{Event, EventKind};
pub use sockset::{SendOutcome, ServerExtra, SocketId, SocketSet};
pub use url::{SocketUrl, Transport};
