//! # Plexus Router Daemon
//!
//! ## Purpose
//! The local routing hub of a Plexus domain. Processes connect over the
//! daemon's well-known socket; the daemon keeps a registry of every actor
//! name reachable through each connection, fans out multicast groups,
//! hosts the operator-facing alarm registry, and makes the routing
//! decision for every message that crosses a process boundary.
//!
//! ## Routing decision (per inbound non-handshake message)
//! 1. decrement time-to-live; exhausted ⇒ drop (+ notice if requested,
//!    + warning alarm)
//! 2. multicast flag ⇒ fan out a per-subscriber copy to every subscriber
//!    whose filter matches the message name
//! 3. addressed to the daemon ⇒ handle locally (registry, ping,
//!    subscriptions, alarm queries, dead-peer unblocking)
//! 4. otherwise ⇒ forward to the socket owning the recipient, or drop
//!    with a notice and an alarm
//!
//! The daemon can run as the `plexusd` binary or embedded on a thread
//! (tests do this); all state is in-memory and rebuilt from actor birth
//! and subscribe traffic after a restart.

pub mod alarms;
pub mod daemon;
pub mod error;
pub mod groups;

pub use alarms::AlarmRegistry;
pub use daemon::{Daemon, DaemonHandle};
pub use error::DaemonError;
pub use groups::{GroupRegistry, Pattern};
