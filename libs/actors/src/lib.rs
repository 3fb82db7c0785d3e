//! # Plexus Actor Runtime
//!
//! ## Purpose
//! Binds named execution units ("actors") to per-actor priority queues and
//! implements the pairwise xoff/xon backpressure protocol. A distinguished
//! master actor bridges the process to the local router daemon through the
//! socket event layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────── process ──────────────────────┐
//! │  actor A ──▶ queue B (direct push, same process)    │
//! │     │                                               │
//! │     └──▶ master actor ──▶ daemon socket ──▶ plexusd │
//! │            ▲    │                                   │
//! │   wake pipe┘    └──▶ queue X (inbound remote)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! One OS thread per actor; actors never share mutable state — everything
//! moves by message. The master's blocking point is the socket poll; every
//! other actor blocks only in its queue pop.
//!
//! ## Backpressure in one paragraph
//! When a delivery pushes a queue over its threshold, the sender gets an
//! internal `plexus-xoff` and pauses (internal-only popping), registering
//! a `plexus-ntf-xon` with the congested actor. Once that actor's queue
//! drains under half its threshold it answers `plexus-xon` to everyone
//! registered. A paused sender re-sends `plexus-ntf-xon` after a timeout
//! in case the notification got lost, and the daemon answers on behalf of
//! recipients that no longer exist.

pub mod error;
pub mod policy;
pub mod queue;
pub mod runtime;
pub mod worker;

mod master;

pub use error::RuntimeError;
pub use policy::{DefaultPausePolicy, PausePolicy};
pub use queue::MessageQueue;
pub use runtime::{ActorConfig, Runtime};
pub use worker::{ActorBehavior, ActorContext, Flow};
