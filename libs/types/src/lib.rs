//! # Plexus Type System
//!
//! ## Purpose
//! Unified type definitions for the Plexus messaging middleware: the message
//! envelope exchanged between actors, the alarm model used for operator
//! visibility, and the actor naming rules (`name@domain`).
//!
//! ## Architecture Role
//! ```text
//! Actor → Message → Queue/Socket → Router Daemon → Queue → Actor
//!   ↓        ↓                          ↓
//! Builds  Envelope +               Reads flags, ttl,
//! fields  typed fields             recipient, alarms
//! ```
//!
//! This crate has no I/O. The wire representation of these types lives in
//! the `codec` crate; queueing and routing live in `messaging-actors` and
//! `routerd`.

pub mod alarm;
pub mod message;
pub mod name;

/// Protocol control message names (the `plexus-*` vocabulary)
pub mod control;

pub use alarm::{Alarm, Severity};
pub use message::{FieldValue, Flags, IFlags, Message};
pub use name::{base_name, domain_of, full_name, is_valid_base_name};
