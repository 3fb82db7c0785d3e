//! Message envelope and typed fields
//!
//! A [`Message`] is the unit of communication between actors. It carries a
//! name (what happened), a sender and a recipient (who), a hop-limited
//! time-to-live, routing flags, an ordered list of named typed fields and
//! any alarms the sender wants to surface to the router daemon.
//!
//! Messages are immutable once handed to the runtime: fan-out paths clone
//! them, rewriting only the recipient.

use crate::alarm::Alarm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Default time-to-live, in router hops
pub const DEFAULT_TTL: u8 = 4;

/// Wire-visible message flags (bitmask, one byte on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u8);

impl Flags {
    /// It is OK for this message to arrive out of order
    pub const OUT_OF_ORDER_OK: Flags = Flags(0x01);
    /// It is OK to silently drop this message
    pub const DROP_OK: Flags = Flags(0x02);
    /// Notify the sender if this message is dropped
    pub const NTF_DROP: Flags = Flags(0x04);
    /// Deliver ahead of regular traffic
    pub const URGENT: Flags = Flags(0x08);
    /// The recipient is a multicast group, not an actor
    pub const MULTICAST: Flags = Flags(0x10);

    pub fn empty() -> Flags {
        Flags(0)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Internal flags, used by the runtime and daemon only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IFlags(pub u8);

impl IFlags {
    /// Protocol control message; bypasses the urgent/regular sub-lists and
    /// is still delivered while an actor is paused
    pub const INTERNAL: IFlags = IFlags(0x01);

    pub fn empty() -> IFlags {
        IFlags(0)
    }

    pub fn contains(self, other: IFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: IFlags) {
        self.0 |= other.0;
    }
}

/// A typed message field value
///
/// Field insertion order is preserved end to end, so a message is also a
/// small ordered record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// The Plexus message envelope
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    sender: String,
    recipient: String,
    ttl: u8,
    flags: Flags,
    iflags: IFlags,
    /// Unique per-message token; drop notices echo it back so the sender
    /// can correlate
    marker: String,
    fields: Vec<(String, FieldValue)>,
    alarms: Vec<Alarm>,
}

impl Message {
    /// Create a message addressed to `recipient`
    ///
    /// The sender is left empty; the actor runtime stamps it on send. The
    /// TTL starts at [`DEFAULT_TTL`].
    pub fn new(name: impl Into<String>, recipient: impl Into<String>) -> Message {
        Message {
            name: name.into(),
            sender: String::new(),
            recipient: recipient.into(),
            ttl: DEFAULT_TTL,
            flags: Flags::empty(),
            iflags: IFlags::empty(),
            marker: new_marker(),
            fields: Vec::new(),
            alarms: Vec::new(),
        }
    }

    /// Create an internal (protocol) message with an explicit sender
    pub fn internal(
        name: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Message {
        let mut msg = Message::new(name, recipient);
        msg.sender = sender.into();
        msg.iflags.insert(IFlags::INTERNAL);
        msg
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn iflags(&self) -> IFlags {
        self.iflags
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = sender.into();
    }

    /// Rewrite the recipient (multicast fan-out, domain qualification)
    pub fn set_recipient(&mut self, recipient: impl Into<String>) {
        self.recipient = recipient.into();
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    /// Decrement the TTL by one hop; returns `false` once it is exhausted
    pub fn decrement_ttl(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl > 0
    }

    pub fn with_flags(mut self, flags: Flags) -> Message {
        self.flags |= flags;
        self
    }

    pub fn set_iflags(&mut self, iflags: IFlags) {
        self.iflags.insert(iflags);
    }

    pub fn is_internal(&self) -> bool {
        self.iflags.contains(IFlags::INTERNAL)
    }

    pub fn add_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    pub fn add_int(&mut self, name: impl Into<String>, value: i64) {
        self.add_field(name, FieldValue::Int(value));
    }

    pub fn add_double(&mut self, name: impl Into<String>, value: f64) {
        self.add_field(name, FieldValue::Double(value));
    }

    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add_field(name, FieldValue::String(value.into()));
    }

    pub fn add_binary(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.add_field(name, FieldValue::Binary(value));
    }

    /// Builder-style variant of [`Message::add_string`]
    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Message {
        self.add_string(name, value);
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_str)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(FieldValue::as_int)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn attach_alarm(&mut self, alarm: Alarm) {
        self.alarms.push(alarm);
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn take_alarms(&mut self) -> Vec<Alarm> {
        std::mem::take(&mut self.alarms)
    }

    /// Reassemble a message from its decoded wire parts (codec use only)
    #[allow(clippy::too_many_arguments)]
    pub fn from_wire_parts(
        name: String,
        sender: String,
        recipient: String,
        ttl: u8,
        flags: Flags,
        iflags: IFlags,
        marker: String,
        fields: Vec<(String, FieldValue)>,
        alarms: Vec<Alarm>,
    ) -> Message {
        let marker = if marker.is_empty() { new_marker() } else { marker };
        Message {
            name,
            sender,
            recipient,
            ttl,
            flags,
            iflags,
            marker,
            fields,
            alarms,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} -> {}, ttl {}]",
            self.name, self.sender, self.recipient, self.ttl
        )
    }
}

fn new_marker() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_bit_operations() {
        let mut flags = Flags::DROP_OK | Flags::URGENT;
        assert!(flags.contains(Flags::DROP_OK));
        assert!(flags.contains(Flags::URGENT));
        assert!(!flags.contains(Flags::MULTICAST));
        flags.insert(Flags::MULTICAST);
        assert!(flags.contains(Flags::MULTICAST));
    }

    #[test]
    fn field_order_is_preserved() {
        let mut msg = Message::new("job-update", "worker@local");
        msg.add_int("attempt", 3);
        msg.add_string("status", "running");
        msg.add_double("progress", 0.25);

        let names: Vec<&str> = msg.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["attempt", "status", "progress"]);
        assert_eq!(msg.get_int("attempt"), Some(3));
        assert_eq!(msg.get_string("status"), Some("running"));
    }

    #[test]
    fn ttl_decrements_to_exhaustion() {
        let mut msg = Message::new("ping", "echo@local");
        msg.set_ttl(2);
        assert!(msg.decrement_ttl());
        assert!(!msg.decrement_ttl());
        assert_eq!(msg.ttl(), 0);
        // Saturates instead of wrapping
        assert!(!msg.decrement_ttl());
        assert_eq!(msg.ttl(), 0);
    }

    #[test]
    fn internal_messages_are_flagged() {
        let msg = Message::internal("plexus-xon", "a@local", "b@local");
        assert!(msg.is_internal());
        assert_eq!(msg.sender(), "a@local");
    }

    #[test]
    fn markers_are_unique() {
        let a = Message::new("m", "x");
        let b = Message::new("m", "x");
        assert_ne!(a.marker(), b.marker());
    }
}
