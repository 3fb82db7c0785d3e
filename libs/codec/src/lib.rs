//! # Plexus Wire Codec
//!
//! ## Purpose
//! Encoding and decoding rules for messages crossing a process boundary.
//! A message travels as one self-describing JSON object terminated by a
//! single NUL byte, sent whole over a byte-stream or datagram socket.
//!
//! ## Framing Contract
//! - `encode` produces the JSON text followed by exactly one `\0`.
//! - `decode` enforces NUL-termination defensively: everything from the
//!   first NUL onwards is discarded before parsing, and a frame without a
//!   NUL is still parsed (a well-behaved peer always terminates).
//! - A `version` property must match [`PROTOCOL_VERSION`]; anything else is
//!   rejected so incompatible peers fail loudly instead of misrouting.
//!
//! Binary field values are carried base64-encoded; all other values are
//! native JSON types with a `type` tag.

pub mod error;
mod wire;

pub use error::CodecError;

use bytes::Bytes;
use types::Message;

/// Wire format version; bump on any incompatible change
pub const PROTOCOL_VERSION: u8 = 1;

/// Encode a message as NUL-terminated JSON
pub fn encode(msg: &Message) -> Vec<u8> {
    let wire = wire::WireMessage::from_message(msg);
    let mut out = serde_json::to_vec(&wire).expect("message JSON encoding cannot fail");
    out.push(0);
    out
}

/// Decode one received frame into a message
///
/// Accepts both `&[u8]` and [`Bytes`] payloads as produced by the socket
/// event layer.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    // Enforce NUL termination: keep only what precedes the first NUL
    let body = match frame.iter().position(|&b| b == 0) {
        Some(pos) => &frame[..pos],
        None => frame,
    };
    if body.is_empty() {
        return Err(CodecError::EmptyFrame);
    }

    let wire: wire::WireMessage =
        serde_json::from_slice(body).map_err(|source| CodecError::InvalidJson { source })?;
    if wire.version != PROTOCOL_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: wire.version,
        });
    }
    wire.into_message()
}

/// Convenience wrapper over [`decode`] for `Bytes` payloads
pub fn decode_bytes(frame: &Bytes) -> Result<Message, CodecError> {
    decode(frame.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Alarm, Flags, Severity};

    fn sample() -> Message {
        let mut msg = Message::new("job-update", "sink@local").with_flags(Flags::NTF_DROP);
        msg.set_sender("source@local");
        msg.set_ttl(7);
        msg.add_int("attempt", 3);
        msg.add_string("status", "running");
        msg.add_double("progress", 0.5);
        msg.add_binary("digest", vec![0x00, 0xff, 0x10]);
        msg.attach_alarm(
            Alarm::new("disk-low", Severity::Warning)
                .origin("source@local")
                .comment("under 5% free"),
        );
        msg
    }

    #[test]
    fn frame_is_nul_terminated() {
        let frame = encode(&sample());
        assert_eq!(frame.last(), Some(&0u8));
        assert_eq!(frame.iter().filter(|&&b| b == 0).count(), 1);
    }

    #[test]
    fn round_trip_preserves_envelope_and_fields() {
        let msg = sample();
        let decoded = decode(&encode(&msg)).unwrap();

        assert_eq!(decoded.name(), "job-update");
        assert_eq!(decoded.sender(), "source@local");
        assert_eq!(decoded.recipient(), "sink@local");
        assert_eq!(decoded.ttl(), 7);
        assert!(decoded.flags().contains(Flags::NTF_DROP));
        assert_eq!(decoded.marker(), msg.marker());

        let names: Vec<&str> = decoded.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["attempt", "status", "progress", "digest"]);
        assert_eq!(decoded.get_int("attempt"), Some(3));
        assert_eq!(decoded.field("digest").unwrap().as_binary(), Some(&[0x00, 0xff, 0x10][..]));

        assert_eq!(decoded.alarms().len(), 1);
        let alarm = &decoded.alarms()[0];
        assert_eq!(alarm.name(), "disk-low");
        assert_eq!(alarm.severity(), Severity::Warning);
        assert_eq!(alarm.comment_text(), Some("under 5% free"));
    }

    #[test]
    fn decode_tolerates_trailing_garbage_after_nul() {
        let mut frame = encode(&sample());
        frame.extend_from_slice(b"noise after the terminator");
        assert!(decode(&frame).is_ok());
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let frame = br#"{"version":99,"name":"m","sender":"a@x","recipient":"b@x","ttl":4,"flags":0,"iflags":0}"#;
        match decode(frame) {
            Err(CodecError::VersionMismatch { expected, actual }) => {
                assert_eq!(expected, PROTOCOL_VERSION);
                assert_eq!(actual, 99);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_missing_required_property() {
        let frame = br#"{"version":1,"name":"m","sender":"a@x","ttl":4,"flags":0,"iflags":0}"#;
        assert!(matches!(decode(frame), Err(CodecError::InvalidJson { .. })));
    }

    #[test]
    fn decode_rejects_empty_frame() {
        assert!(matches!(decode(b"\0"), Err(CodecError::EmptyFrame)));
        assert!(matches!(decode(b""), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn field_without_marker_still_decodes() {
        // Peers are allowed to omit the marker; one is generated locally
        let frame = br#"{"version":1,"name":"m","sender":"a@x","recipient":"b@x","ttl":4,"flags":0,"iflags":0}"#;
        let msg = decode(frame).unwrap();
        assert!(!msg.marker().is_empty());
    }
}
