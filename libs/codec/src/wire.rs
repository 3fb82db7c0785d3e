//! Serde representation of the wire format
//!
//! Kept separate from `types::Message` so the in-memory model can evolve
//! without silently changing what goes on the wire.

use crate::{CodecError, PROTOCOL_VERSION};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use types::{Alarm, FieldValue, Flags, IFlags, Message, Severity};

#[derive(Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub version: u8,
    name: String,
    sender: String,
    recipient: String,
    ttl: u8,
    flags: u8,
    iflags: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    marker: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<WireField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    alarms: Vec<WireAlarm>,
}

/// One typed field; `type` tag selects the value representation
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireField {
    Int { name: String, value: i64 },
    Double { name: String, value: f64 },
    String { name: String, value: String },
    /// Base64-encoded bytes
    Binary { name: String, value: String },
}

#[derive(Serialize, Deserialize)]
struct WireAlarm {
    name: String,
    severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    origin: String,
    is_on: bool,
    auto_off: bool,
    timestamp_us: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

impl WireMessage {
    pub(crate) fn from_message(msg: &Message) -> WireMessage {
        WireMessage {
            version: PROTOCOL_VERSION,
            name: msg.name().to_string(),
            sender: msg.sender().to_string(),
            recipient: msg.recipient().to_string(),
            ttl: msg.ttl(),
            flags: msg.flags().0,
            iflags: msg.iflags().0,
            marker: msg.marker().to_string(),
            fields: msg
                .fields()
                .map(|(name, value)| WireField::from_field(name, value))
                .collect(),
            alarms: msg.alarms().iter().map(WireAlarm::from_alarm).collect(),
        }
    }

    pub(crate) fn into_message(self) -> Result<Message, CodecError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            fields.push(field.into_field()?);
        }
        let alarms = self.alarms.into_iter().map(WireAlarm::into_alarm).collect();
        Ok(Message::from_wire_parts(
            self.name,
            self.sender,
            self.recipient,
            self.ttl,
            Flags(self.flags),
            IFlags(self.iflags),
            self.marker,
            fields,
            alarms,
        ))
    }
}

impl WireField {
    fn from_field(name: &str, value: &FieldValue) -> WireField {
        let name = name.to_string();
        match value {
            FieldValue::Int(i) => WireField::Int { name, value: *i },
            FieldValue::Double(d) => WireField::Double { name, value: *d },
            FieldValue::String(s) => WireField::String {
                name,
                value: s.clone(),
            },
            FieldValue::Binary(b) => WireField::Binary {
                name,
                value: BASE64.encode(b),
            },
        }
    }

    fn into_field(self) -> Result<(String, FieldValue), CodecError> {
        Ok(match self {
            WireField::Int { name, value } => (name, FieldValue::Int(value)),
            WireField::Double { name, value } => (name, FieldValue::Double(value)),
            WireField::String { name, value } => (name, FieldValue::String(value)),
            WireField::Binary { name, value } => {
                let bytes = BASE64
                    .decode(value.as_bytes())
                    .map_err(|source| CodecError::InvalidBase64 {
                        field: name.clone(),
                        source,
                    })?;
                (name, FieldValue::Binary(bytes))
            }
        })
    }
}

impl WireAlarm {
    fn from_alarm(alarm: &Alarm) -> WireAlarm {
        WireAlarm {
            name: alarm.name().to_string(),
            severity: alarm.severity(),
            origin: alarm.origin_name().to_string(),
            is_on: alarm.is_on(),
            auto_off: alarm.is_auto_off(),
            timestamp_us: alarm.timestamp_us(),
            comment: alarm.comment_text().map(str::to_string),
        }
    }

    fn into_alarm(self) -> Alarm {
        Alarm::from_wire_parts(
            self.name,
            self.severity,
            self.origin,
            self.is_on,
            self.auto_off,
            self.timestamp_us,
            self.comment,
        )
    }
}
