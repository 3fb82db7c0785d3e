//! Operator-visible alarms
//!
//! Alarms are the primary failure-observation channel: instead of scraping
//! logs, an operator queries the router daemon's alarm registry. An alarm is
//! identified by its `(origin, name)` pair; raising it twice replaces the
//! previous entry and clearing a non-existent alarm is a no-op.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Alarm severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Notice,
    Warning,
    Error,
}

/// An operator-visible condition
#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    name: String,
    severity: Severity,
    /// Who raised it; empty when raised anonymously
    origin: String,
    /// `true` = condition present, `false` = condition cleared
    is_on: bool,
    /// The raiser can detect the condition ending and will clear it itself
    auto_off: bool,
    /// Microseconds since the UNIX epoch
    timestamp_us: i64,
    comment: Option<String>,
}

impl Alarm {
    pub fn new(name: impl Into<String>, severity: Severity) -> Alarm {
        Alarm {
            name: name.into(),
            severity,
            origin: String::new(),
            is_on: true,
            auto_off: false,
            timestamp_us: now_us(),
            comment: None,
        }
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Alarm {
        self.origin = origin.into();
        self
    }

    pub fn off(mut self) -> Alarm {
        self.is_on = false;
        self
    }

    pub fn auto_off(mut self, auto_off: bool) -> Alarm {
        self.auto_off = auto_off;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Alarm {
        self.comment = Some(comment.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn origin_name(&self) -> &str {
        &self.origin
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn is_auto_off(&self) -> bool {
        self.auto_off
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn comment_text(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Registry key: `"origin#name"`
    pub fn key(&self) -> String {
        format!("{}#{}", self.origin, self.name)
    }

    /// Reassemble an alarm from its decoded wire parts (codec use only)
    pub fn from_wire_parts(
        name: String,
        severity: Severity,
        origin: String,
        is_on: bool,
        auto_off: bool,
        timestamp_us: i64,
        comment: Option<String>,
    ) -> Alarm {
        Alarm {
            name,
            severity,
            origin,
            is_on,
            auto_off,
            timestamp_us,
            comment,
        }
    }
}

/// Current time as microseconds since the UNIX epoch
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
