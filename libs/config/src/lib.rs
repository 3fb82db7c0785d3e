//! # Plexus Centralized Configuration
//!
//! This crate provides the constants and tunable defaults shared by all
//! Plexus crates, eliminating duplication across the codebase.
//!
//! - **Queue defaults**: threshold and xoff retry timing
//! - **Daemon defaults**: well-known local address and domain name
//!
//! Socket-level defaults (buffer sizes, backlog, idle timeouts) live with
//! the socket event layer in the `network` crate.
//!
//! These are configuration constants, not protocol: peers never need to
//! agree on them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long one multiplex call may sleep before timeout scans run again
pub const POLL_TICK: Duration = Duration::from_millis(10);

/// Actor queue defaults
pub mod queue {
    use std::time::Duration;

    /// Default per-actor queue threshold (messages)
    pub const DEFAULT_THRESHOLD: usize = 100;

    /// How long to wait for a `plexus-xon` before re-sending `plexus-ntf-xon`
    pub const DEFAULT_XOFF_TIMEOUT: Duration = Duration::from_millis(50);
}

/// Router daemon defaults
pub mod daemon {
    /// Well-known local address of the router daemon
    pub const DEFAULT_URL: &str = "unix:///tmp/plexusd.sock";

    /// Default routing domain
    pub const DEFAULT_DOMAIN: &str = "local";
}

/// Router daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Routing domain this daemon manages
    pub domain: String,
    /// Local address to listen on
    pub local_url: String,
    /// Poll tick used by the daemon's socket set
    #[serde(default = "default_poll_tick", with = "duration_ms")]
    pub poll_tick: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            domain: daemon::DEFAULT_DOMAIN.to_string(),
            local_url: daemon::DEFAULT_URL.to_string(),
            poll_tick: POLL_TICK,
        }
    }
}

fn default_poll_tick() -> Duration {
    POLL_TICK
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.domain, "local");
        assert!(cfg.local_url.starts_with("unix://"));
        assert!(cfg.poll_tick > Duration::ZERO);
    }
}
