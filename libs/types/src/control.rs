//! Protocol control message vocabulary
//!
//! Control messages are ordinary [`crate::Message`]s carrying the
//! `INTERNAL` iflag and one of these names. They implement actor lifecycle,
//! the xoff/xon backpressure protocol and the daemon handshake.

/// First message of a process connecting to the daemon; carries a `name`
/// field with the process name
pub const INIT_MASTER_BORN: &str = "plexus-init-master-born";

/// Daemon's reply to [`INIT_MASTER_BORN`]; carries a `domain` field
pub const INIT_DOMAIN: &str = "plexus-init-domain";

/// Handshake message name prefix; anything starting with this is always
/// handled by the local daemon, whatever the recipient says
pub const INIT_PREFIX: &str = "plexus-init-";

/// An actor has been born (sender is the actor)
pub const BORN: &str = "plexus-born";

/// An actor has died (sender is the actor)
pub const DIED: &str = "plexus-died";

/// Stop sending to me; carries an `origin` field naming the full queue
pub const XOFF: &str = "plexus-xoff";

/// You may resume sending to `origin`
pub const XON: &str = "plexus-xon";

/// Tell me when I may send to you again; carries an `origin` field naming
/// the waiting actor
pub const NTF_XON: &str = "plexus-ntf-xon";

/// Ask an actor to finish and exit its loop
pub const TERMINATE: &str = "plexus-terminate";

/// An actor reports to the master that it has exited
pub const TERMINATED: &str = "plexus-terminated";

/// Ask the master actor to terminate every actor and then itself
pub const MASTER_TERMINATE: &str = "plexus-master-terminate";

/// Master reports completion of process-wide termination
pub const MASTER_TERMINATED: &str = "plexus-master-terminated";

/// Master reports that the daemon handshake is complete
pub const MASTER_INIT_DONE: &str = "plexus-master-init-done";

/// Unblock a thread waiting in `Runtime::wait` without terminating anything
pub const CANCEL: &str = "plexus-cancel";

/// Liveness probe to the daemon
pub const PING: &str = "plexus-ping";

/// Daemon's reply to [`PING`]
pub const PONG: &str = "plexus-pong";

/// Subscribe the sender to a multicast group; fields: `group`, optional
/// `filter`
pub const SUBSCRIBE: &str = "plexus-subscribe";

/// Remove the sender's subscription(s); fields: `group`, optional `filter`
pub const UNSUBSCRIBE: &str = "plexus-unsubscribe";

/// A message was dropped; fields: `reason`, `original-marker`, `extra`
pub const ERROR_DROP: &str = "plexus-error-drop";

/// Ask the daemon for a snapshot of the alarm registry
pub const REPORT_ALARMS: &str = "plexus-report-alarms";

/// Daemon's reply to [`REPORT_ALARMS`]; the alarms ride in the message's
/// attached-alarm list
pub const ALARM_REPORT: &str = "plexus-alarm-report";

/// Base name of the router daemon pseudo-actor
pub const DAEMON_NAME: &str = "plexusd";

/// Base name of every process's master actor (reserved)
pub const MASTER_NAME: &str = "plexus-master";
