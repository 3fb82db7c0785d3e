//! Pause-exemption policy
//!
//! Whether a delivery that fills a queue should pause its sender is a
//! policy decision, kept pluggable rather than hard-coded in the delivery
//! path. The default exempts the cases where pausing would be ineffective
//! or harmful.

use types::{Flags, Message};

/// Decides whether the sender of `msg` should be paused after its
/// delivery pushed the recipient queue over its threshold
pub trait PausePolicy: Send + Sync {
    /// `sender_managed` is false for sends from threads the runtime does
    /// not manage (e.g. the embedding application's main thread)
    fn should_pause(&self, msg: &Message, sender_managed: bool) -> bool;
}

/// Default policy: never pause for internal protocol traffic, multicast
/// deliveries or unmanaged senders
///
/// - internal messages must keep flowing or the protocol deadlocks;
/// - a multicast fan-out has no single producer to pause;
/// - an unmanaged sender has no pop loop to pause.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPausePolicy;

impl PausePolicy for DefaultPausePolicy {
    fn should_pause(&self, msg: &Message, sender_managed: bool) -> bool {
        sender_managed && !msg.is_internal() && !msg.flags().contains(Flags::MULTICAST)
    }
}
