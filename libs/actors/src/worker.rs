//! The actor loop
//!
//! Each actor runs this loop on its own OS thread: announce birth to the
//! daemon, pop messages (internal-only while paused), keep the xoff/xon
//! bookkeeping honest, hand application messages to the behavior, and
//! announce death on the way out.

use crate::runtime::{ActorHandle, RuntimeInner};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use types::{control, full_name, Message};

/// What the behavior wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Finish in-flight bookkeeping and exit the loop
    Stop,
}

/// An actor's message handler
///
/// Must not block: anything long-running belongs in its own actor, fed by
/// messages.
pub trait ActorBehavior: Send + 'static {
    fn handle(&mut self, ctx: &mut ActorContext<'_>, msg: Message) -> Flow;
}

impl<F> ActorBehavior for F
where
    F: FnMut(&mut ActorContext<'_>, Message) -> Flow + Send + 'static,
{
    fn handle(&mut self, ctx: &mut ActorContext<'_>, msg: Message) -> Flow {
        self(ctx, msg)
    }
}

/// Capabilities handed to a behavior while it processes one message
pub struct ActorContext<'a> {
    inner: &'a Arc<RuntimeInner>,
    full_name: &'a str,
}

impl ActorContext<'_> {
    /// This actor's fully qualified name
    pub fn name(&self) -> &str {
        self.full_name
    }

    pub fn domain(&self) -> String {
        self.inner.domain()
    }

    /// Send a message on behalf of this actor
    pub fn send(&self, msg: Message) {
        self.inner.route(msg, Some(self.full_name), true);
    }
}

/// Per-actor backpressure bookkeeping
struct Backpressure {
    /// Peers that told me to pause, with the time of my last `ntf-xon`
    paused_on: HashMap<String, Instant>,
    /// Peers waiting for my queue to drain
    notify_on_drain: HashSet<String>,
    xoff_timeout: Duration,
}

impl Backpressure {
    fn new(xoff_timeout: Duration) -> Backpressure {
        Backpressure {
            paused_on: HashMap::new(),
            notify_on_drain: HashSet::new(),
            xoff_timeout,
        }
    }

    fn is_paused(&self) -> bool {
        !self.paused_on.is_empty()
    }
}

pub(crate) fn run(
    inner: Arc<RuntimeInner>,
    handle: Arc<ActorHandle>,
    mut behavior: Box<dyn ActorBehavior>,
    xoff_timeout: Duration,
) {
    let me = full_name(&handle.name, &inner.domain());
    let queue = handle.queue.clone();
    let mut bp = Backpressure::new(xoff_timeout);

    // Tell the daemon this actor exists so it becomes routable
    inner.route(
        Message::internal(control::BORN, me.clone(), control::DAEMON_NAME),
        Some(&me),
        true,
    );
    debug!(actor = %me, "actor started");

    let mut stop = false;
    while !stop {
        // While paused, make application-level progress impossible but
        // keep protocol traffic flowing; the timed pop keeps the ntf-xon
        // retry timer ticking even if nothing arrives
        let msg = if bp.is_paused() {
            queue.pop_timeout(true, bp.xoff_timeout)
        } else {
            Some(queue.pop_blocking(false))
        };

        if let Some(msg) = msg {
            if msg.is_internal() {
                stop = handle_internal(&inner, &me, &mut bp, &msg);
            } else {
                let mut ctx = ActorContext {
                    inner: &inner,
                    full_name: &me,
                };
                if behavior.handle(&mut ctx, msg) == Flow::Stop {
                    stop = true;
                }
            }
        }

        if !bp.notify_on_drain.is_empty() && !queue.is_over_low() && !stop {
            send_xon_to_waiters(&inner, &me, &mut bp);
        }

        retry_ntf_xon(&inner, &me, &mut bp);
    }

    // Unblock anyone still waiting on this queue before going away
    send_xon_to_waiters(&inner, &me, &mut bp);

    inner.route(
        Message::internal(control::DIED, me.clone(), control::DAEMON_NAME),
        Some(&me),
        true,
    );
    inner.master_queue.push(Message::internal(
        control::TERMINATED,
        me.clone(),
        control::MASTER_NAME,
    ));
    debug!(actor = %me, "actor stopped");
}

/// React to one protocol message; returns `true` when the actor must stop
fn handle_internal(
    inner: &Arc<RuntimeInner>,
    me: &str,
    bp: &mut Backpressure,
    msg: &Message,
) -> bool {
    match msg.name() {
        control::XOFF => {
            // A peer's queue filled because of me: pause, and ask it to
            // tell me when it has drained
            let Some(origin) = msg.get_string("origin") else {
                warn!(actor = %me, "xoff without origin field ignored");
                return false;
            };
            let origin = origin.to_string();
            bp.paused_on.insert(origin.clone(), Instant::now());
            let mut ntf = Message::internal(control::NTF_XON, me, origin);
            ntf.add_string("origin", me);
            inner.route(ntf, Some(me), true);
        }
        control::XON => {
            // Repeats can arrive because of the retry mechanism; ignoring
            // an unexpected one is correct
            if let Some(origin) = msg.get_string("origin") {
                if bp.paused_on.remove(origin).is_none() {
                    trace!(actor = %me, origin, "unexpected xon ignored");
                }
            }
        }
        control::NTF_XON => {
            // A paused peer wants to know when my queue has drained
            if let Some(origin) = msg.get_string("origin") {
                bp.notify_on_drain.insert(origin.to_string());
            }
        }
        control::TERMINATE => return true,
        other => trace!(actor = %me, name = other, "unhandled internal message"),
    }
    false
}

fn send_xon_to_waiters(inner: &Arc<RuntimeInner>, me: &str, bp: &mut Backpressure) {
    for waiter in bp.notify_on_drain.drain() {
        let mut xon = Message::internal(control::XON, me, waiter);
        xon.add_string("origin", me);
        inner.route(xon, Some(me), true);
    }
}

/// Defend against lost xon notifications (or peers that forgot us):
/// re-send `ntf-xon` to any peer we have been paused on for too long
fn retry_ntf_xon(inner: &Arc<RuntimeInner>, me: &str, bp: &mut Backpressure) {
    let now = Instant::now();
    for (peer, last_sent) in bp.paused_on.iter_mut() {
        if now.duration_since(*last_sent) > bp.xoff_timeout {
            let mut ntf = Message::internal(control::NTF_XON, me, peer.clone());
            ntf.add_string("origin", me);
            inner.route(ntf, Some(me), true);
            *last_sent = now;
        }
    }
}
