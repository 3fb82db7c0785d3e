//! The per-process runtime instance
//!
//! One [`Runtime`] per process (no globals): it owns the actor registry,
//! the master bridge to the router daemon, and the send path with its
//! backpressure trigger. Construct it with [`Runtime::connect`], spawn
//! actors, then either [`Runtime::wait`] for a cascading shutdown or drive
//! one with [`Runtime::shutdown`].

use crate::error::RuntimeError;
use crate::master;
use crate::policy::{DefaultPausePolicy, PausePolicy};
use crate::queue::MessageQueue;
use crate::worker::{self, ActorBehavior};
use dashmap::DashMap;
use network::SocketUrl;
use nix::errno::Errno;
use nix::sys::socket::{send as fd_send, MsgFlags};
use parking_lot::{Mutex, RwLock};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use types::{control, full_name, Message};

/// Configuration for one actor
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Base name, unique within the process; must not contain '@'
    pub name: String,
    /// Queue backpressure threshold; 0 = default
    pub queue_threshold: usize,
    /// How long to wait for `plexus-xon` before nudging the blocking peer
    /// again; zero = default
    pub xoff_timeout: Duration,
    /// Thread stack size; `None` = OS default
    pub stack_size: Option<usize>,
}

impl ActorConfig {
    pub fn new(name: impl Into<String>) -> ActorConfig {
        ActorConfig {
            name: name.into(),
            queue_threshold: 0,
            xoff_timeout: Duration::ZERO,
            stack_size: None,
        }
    }

    pub fn queue_threshold(mut self, threshold: usize) -> ActorConfig {
        self.queue_threshold = threshold;
        self
    }

    pub fn xoff_timeout(mut self, timeout: Duration) -> ActorConfig {
        self.xoff_timeout = timeout;
        self
    }
}

pub(crate) struct ActorHandle {
    pub(crate) name: String, // base name
    pub(crate) queue: Arc<MessageQueue>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
}

/// Cross-thread sender over the (duplicated) daemon socket descriptor
///
/// The master actor owns the socket inside its `SocketSet`; every other
/// thread sends through this duplicate. One seqpacket send per message
/// keeps frames atomic, so a mutex around the fd is all the coordination
/// needed.
pub(crate) struct DaemonLink {
    fd: Mutex<Option<OwnedFd>>,
}

impl DaemonLink {
    fn new() -> DaemonLink {
        DaemonLink {
            fd: Mutex::new(None),
        }
    }

    pub(crate) fn attach(&self, fd: OwnedFd) {
        *self.fd.lock() = Some(fd);
    }

    pub(crate) fn send(&self, msg: &Message) -> bool {
        let guard = self.fd.lock();
        let Some(fd) = guard.as_ref() else {
            warn!(msg = %msg, "no daemon link; message dropped");
            return false;
        };
        let frame = codec::encode(msg);
        loop {
            match fd_send(fd.as_raw_fd(), &frame, MsgFlags::MSG_NOSIGNAL) {
                Ok(_) => return true,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(%err, "send to router daemon failed");
                    return false;
                }
            }
        }
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) process_name: String,
    pub(crate) domain: RwLock<String>,
    pub(crate) actors: DashMap<String, Arc<ActorHandle>>,
    pub(crate) master_queue: Arc<MessageQueue>,
    /// Channel between the master and whichever thread blocks in `wait`
    pub(crate) global_queue: Arc<MessageQueue>,
    pub(crate) daemon_link: DaemonLink,
    pub(crate) policy: Box<dyn PausePolicy>,
    pub(crate) terminating: AtomicBool,
}

impl RuntimeInner {
    pub(crate) fn domain(&self) -> String {
        self.domain.read().clone()
    }

    /// Route one message: local queue, master, or out to the daemon
    ///
    /// `sender` is the fully qualified name of the managed actor sending,
    /// if any; unmanaged origins pass `None`.
    pub(crate) fn route(&self, mut msg: Message, sender: Option<&str>, sender_managed: bool) {
        let domain = self.domain();
        if msg.sender().is_empty() {
            let fallback = full_name(&self.process_name, &domain);
            msg.set_sender(sender.map(str::to_string).unwrap_or(fallback));
        }
        // Names travel fully qualified so backpressure bookkeeping on both
        // sides agrees on keys
        msg.set_sender(full_name(msg.sender(), &domain));
        msg.set_recipient(full_name(msg.recipient(), &domain));

        let recipient = msg.recipient().to_string();
        let (base, recipient_domain) = match recipient.split_once('@') {
            Some((base, d)) => (base, d),
            None => (recipient.as_str(), domain.as_str()),
        };

        if recipient_domain != domain || base == control::DAEMON_NAME {
            // Not ours to deliver: hand it to the local daemon for routing
            self.daemon_link.send(&msg);
            return;
        }
        if base == control::MASTER_NAME {
            self.master_queue.push(msg);
            return;
        }
        match self.actors.get(base) {
            Some(handle) => self.deliver_local(&handle, msg, sender_managed),
            None => {
                // Unknown here; the daemon may know it (or already routed
                // around it). Let it decide, and drop-notify if asked.
                self.daemon_link.send(&msg);
            }
        }
    }

    /// Push onto a local queue and fire the backpressure trigger when the
    /// delivery crossed the queue's threshold
    pub(crate) fn deliver_local(
        &self,
        handle: &ActorHandle,
        msg: Message,
        sender_managed: bool,
    ) {
        let pause = self.policy.should_pause(&msg, sender_managed);
        let sender = msg.sender().to_string();
        let congested = msg.recipient().to_string();
        handle.queue.push(msg);

        if pause && handle.queue.is_over_high() {
            // Tell the sender to hold off; `origin` names the congested
            // queue so the xon can be matched up later
            debug!(queue = %congested, sender = %sender, "queue over threshold, pausing sender");
            let mut xoff = Message::internal(control::XOFF, congested.clone(), sender);
            xoff.add_string("origin", congested);
            self.route(xoff, None, false);
        }
    }
}

/// The per-process actor runtime
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    master_join: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Connect to the router daemon and start the master actor
    ///
    /// Blocks until the daemon handshake completes (the daemon tells us
    /// our routing domain) or fails.
    pub fn connect(process_name: impl Into<String>, daemon_url: &str) -> Result<Runtime, RuntimeError> {
        Runtime::connect_with_policy(process_name, daemon_url, Box::new(DefaultPausePolicy))
    }

    /// [`Runtime::connect`] with a custom pause-exemption policy
    pub fn connect_with_policy(
        process_name: impl Into<String>,
        daemon_url: &str,
        policy: Box<dyn PausePolicy>,
    ) -> Result<Runtime, RuntimeError> {
        let process_name = process_name.into();
        let url = SocketUrl::parse(daemon_url)?;

        let inner = Arc::new(RuntimeInner {
            process_name: process_name.clone(),
            domain: RwLock::new(config::daemon::DEFAULT_DOMAIN.to_string()),
            actors: DashMap::new(),
            master_queue: Arc::new(MessageQueue::new(
                format!("{process_name}-master-queue"),
                config::queue::DEFAULT_THRESHOLD,
            )),
            global_queue: Arc::new(MessageQueue::new(
                format!("{process_name}-global-queue"),
                config::queue::DEFAULT_THRESHOLD,
            )),
            daemon_link: DaemonLink::new(),
            policy,
            terminating: AtomicBool::new(false),
        });

        let master_inner = inner.clone();
        let master_join = std::thread::Builder::new()
            .name(control::MASTER_NAME.to_string())
            .spawn(move || master::run(master_inner, url))
            .expect("spawning master thread");

        // Wait for the master to finish the daemon handshake
        let done = inner.global_queue.pop_blocking(false);
        if done.name() != control::MASTER_INIT_DONE {
            return Err(RuntimeError::HandshakeFailed {
                reason: format!("unexpected '{}' during startup", done.name()),
            });
        }
        if let Some(reason) = done.get_string("error") {
            let reason = reason.to_string();
            let _ = master_join.join();
            return Err(if reason.contains("unreachable") {
                RuntimeError::DaemonUnreachable {
                    url: daemon_url.to_string(),
                }
            } else {
                RuntimeError::HandshakeFailed { reason }
            });
        }

        info!(process = %process_name, domain = %inner.domain(), "runtime connected");
        Ok(Runtime {
            inner,
            master_join: Mutex::new(Some(master_join)),
        })
    }

    /// The routing domain the daemon assigned to this process
    pub fn domain(&self) -> String {
        self.inner.domain()
    }

    /// Spawn a named actor on its own OS thread
    pub fn spawn(
        &self,
        cfg: ActorConfig,
        behavior: impl ActorBehavior,
    ) -> Result<(), RuntimeError> {
        if self.inner.terminating.load(Ordering::SeqCst) {
            return Err(RuntimeError::Terminating);
        }
        if !types::is_valid_base_name(&cfg.name)
            || cfg.name == control::DAEMON_NAME
            || cfg.name == control::MASTER_NAME
        {
            return Err(RuntimeError::InvalidActorName { name: cfg.name });
        }

        let threshold = if cfg.queue_threshold > 0 {
            cfg.queue_threshold
        } else {
            config::queue::DEFAULT_THRESHOLD
        };
        let xoff_timeout = if cfg.xoff_timeout > Duration::ZERO {
            cfg.xoff_timeout
        } else {
            config::queue::DEFAULT_XOFF_TIMEOUT
        };

        let handle = Arc::new(ActorHandle {
            name: cfg.name.clone(),
            queue: Arc::new(MessageQueue::new(format!("{}-queue", cfg.name), threshold)),
            join: Mutex::new(None),
        });

        // Reserve the name before the thread exists so a racing duplicate
        // spawn fails cleanly
        match self.inner.actors.entry(cfg.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RuntimeError::DuplicateActor { name: cfg.name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        let inner = self.inner.clone();
        let thread_handle = handle.clone();
        let mut builder = std::thread::Builder::new().name(cfg.name.clone());
        if let Some(stack) = cfg.stack_size {
            builder = builder.stack_size(stack);
        }
        let join = builder
            .spawn(move || worker::run(inner, thread_handle, Box::new(behavior), xoff_timeout))
            .expect("spawning actor thread");
        *handle.join.lock() = Some(join);
        Ok(())
    }

    /// Send a message from outside any actor (an unmanaged origin)
    pub fn send(&self, msg: Message) {
        self.inner.route(msg, None, false);
    }

    /// Block until the process-wide shutdown completes
    ///
    /// Returns `true` when every actor (and the master) has terminated,
    /// `false` when [`Runtime::cancel_wait`] unblocked the wait.
    pub fn wait(&self) -> bool {
        loop {
            let msg = self.inner.global_queue.pop_blocking(false);
            match msg.name() {
                control::MASTER_TERMINATED => return true,
                control::CANCEL => return false,
                other => debug!(name = other, "ignoring message on global queue"),
            }
        }
    }

    /// Unblock a thread waiting in [`Runtime::wait`] without terminating
    /// any actor
    pub fn cancel_wait(&self) {
        self.inner.global_queue.push(Message::internal(
            control::CANCEL,
            control::MASTER_NAME,
            self.inner.process_name.clone(),
        ));
    }

    /// Cascading shutdown: ask the master to terminate every actor, then
    /// wait for the whole process to wind down
    pub fn shutdown(&self) {
        self.inner.terminating.store(true, Ordering::SeqCst);
        self.inner.master_queue.push(Message::internal(
            control::MASTER_TERMINATE,
            self.inner.process_name.clone(),
            control::MASTER_NAME,
        ));
        self.wait();
        if let Some(join) = self.master_join.lock().take() {
            let _ = join.join();
        }
    }
}
