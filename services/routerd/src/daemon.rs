//! The daemon proper: socket handling and the routing decision
//!
//! One `Daemon` owns one socket set: a termination pipe, the well-known
//! server socket, and one comm socket per connected process. Everything
//! happens on the thread that calls [`Daemon::run`]; the poll call is the
//! only blocking point.

use crate::alarms::AlarmRegistry;
use crate::error::DaemonError;
use crate::groups::GroupRegistry;
use config::RouterConfig;
use network::{EventKind, SendOutcome, ServerExtra, SocketId, SocketSet, SocketUrl};
use nix::unistd::dup;
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};
use types::{control, domain_of, full_name, Alarm, Flags, Message, Severity};

/// What kind of peer sits behind a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    /// Read end of the termination pipe
    PipeRead,
    /// Write end of the termination pipe
    PipeWrite,
    /// The well-known local server socket
    Server,
    /// Fresh connection; becomes `Process` on its first message
    Undetermined,
    /// A local application process
    Process,
    /// Another daemon of the same domain (state reserved; federation is
    /// not routed)
    #[allow(dead_code)]
    Peer,
}

/// Per-socket bookkeeping
struct SocketCtx {
    kind: SocketKind,
    /// Display name (process name once identified)
    name: String,
    /// Actor names living behind this socket
    actors: HashSet<String>,
}

impl SocketCtx {
    fn new(kind: SocketKind, name: impl Into<String>) -> SocketCtx {
        SocketCtx {
            kind,
            name: name.into(),
            actors: HashSet::new(),
        }
    }
}

/// Cross-thread handle used to stop a running daemon
///
/// Writing a byte down the termination pipe is async-signal-safe, so this
/// also backs the binary's SIGINT/SIGTERM handling.
pub struct DaemonHandle {
    fd: OwnedFd,
}

impl DaemonHandle {
    pub fn terminate(&self) {
        let _ = nix::unistd::write(self.fd.as_fd(), b"x");
    }

    pub fn raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }
}

/// The router daemon
pub struct Daemon {
    set: SocketSet<SocketCtx>,
    domain: String,
    /// Fully qualified pseudo-actor name, `plexusd@<domain>`
    name: String,
    /// Actor name → socket it is reachable through
    registry: HashMap<String, SocketId>,
    groups: GroupRegistry,
    alarms: AlarmRegistry,
    pipe_write: SocketId,
}

impl Daemon {
    /// Bind the local server socket and set up the termination pipe
    pub fn new(config: RouterConfig) -> Result<Daemon, DaemonError> {
        let mut set: SocketSet<SocketCtx> = SocketSet::new(config.poll_tick);

        let pipe_url = SocketUrl::parse("pipe://").expect("pipe URL");
        set.create_server(
            &pipe_url,
            0,
            SocketCtx::new(SocketKind::PipeRead, "terminate-pipe"),
            ServerExtra::Default,
        )
        .map_err(|source| DaemonError::TerminatePipe { source })?;
        let pipe_write = loop {
            let event = set.poll();
            if let EventKind::Connected { comm } = event.kind {
                break comm;
            }
        };
        set.set_context(
            pipe_write,
            SocketCtx::new(SocketKind::PipeWrite, "terminate-pipe-write"),
        );

        let url = SocketUrl::parse(&config.local_url)?;
        set.create_server(
            &url,
            0,
            SocketCtx::new(SocketKind::Server, "local-server"),
            ServerExtra::Default,
        )
        .map_err(|source| DaemonError::Listen {
            url: config.local_url.clone(),
            source,
        })?;

        let name = full_name(control::DAEMON_NAME, &config.domain);
        info!(domain = %config.domain, url = %config.local_url, "router daemon listening");
        Ok(Daemon {
            set,
            domain: config.domain,
            name,
            registry: HashMap::new(),
            groups: GroupRegistry::new(),
            alarms: AlarmRegistry::new(),
            pipe_write,
        })
    }

    /// Handle for stopping the daemon from another thread or a signal
    /// handler
    pub fn handle(&self) -> DaemonHandle {
        let raw = self
            .set
            .raw_fd(self.pipe_write)
            .expect("termination pipe exists");
        let duped = dup(raw).expect("dup of termination pipe");
        DaemonHandle {
            fd: unsafe { OwnedFd::from_raw_fd(duped) },
        }
    }

    /// Run until a byte arrives on the termination pipe
    pub fn run(mut self) {
        loop {
            let event = self.set.poll();
            let Some(ctx) = self.set.context(event.socket) else {
                // Spawned comm sockets have no context until we assign one
                if let EventKind::Connected { .. } = event.kind {
                    unreachable!("connection events originate on the server socket");
                }
                debug!(socket = event.socket, "event on context-less socket ignored");
                continue;
            };
            let kind = ctx.kind;

            match kind {
                SocketKind::PipeRead => {
                    if matches!(event.kind, EventKind::DataIn { .. }) {
                        info!("termination requested");
                        return;
                    }
                    panic!("unexpected event on termination pipe: {:?}", event.kind);
                }
                SocketKind::PipeWrite => {
                    panic!("unexpected event on termination pipe write end");
                }
                SocketKind::Server => match event.kind {
                    EventKind::Connected { comm } => {
                        self.set.set_context(
                            comm,
                            SocketCtx::new(SocketKind::Undetermined, format!("process ({comm})")),
                        );
                        debug!(socket = comm, "process connected");
                    }
                    other => panic!("unexpected event on server socket: {other:?}"),
                },
                SocketKind::Undetermined | SocketKind::Process => {
                    self.process_socket_event(event.socket, event.kind);
                }
                SocketKind::Peer => {
                    // Inter-daemon links are represented but never driven
                    panic!("peer daemon sockets are not implemented");
                }
            }
        }
    }

    fn process_socket_event(&mut self, sockid: SocketId, kind: EventKind) {
        match kind {
            EventKind::Error => {
                let name = self.ctx_name(sockid);
                self.raise(
                    Alarm::new("io-socket-error", Severity::Error)
                        .origin(self.name.clone())
                        .auto_off(true)
                        .comment(format!("error reported on socket of process '{name}'")),
                );
                self.disconnect_process(sockid);
            }
            EventKind::Disconnected => {
                self.disconnect_process(sockid);
            }
            EventKind::DataIn { data } => {
                match codec::decode(&data) {
                    Ok(msg) => {
                        // First message promotes the connection
                        if let Some(ctx) = self.set.context_mut(sockid) {
                            if ctx.kind == SocketKind::Undetermined {
                                ctx.kind = SocketKind::Process;
                            }
                        }
                        self.handle_msg(sockid, msg);
                    }
                    Err(err) => {
                        let name = self.ctx_name(sockid);
                        warn!(socket = sockid, %err, "undecodable frame from process");
                        self.raise(
                            Alarm::new("protocol-invalid-message", Severity::Error)
                                .origin(self.name.clone())
                                .auto_off(true)
                                .comment(format!("from process '{name}': {err}")),
                        );
                    }
                }
            }
            other => debug!(socket = sockid, ?other, "ignoring event on process socket"),
        }
    }

    /// Act on one decoded message from a process socket
    fn handle_msg(&mut self, sockid: SocketId, mut msg: Message) {
        // Attached alarms are absorbed wherever the message ends up going
        for alarm in msg.take_alarms() {
            self.alarms.process(alarm);
        }

        // Handshake traffic is always for the local daemon, whatever the
        // recipient says: the process does not know its domain yet
        if msg.name().starts_with(control::INIT_PREFIX) {
            self.handle_init(sockid, msg);
            return;
        }

        let msg_name = msg.name().to_string();
        if domain_of(msg.sender()).is_none() {
            self.protocol_alarm(
                "protocol-sender-has-no-domain",
                format!(
                    "message '{}' has undomained sender '{}'",
                    msg_name,
                    msg.sender()
                ),
            );
            return;
        }
        if domain_of(msg.recipient()).is_none() {
            self.protocol_alarm(
                "protocol-recipient-has-no-domain",
                format!(
                    "message '{}' has undomained recipient '{}'",
                    msg_name,
                    msg.recipient()
                ),
            );
            return;
        }

        // Every message consumes one hop entering the daemon
        if !msg.decrement_ttl() {
            self.drop_msg(msg, "ttl");
            return;
        }

        if msg.flags().contains(Flags::MULTICAST) {
            self.multicast(msg);
            return;
        }

        if self.is_for_me(msg.recipient()) {
            self.handle_local(sockid, msg);
            return;
        }

        // A paused actor must never wait forever on a recipient that no
        // longer exists: answer the xon ourselves instead of forwarding
        if msg_name == control::NTF_XON
            && domain_of(msg.recipient()) == Some(self.domain.as_str())
            && !self.registry.contains_key(msg.recipient())
        {
            debug!(recipient = msg.recipient(), "ntf-xon for dead actor, answering xon");
            let mut xon = Message::internal(control::XON, msg.recipient(), msg.sender());
            xon.add_string("origin", msg.recipient());
            self.route(xon);
            return;
        }

        self.route(msg);
    }

    /// Handshake messages (`plexus-init-*`)
    fn handle_init(&mut self, sockid: SocketId, msg: Message) {
        if msg.name() == control::INIT_MASTER_BORN {
            let Some(process_name) = msg.get_string("name") else {
                self.protocol_alarm(
                    "protocol-missing-field",
                    format!("'{}' without a 'name' field", control::INIT_MASTER_BORN),
                );
                return;
            };
            let process_name = process_name.to_string();
            if let Some(ctx) = self.set.context_mut(sockid) {
                ctx.name = process_name.clone();
            }
            info!(socket = sockid, process = %process_name, "process identified");

            let mut reply = Message::internal(
                control::INIT_DOMAIN,
                self.name.clone(),
                full_name(control::MASTER_NAME, &self.domain),
            );
            reply.add_string("domain", self.domain.clone());
            self.send_to(sockid, &reply);
        } else {
            self.protocol_alarm(
                "protocol-unknown-message",
                format!("unknown handshake message '{}'", msg.name()),
            );
        }
    }

    fn is_for_me(&self, recipient: &str) -> bool {
        recipient == self.name
            || (types::base_name(recipient) == control::DAEMON_NAME
                && domain_of(recipient) == Some(self.domain.as_str()))
    }

    /// Messages addressed to the daemon itself
    fn handle_local(&mut self, sockid: SocketId, msg: Message) {
        let sender = msg.sender().to_string();
        match msg.name() {
            control::BORN => self.register_actor(sockid, &sender),
            control::DIED => {
                if !self.registry.contains_key(&sender) {
                    self.protocol_alarm(
                        "conflict-unknown-actor",
                        format!("death notice for unknown actor '{sender}'"),
                    );
                }
                self.actor_death(&sender);
            }
            control::PING => {
                let reply = Message::internal(control::PONG, self.name.clone(), sender);
                self.route(reply);
            }
            control::SUBSCRIBE => {
                let Some(group) = msg.get_string("group") else {
                    self.protocol_alarm(
                        "protocol-missing-field",
                        format!("'{}' without a 'group' field", control::SUBSCRIBE),
                    );
                    return;
                };
                let group = full_name(group, &self.domain);
                let filter = msg.get_string("filter").unwrap_or("");
                if let Err(err) = self.groups.subscribe(&group, &sender, filter) {
                    self.protocol_alarm(
                        "protocol-invalid-filter",
                        format!("subscriber '{sender}' sent invalid filter '{filter}': {err}"),
                    );
                }
            }
            control::UNSUBSCRIBE => {
                let Some(group) = msg.get_string("group") else {
                    self.protocol_alarm(
                        "protocol-missing-field",
                        format!("'{}' without a 'group' field", control::UNSUBSCRIBE),
                    );
                    return;
                };
                let group = full_name(group, &self.domain);
                self.groups.unsubscribe(&group, &sender, msg.get_string("filter"));
            }
            control::REPORT_ALARMS => {
                let mut reply = Message::internal(control::ALARM_REPORT, self.name.clone(), sender);
                for alarm in self.alarms.snapshot() {
                    reply.attach_alarm(alarm);
                }
                reply.add_int("count", self.alarms.len() as i64);
                self.route(reply);
            }
            other => {
                self.raise(
                    Alarm::new("protocol-unknown-message", Severity::Notice)
                        .origin(self.name.clone())
                        .auto_off(true)
                        .comment(format!("unknown message '{other}' from '{sender}'")),
                );
            }
        }
    }

    fn register_actor(&mut self, sockid: SocketId, name: &str) {
        if domain_of(name) != Some(self.domain.as_str()) {
            self.protocol_alarm(
                "protocol-wrong-sender-domain",
                format!(
                    "birth notice from '{}', which is not in domain '{}'",
                    name, self.domain
                ),
            );
            return;
        }
        if self.registry.contains_key(name) {
            // Names are unique domain-wide; the second claimant loses
            self.raise(
                Alarm::new("conflict-duplicate-actor", Severity::Warning)
                    .origin(self.name.clone())
                    .auto_off(true)
                    .comment(format!("'{name}' is already registered")),
            );
            return;
        }
        self.registry.insert(name.to_string(), sockid);
        if let Some(ctx) = self.set.context_mut(sockid) {
            ctx.actors.insert(name.to_string());
        }
        debug!(actor = name, socket = sockid, "actor registered");
    }

    /// Remove an actor from the registry and from every group
    fn actor_death(&mut self, name: &str) {
        if let Some(sockid) = self.registry.remove(name) {
            if let Some(ctx) = self.set.context_mut(sockid) {
                ctx.actors.remove(name);
            }
        }
        self.groups.remove_subscriber(name);
        debug!(actor = name, "actor removed");
    }

    /// A process socket went away: every actor behind it is dead
    fn disconnect_process(&mut self, sockid: SocketId) {
        let (name, actors) = match self.set.context_mut(sockid) {
            Some(ctx) => (ctx.name.clone(), std::mem::take(&mut ctx.actors)),
            None => (String::new(), HashSet::new()),
        };
        info!(socket = sockid, process = %name, actors = actors.len(), "process disconnected");
        for actor in actors {
            self.actor_death(&actor);
        }
        self.set.destroy(sockid);
    }

    /// Fan a multicast message out to every matching subscriber
    fn multicast(&mut self, msg: Message) {
        let group = msg.recipient().to_string();
        let subscribers: Vec<String> = self
            .groups
            .matching_subscribers(&group, msg.name())
            .into_iter()
            .map(str::to_string)
            .collect();
        // No group or no match is a silent no-op: multicast never "drops"
        debug!(group = %group, n = subscribers.len(), name = msg.name(), "multicast fan-out");
        for subscriber in subscribers {
            let mut copy = msg.clone();
            copy.set_recipient(subscriber);
            self.route(copy);
        }
    }

    /// Forward a (ttl-already-decremented) message to its recipient
    fn route(&mut self, msg: Message) {
        let recipient = msg.recipient().to_string();
        match domain_of(&recipient) {
            Some(d) if d == self.domain => {
                if let Some(&sockid) = self.registry.get(&recipient) {
                    self.send_to(sockid, &msg);
                } else if recipient == self.name {
                    self.raise(
                        Alarm::new("conflict-circular-message", Severity::Warning)
                            .origin(self.name.clone())
                            .auto_off(true)
                            .comment(format!(
                                "message '{}' is addressed to this daemon by itself",
                                msg.name()
                            )),
                    );
                } else {
                    self.drop_msg(msg, "no-recipient");
                }
            }
            _ => {
                // Foreign domains need a gateway peer; federation is out
                // of scope, so this is a routing dead end
                self.drop_msg(msg, "no-route-to-domain");
            }
        }
    }

    /// Drop a message: raise the alarm, and answer the sender if it asked
    /// to be told
    fn drop_msg(&mut self, msg: Message, reason: &str) {
        self.raise(
            Alarm::new(format!("drop-{reason}"), Severity::Warning)
                .origin(self.name.clone())
                .auto_off(true)
                .comment(format!(
                    "dropped '{}' from '{}' to '{}'",
                    msg.name(),
                    msg.sender(),
                    msg.recipient()
                )),
        );

        if msg.flags().contains(Flags::NTF_DROP) {
            let mut notice =
                Message::internal(control::ERROR_DROP, self.name.clone(), msg.sender());
            notice.add_string("reason", reason);
            notice.add_string("original-marker", msg.marker());
            notice.add_string(
                "extra",
                format!("message '{}' to '{}'", msg.name(), msg.recipient()),
            );
            // The notice itself carries no drop flag, so this cannot recurse
            self.route(notice);
        }
    }

    /// Serialize and push one message down a process socket
    fn send_to(&mut self, sockid: SocketId, msg: &Message) {
        let frame = codec::encode(msg);
        match self.set.send(sockid, &frame) {
            Ok(SendOutcome::Sent) => {}
            Ok(outcome) => {
                let name = self.ctx_name(sockid);
                warn!(socket = sockid, ?outcome, "send to process failed");
                self.raise(
                    Alarm::new("io-send-fail", Severity::Error)
                        .origin(self.name.clone())
                        .auto_off(true)
                        .comment(format!("sending to process '{name}' failed: {outcome:?}")),
                );
                self.disconnect_process(sockid);
            }
            Err(err) => {
                warn!(socket = sockid, %err, "send to dead socket");
            }
        }
    }

    fn protocol_alarm(&mut self, name: &str, comment: String) {
        warn!(alarm = name, %comment, "protocol fault");
        self.raise(
            Alarm::new(name, Severity::Warning)
                .origin(self.name.clone())
                .auto_off(true)
                .comment(comment),
        );
    }

    fn raise(&mut self, alarm: Alarm) {
        self.alarms.process(alarm);
    }

    fn ctx_name(&self, sockid: SocketId) -> String {
        self.set
            .context(sockid)
            .map(|ctx| ctx.name.clone())
            .unwrap_or_default()
    }

    /// Registry accessors used by tests and embedders
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn registered_actors(&self) -> usize {
        self.registry.len()
    }
}
