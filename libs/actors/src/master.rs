//! The master actor
//!
//! One per process. It owns the process's socket set — a seqpacket
//! connection to the local router daemon plus a wake-up pipe — and that
//! poll is the only blocking point in the bridge: messages pushed onto the
//! master queue by other threads tickle the pipe, inbound daemon traffic
//! arrives on the socket, and both funnel through the same loop.
//!
//! The master does not participate in the xoff/xon protocol; pausing the
//! bridge would stall the whole process.

use crate::queue::MessageQueue;
use crate::runtime::RuntimeInner;
use network::{EventKind, ServerExtra, SocketId, SocketSet, SocketUrl};
use nix::errno::Errno;
use nix::unistd::dup;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{base_name, control, Flags, Message};

/// What each socket in the master's set is for
enum MasterSock {
    Daemon,
    WakeRead,
    WakeWrite,
}

pub(crate) fn run(inner: Arc<RuntimeInner>, daemon_url: SocketUrl) {
    let mut set: SocketSet<MasterSock> = SocketSet::new(config::POLL_TICK);

    let daemon_id = match set.create_comm(None, &daemon_url, 0, MasterSock::Daemon, None) {
        Ok(id) => id,
        Err(err) => {
            fail_init(&inner, format!("router daemon unreachable: {err}"));
            return;
        }
    };

    // The connection result arrives asynchronously
    loop {
        let event = set.poll();
        match event.kind {
            EventKind::Established if event.socket == daemon_id => break,
            EventKind::NotEstablished | EventKind::Error if event.socket == daemon_id => {
                fail_init(&inner, "router daemon unreachable".to_string());
                return;
            }
            other => debug!(?other, "ignoring event while connecting"),
        }
    }

    // Wake-up pipe: pushes onto the master queue write one byte so the
    // poll loop notices
    let pipe_url = SocketUrl::parse("pipe://").expect("pipe URL");
    let wake_read = set
        .create_server(&pipe_url, 0, MasterSock::WakeRead, ServerExtra::Default)
        .expect("creating master wake pipe");
    let wake_write = loop {
        let event = set.poll();
        if let EventKind::Connected { comm } = event.kind {
            break comm;
        }
    };
    set.set_context(wake_write, MasterSock::WakeWrite);

    // Other threads write through duplicated descriptors: the daemon fd
    // for outbound messages, the pipe fd for wake-ups. The set keeps the
    // originals.
    let daemon_fd = dup_raw(set.raw_fd(daemon_id).expect("daemon socket fd"));
    inner.daemon_link.attach(daemon_fd);
    let wake_fd = dup_raw(set.raw_fd(wake_write).expect("wake pipe fd"));
    inner.master_queue.set_push_hook(Box::new(move || {
        poke(&wake_fd);
    }));

    if let Err(reason) = handshake(&inner, &mut set, daemon_id) {
        fail_init(&inner, reason);
        return;
    }

    // Startup complete; unblock Runtime::connect
    inner.global_queue.push(Message::internal(
        control::MASTER_INIT_DONE,
        control::MASTER_NAME,
        inner.process_name.clone(),
    ));
    info!(domain = %inner.domain(), "master actor connected to router daemon");

    let mut stop = false;
    while !stop {
        let event = set.poll();
        match set.context(event.socket) {
            Some(MasterSock::Daemon) => match event.kind {
                EventKind::DataIn { data } => match codec::decode(&data) {
                    Ok(msg) => route_inbound(&inner, msg),
                    Err(err) => {
                        // Protocol fault: drop the frame, keep the
                        // connection
                        warn!(%err, "undecodable message from router daemon dropped");
                    }
                },
                EventKind::Disconnected | EventKind::Error => {
                    // Without the daemon this process is unroutable;
                    // continuing would silently strand every actor
                    panic!("router daemon connection lost");
                }
                other => debug!(?other, "ignoring daemon socket event"),
            },
            Some(MasterSock::WakeRead) => {
                if matches!(event.kind, EventKind::DataIn { .. }) {
                    while let Some(msg) = inner.master_queue.try_pop(false) {
                        if !process_master_msg(&inner, msg) {
                            stop = true;
                        }
                    }
                }
            }
            Some(MasterSock::WakeWrite) => {
                warn!(?event.kind, "unexpected event on wake pipe write end")
            }
            None => {}
        }
    }

    inner.global_queue.push(Message::internal(
        control::MASTER_TERMINATED,
        control::MASTER_NAME,
        inner.process_name.clone(),
    ));
    debug!("master actor stopped");
}

/// Identify ourselves to the daemon and learn our routing domain
fn handshake(
    inner: &Arc<RuntimeInner>,
    set: &mut SocketSet<MasterSock>,
    daemon_id: SocketId,
) -> Result<(), String> {
    let mut hello = Message::internal(
        control::INIT_MASTER_BORN,
        control::MASTER_NAME,
        control::DAEMON_NAME,
    );
    hello.add_string("name", inner.process_name.clone());
    let frame = codec::encode(&hello);
    match set.send(daemon_id, &frame) {
        Ok(network::SendOutcome::Sent) => {}
        other => return Err(format!("sending hello failed: {other:?}")),
    }

    loop {
        let event = set.poll();
        if event.socket != daemon_id {
            continue;
        }
        match event.kind {
            EventKind::DataIn { data } => {
                let msg = codec::decode(&data)
                    .map_err(|err| format!("undecodable handshake reply: {err}"))?;
                if msg.name() != control::INIT_DOMAIN {
                    return Err(format!("expected '{}', got '{}'", control::INIT_DOMAIN, msg.name()));
                }
                let domain = msg
                    .get_string("domain")
                    .ok_or_else(|| "domain reply without domain field".to_string())?;
                *inner.domain.write() = domain.to_string();
                return Ok(());
            }
            EventKind::Disconnected | EventKind::Error => {
                return Err("daemon dropped the connection during handshake".to_string());
            }
            other => debug!(?other, "ignoring event during handshake"),
        }
    }
}

/// A message routed to this process by the local daemon
fn route_inbound(inner: &Arc<RuntimeInner>, msg: Message) {
    let base = base_name(msg.recipient()).to_string();
    if base == control::MASTER_NAME {
        debug!(name = msg.name(), "dropping daemon message addressed to master");
        return;
    }
    match inner.actors.get(&base) {
        Some(handle) => {
            // Remote senders are managed by their own process, so the
            // backpressure trigger applies to them too
            inner.deliver_local(&handle, msg, true);
        }
        None => {
            // The recipient died (or never existed) and the sending side
            // has not heard yet
            debug!(recipient = msg.recipient(), "inbound message for unknown actor");
            if msg.flags().contains(Flags::NTF_DROP) {
                let mut notice = Message::internal(
                    control::ERROR_DROP,
                    msg.recipient(),
                    msg.sender(),
                );
                notice.add_string("reason", "no-recipient");
                notice.add_string("original-marker", msg.marker());
                notice.add_string(
                    "extra",
                    format!("actor '{}' does not exist", msg.recipient()),
                );
                inner.daemon_link.send(&notice);
            }
        }
    }
}

/// A message pushed onto the master queue from inside this process;
/// returns `false` when the master must stop
fn process_master_msg(inner: &Arc<RuntimeInner>, msg: Message) -> bool {
    match msg.name() {
        control::MASTER_TERMINATE => {
            if inner.actors.is_empty() {
                return false;
            }
            // Cascade: every actor is asked to finish; the master exits
            // once the last one reports back
            for entry in inner.actors.iter() {
                entry.value().queue.push(Message::internal(
                    control::TERMINATE,
                    control::MASTER_NAME,
                    entry.key().clone(),
                ));
            }
            true
        }
        control::TERMINATED => {
            let base = base_name(msg.sender()).to_string();
            if let Some((_, handle)) = inner.actors.remove(&base) {
                if let Some(join) = handle.join.lock().take() {
                    let _ = join.join();
                }
            }
            !inner.actors.is_empty()
                || !inner
                    .terminating
                    .load(std::sync::atomic::Ordering::SeqCst)
        }
        other => {
            debug!(name = other, "unhandled message on master queue");
            true
        }
    }
}

fn fail_init(inner: &Arc<RuntimeInner>, reason: String) {
    warn!(%reason, "master actor startup failed");
    let mut msg = Message::internal(
        control::MASTER_INIT_DONE,
        control::MASTER_NAME,
        inner.process_name.clone(),
    );
    msg.add_string("error", reason);
    inner.global_queue.push(msg);
}

fn dup_raw(fd: std::os::fd::RawFd) -> OwnedFd {
    let duped = dup(fd).expect("dup of master descriptor");
    // dup returns a RawFd we now own
    unsafe { OwnedFd::from_raw_fd(duped) }
}

/// Write one byte down the wake pipe; the payload is irrelevant
fn poke(fd: &OwnedFd) {
    loop {
        match nix::unistd::write(fd.as_fd(), b"x") {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!(%err, "master wake-up failed");
                return;
            }
        }
    }
}
