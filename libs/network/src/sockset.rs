//! The socket set: a table of heterogeneous sockets behind one poll loop
//!
//! All sockets of one owner (the router daemon, or a process's master
//! actor) live in a single [`SocketSet`]. The owner repeatedly calls
//! [`SocketSet::poll`], which yields exactly one [`Event`] per call from an
//! internal FIFO. The FIFO is refilled, when empty, by one `poll(2)`
//! multiplex call plus a scan for expired connectionless peers.
//!
//! ## fd sharing
//! A connectionless server socket and the virtual peers spawned from it
//! all reference the same file descriptor. The descriptor is closed only
//! when the last logical socket using it is destroyed.
//!
//! ## Slot reuse
//! Socket ids are indexes into an expandable slot array; a free slot is
//! reused before the array grows, so ids are recycled — exactly why stale
//! events for destroyed sockets are suppressed at delivery time.

use crate::error::{NetworkError, Result};
use crate::event::{Event, EventKind};
use crate::url::{SocketUrl, Transport};
use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, connect, getsockopt, listen, recv, recvfrom, send, sendto, setsockopt, shutdown,
    socket, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockProtocol, SockType,
    SockaddrIn, UnixAddr,
};
use nix::unistd::close;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default socket/pipe buffer size when the caller passes 0
pub const DEFAULT_BUFSIZE: usize = 64 * 1024;
/// Accepted buffer size range; out-of-range requests are a caller bug
pub const MIN_BUFSIZE: usize = 2 * 1024;
pub const MAX_BUFSIZE: usize = 16 * 1024 * 1024;
/// Default pending-connection backlog
pub const DEFAULT_BACKLOG: usize = 20;
/// Default idle timeout for connectionless peers
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Index of a socket in its set; recycled after destroy
pub type SocketId = usize;

/// Meaning of the server `extra` argument, which depends on the transport:
/// spawned-peer idle timeout for connectionless transports, accept backlog
/// otherwise. A variant that does not apply to the transport falls back to
/// the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExtra {
    Default,
    Backlog(usize),
    PeerIdleTimeout(Duration),
}

/// Outcome of a send call
///
/// Only an invalid socket id is an `Err` at the call site; transport-level
/// failures are reported here so the caller can decide to destroy the
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// All bytes accepted
    Sent,
    /// Packet socket: the packet cannot be sent atomically; nothing sent
    TooBig,
    /// Packet socket: the kernel accepted fewer bytes than requested
    Truncated,
    /// Stream socket: connection reset while sending
    ResetByPeer,
    /// Unexpected OS failure (already logged)
    Error,
}

/// Key identifying a connectionless peer by source address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PeerKey {
    Unix(UnixAddr),
    Inet(SockaddrIn),
}

/// Stored peer address for packet sends on virtual peers
#[derive(Debug, Clone)]
enum PeerAddr {
    Unix(UnixAddr),
    Inet(SockaddrIn),
}

struct SocketEntry<C> {
    fd: RawFd,
    transport: Transport,
    is_server: bool,
    from_server: bool,
    cnx_in_progress: bool,
    want_send: bool,
    bufsize: usize,
    idle_timeout: Duration,
    last_activity: Instant,
    context: Option<C>,
    /// Connectionless servers: source address → virtual peer socket id
    peers: HashMap<PeerKey, SocketId>,
    /// Virtual peers: the server that spawned us, and our map key there
    parent: Option<SocketId>,
    peer_key: Option<PeerKey>,
    peer_addr: Option<PeerAddr>,
    /// UNIX path this socket bound and must unlink on destroy
    local_path: Option<PathBuf>,
}

impl<C> SocketEntry<C> {
    fn is_connectionless(&self) -> bool {
        self.transport.is_connectionless()
    }

    fn is_stream(&self) -> bool {
        matches!(
            self.transport,
            Transport::Tcp | Transport::UnixStream | Transport::Pipe
        )
    }
}

/// A set of sockets producing one ordered event queue
pub struct SocketSet<C> {
    slots: Vec<Option<SocketEntry<C>>>,
    events: VecDeque<Event>,
    poll_tick: Duration,
}

impl<C> SocketSet<C> {
    /// Create an empty socket set
    ///
    /// `poll_tick` bounds how long one multiplex call may sleep before the
    /// connectionless-peer timeout scan runs again.
    pub fn new(poll_tick: Duration) -> SocketSet<C> {
        SocketSet {
            slots: Vec::new(),
            events: VecDeque::new(),
            poll_tick,
        }
    }

    /// Create a server socket
    ///
    /// For `pipe://` this creates the pipe pair: the returned id is the
    /// reading ("server") end and the writing end is announced through a
    /// `Connected` event.
    pub fn create_server(
        &mut self,
        url: &SocketUrl,
        bufsize: usize,
        context: C,
        extra: ServerExtra,
    ) -> Result<SocketId> {
        let bufsize = effective_bufsize(bufsize);
        if url.transport() == Transport::Pipe {
            return self.create_pipe(bufsize, context);
        }

        let fd = open_socket(url)?;
        let result = self.bind_server(fd, url, bufsize, extra);
        match result {
            Ok(prepared) => {
                let id = self.alloc_slot();
                self.slots[id] = Some(SocketEntry {
                    fd,
                    transport: url.transport(),
                    is_server: true,
                    from_server: false,
                    cnx_in_progress: false,
                    want_send: false,
                    bufsize,
                    idle_timeout: prepared,
                    last_activity: Instant::now(),
                    context: Some(context),
                    peers: HashMap::new(),
                    parent: None,
                    peer_key: None,
                    peer_addr: None,
                    local_path: url.path().map(PathBuf::from),
                });
                debug!(id, url = %url, "server socket created");
                Ok(id)
            }
            Err(err) => {
                let _ = close(fd);
                Err(err)
            }
        }
    }

    /// Create a comm socket connected (or connecting) to `remote`
    ///
    /// Connection establishment is asynchronous: the caller is told the
    /// outcome by an `Established` or `NotEstablished` event. For
    /// connectionless transports the socket carries an idle timer.
    pub fn create_comm(
        &mut self,
        local: Option<&SocketUrl>,
        remote: &SocketUrl,
        bufsize: usize,
        context: C,
        idle_timeout: Option<Duration>,
    ) -> Result<SocketId> {
        if remote.transport() == Transport::Pipe {
            return Err(NetworkError::invalid_url(
                remote.to_string(),
                "pipes are created by create_server",
            ));
        }
        let bufsize = effective_bufsize(bufsize);
        let transport = remote.transport();
        let fd = open_socket(remote)?;

        match self.prepare_comm(fd, local, remote, bufsize) {
            Ok(local_path) => {
                let id = self.alloc_slot();
                self.slots[id] = Some(SocketEntry {
                    fd,
                    transport,
                    is_server: false,
                    from_server: false,
                    cnx_in_progress: false,
                    want_send: false,
                    bufsize,
                    idle_timeout: idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
                    last_activity: Instant::now(),
                    context: Some(context),
                    peers: HashMap::new(),
                    parent: None,
                    peer_key: None,
                    peer_addr: None,
                    local_path,
                });
                self.start_connect(id, remote)?;
                debug!(id, remote = %remote, "comm socket created");
                Ok(id)
            }
            Err(err) => {
                let _ = close(fd);
                Err(err)
            }
        }
    }

    /// Wait for something to happen on the set
    ///
    /// Blocks until an event is available and returns exactly one. Events
    /// whose socket was destroyed after the event was queued are silently
    /// discarded instead of delivered.
    pub fn poll(&mut self) -> Event {
        loop {
            self.scan_idle_peers();
            while let Some(event) = self.events.pop_front() {
                if self.is_live(event.socket) {
                    return event;
                }
                trace!(socket = event.socket, "discarding stale event");
            }
            self.multiplex();
        }
    }

    /// Non-blocking poll variant: returns `None` if nothing happened
    /// within one multiplex tick
    pub fn try_poll(&mut self) -> Option<Event> {
        self.scan_idle_peers();
        if self.events.is_empty() {
            self.multiplex();
        }
        while let Some(event) = self.events.pop_front() {
            if self.is_live(event.socket) {
                return Some(event);
            }
        }
        None
    }

    /// Send data through a comm socket
    ///
    /// For stream sockets this loops until every byte is accepted or the
    /// connection is reset; a single call may therefore wait for kernel
    /// buffer space. For packet sockets exactly one underlying send is
    /// performed and truncation is reported without retry.
    pub fn send(&mut self, id: SocketId, data: &[u8]) -> Result<SendOutcome> {
        let entry = self
            .slots
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(NetworkError::InvalidSocket { id })?;
        if entry.is_server {
            return Err(NetworkError::NotCommSocket { id });
        }

        let outcome = if entry.is_stream() {
            send_stream(entry.fd, entry.transport, data)
        } else {
            send_packet(entry.fd, entry.peer_addr.as_ref(), data)
        };

        if entry.is_connectionless() {
            if let Some(entry) = self.slots.get_mut(id).and_then(Option::as_mut) {
                entry.last_activity = Instant::now();
            }
        }
        Ok(outcome)
    }

    /// Arm or disarm `CanSend` notification on a stream comm socket
    pub fn want_send(&mut self, id: SocketId, flag: bool) -> bool {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(entry)
                if !entry.is_server
                    && matches!(entry.transport, Transport::Tcp | Transport::UnixStream) =>
            {
                entry.want_send = flag;
                true
            }
            _ => false,
        }
    }

    /// Destroy a socket
    ///
    /// The file descriptor is released exactly once even when several
    /// logical sockets share it; UNIX paths bound by this set are
    /// unlinked.
    pub fn destroy(&mut self, id: SocketId) {
        let Some(entry) = self.slots.get_mut(id).and_then(Option::take) else {
            warn!(id, "destroy of unknown socket id ignored");
            return;
        };

        let mut can_close = true;
        if entry.is_connectionless() {
            // The fd may be shared between a connectionless server and its
            // virtual peers; close it only when the last user goes away.
            can_close = !self
                .slots
                .iter()
                .flatten()
                .any(|other| other.fd == entry.fd);
        }
        if can_close {
            let _ = shutdown(entry.fd, Shutdown::Both);
            let _ = close(entry.fd);
        }

        // Detach a virtual peer from its server's address map so that later
        // traffic from the same address creates a fresh peer.
        if let (Some(parent), Some(key)) = (entry.parent, entry.peer_key.as_ref()) {
            if let Some(server) = self.slots.get_mut(parent).and_then(Option::as_mut) {
                server.peers.remove(key);
            }
        }

        if entry.transport.is_unix() && !entry.from_server {
            if let Some(path) = &entry.local_path {
                let _ = std::fs::remove_file(path);
            }
        }
        debug!(id, "socket destroyed");
    }

    /// Assign a context to a socket; the previous context is dropped
    ///
    /// Mainly used to attach a context to comm sockets spawned by a server.
    pub fn set_context(&mut self, id: SocketId, context: C) -> bool {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(entry) => {
                entry.context = Some(context);
                true
            }
            None => false,
        }
    }

    pub fn context(&self, id: SocketId) -> Option<&C> {
        self.slots
            .get(id)
            .and_then(Option::as_ref)
            .and_then(|entry| entry.context.as_ref())
    }

    pub fn context_mut(&mut self, id: SocketId) -> Option<&mut C> {
        self.slots
            .get_mut(id)
            .and_then(Option::as_mut)
            .and_then(|entry| entry.context.as_mut())
    }

    /// The local address this socket is reachable at, when meaningful
    ///
    /// For TCP/UDP sockets bound to port 0 this reports the actual port.
    pub fn local_url(&self, id: SocketId) -> Option<SocketUrl> {
        let entry = self.slots.get(id).and_then(Option::as_ref)?;
        match entry.transport {
            Transport::Pipe => None,
            t if t.is_unix() => entry
                .local_path
                .as_ref()
                .map(|path| SocketUrl::from_path(t, path.clone())),
            t => {
                let sin = nix::sys::socket::getsockname::<SockaddrIn>(entry.fd).ok()?;
                Some(SocketUrl::from_addr(
                    t,
                    SocketAddr::from((sin.ip(), sin.port())),
                ))
            }
        }
    }

    /// Raw descriptor of a socket, for owners that need to hand a
    /// duplicate to another thread (e.g. a wake-up pipe). The set keeps
    /// ownership; callers must `dup` before storing.
    pub fn raw_fd(&self, id: SocketId) -> Option<RawFd> {
        self.slots.get(id).and_then(Option::as_ref).map(|e| e.fd)
    }

    pub fn is_live(&self, id: SocketId) -> bool {
        self.slots.get(id).map_or(false, Option::is_some)
    }

    // ------------------------------------------------------------------
    // internals

    fn alloc_slot(&mut self) -> SocketId {
        match self.slots.iter().position(Option::is_none) {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    fn bind_server(
        &mut self,
        fd: RawFd,
        url: &SocketUrl,
        bufsize: usize,
        extra: ServerExtra,
    ) -> Result<Duration> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        setsockopt(&bfd, sockopt::ReuseAddr, &true).expect("SO_REUSEADDR on fresh socket");

        bind_url(fd, url).map_err(|source| NetworkError::Bind {
            url: url.to_string(),
            source,
        })?;

        if url.transport().is_connectionless() {
            // Connectionless server sockets actually exchange the data for
            // every virtual peer, so the buffer sizes matter here.
            setsockopt(&bfd, sockopt::RcvBuf, &bufsize).expect("SO_RCVBUF");
            setsockopt(&bfd, sockopt::SndBuf, &bufsize).expect("SO_SNDBUF");
            let timeout = match extra {
                ServerExtra::PeerIdleTimeout(t) => t,
                _ => DEFAULT_IDLE_TIMEOUT,
            };
            Ok(timeout)
        } else {
            let backlog = match extra {
                ServerExtra::Backlog(n) if n > 0 => n,
                _ => DEFAULT_BACKLOG,
            };
            let backlog = Backlog::new(backlog as i32).unwrap_or(Backlog::MAXCONN);
            listen(&bfd, backlog).map_err(|source| NetworkError::Socket {
                url: url.to_string(),
                source,
            })?;
            Ok(DEFAULT_IDLE_TIMEOUT)
        }
    }

    /// Bind and size a client comm socket; returns the path it bound, if
    /// any
    fn prepare_comm(
        &mut self,
        fd: RawFd,
        local: Option<&SocketUrl>,
        remote: &SocketUrl,
        bufsize: usize,
    ) -> Result<Option<PathBuf>> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        setsockopt(&bfd, sockopt::ReuseAddr, &true).expect("SO_REUSEADDR on fresh socket");

        // Stream-oriented sockets connect without blocking the caller
        if !remote.transport().is_connectionless() {
            set_nonblocking(fd, true);
        }

        let mut local_path = None;
        if remote.transport().is_unix() {
            // Always bind UNIX comm sockets to a unique generated path so
            // the server side can tell datagram clients apart.
            let path = unique_unix_path();
            let addr = UnixAddr::new(&path).map_err(|source| NetworkError::Bind {
                url: remote.to_string(),
                source,
            })?;
            bind(fd, &addr).map_err(|source| NetworkError::Bind {
                url: format!("unixd://{}", path.display()),
                source,
            })?;
            local_path = Some(path);
        } else if let Some(local) = local {
            bind_url(fd, local).map_err(|source| NetworkError::Bind {
                url: local.to_string(),
                source,
            })?;
        }

        setsockopt(&bfd, sockopt::RcvBuf, &bufsize).expect("SO_RCVBUF");
        setsockopt(&bfd, sockopt::SndBuf, &bufsize).expect("SO_SNDBUF");
        Ok(local_path)
    }

    fn start_connect(&mut self, id: SocketId, remote: &SocketUrl) -> Result<()> {
        let entry = self.slots[id].as_mut().expect("socket just created");
        let fd = entry.fd;
        let result = connect_url(fd, remote);
        match result {
            Ok(()) => {
                // Immediate success; usual for UNIX and connectionless
                // sockets.
                self.events.push_back(Event::new(id, EventKind::Established));
                let entry = self.slots[id].as_mut().expect("socket just created");
                if !entry.is_connectionless() {
                    set_nonblocking(fd, false);
                }
            }
            Err(Errno::ECONNREFUSED) => {
                // Immediate refusal happens for UNIX sockets when the path
                // exists but nobody is listening.
                self.events
                    .push_back(Event::new(id, EventKind::NotEstablished));
            }
            Err(Errno::EINPROGRESS) => {
                self.slots[id].as_mut().expect("socket just created").cnx_in_progress = true;
            }
            Err(source) => {
                self.destroy(id);
                return Err(NetworkError::Connect {
                    url: remote.to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    fn create_pipe(&mut self, bufsize: usize, context: C) -> Result<SocketId> {
        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|source| NetworkError::Pipe { source })?;
        let read_fd = read_end.into_raw_fd();
        let write_fd = write_end.into_raw_fd();

        set_nonblocking(read_fd, true);
        // Best effort: the kernel may cap the pipe buffer below our ask
        if let Err(err) = fcntl(write_fd, FcntlArg::F_SETPIPE_SZ(bufsize as i32)) {
            debug!(%err, bufsize, "could not resize pipe buffer");
        }

        let server_id = self.alloc_slot();
        self.slots[server_id] = Some(SocketEntry {
            fd: read_fd,
            transport: Transport::Pipe,
            is_server: true,
            from_server: false,
            cnx_in_progress: false,
            want_send: false,
            bufsize,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_activity: Instant::now(),
            context: Some(context),
            peers: HashMap::new(),
            parent: None,
            peer_key: None,
            peer_addr: None,
            local_path: None,
        });

        // The writing end is announced as a spawned comm socket
        self.spawn_comm(server_id, write_fd, None);
        Ok(server_id)
    }

    /// Register a comm socket spawned by `server_id` and queue the
    /// `Connected` event
    fn spawn_comm(
        &mut self,
        server_id: SocketId,
        fd: RawFd,
        peer: Option<(PeerKey, PeerAddr)>,
    ) -> SocketId {
        let server = self.slots[server_id].as_ref().expect("live server socket");
        let transport = server.transport;
        let bufsize = server.bufsize;
        let idle_timeout = server.idle_timeout;
        let (peer_key, peer_addr) = match peer {
            Some((key, addr)) => (Some(key), Some(addr)),
            None => (None, None),
        };
        let is_cnxless = transport.is_connectionless();

        if !is_cnxless && transport != Transport::Pipe {
            // Freshly accepted stream/seqpacket fd: size its buffers.
            // Virtual peers share the server fd, already sized.
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            setsockopt(&bfd, sockopt::RcvBuf, &bufsize).expect("SO_RCVBUF");
            setsockopt(&bfd, sockopt::SndBuf, &bufsize).expect("SO_SNDBUF");
        }

        let id = self.alloc_slot();
        self.slots[id] = Some(SocketEntry {
            fd,
            transport,
            is_server: false,
            from_server: true,
            cnx_in_progress: false,
            want_send: false,
            bufsize,
            idle_timeout,
            last_activity: Instant::now(),
            context: None,
            peers: HashMap::new(),
            parent: if is_cnxless { Some(server_id) } else { None },
            peer_key,
            peer_addr,
            local_path: None,
        });

        self.events
            .push_back(Event::new(server_id, EventKind::Connected { comm: id }));
        id
    }

    /// Emit `Disconnected` for connectionless comm sockets that have been
    /// idle for longer than their timeout
    fn scan_idle_peers(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (id, entry) in self.slots.iter_mut().enumerate() {
            let Some(entry) = entry else { continue };
            if !entry.is_server
                && entry.is_connectionless()
                && now.duration_since(entry.last_activity) > entry.idle_timeout
            {
                expired.push(id);
                // Re-arm so the owner is not flooded with repeats if it
                // chooses to keep the socket
                entry.last_activity = now;
            }
        }
        for id in expired {
            self.events.push_back(Event::new(id, EventKind::Disconnected));
        }
    }

    /// One multiplex call over every live descriptor; queues the resulting
    /// events. May time out without queueing anything — intentional, so
    /// the idle scan runs again.
    fn multiplex(&mut self) {
        let mut ids = Vec::new();
        let mut fds = Vec::new();
        for (id, entry) in self.slots.iter().enumerate() {
            let Some(entry) = entry else { continue };
            // Virtual peers share their server's fd; polling the server
            // covers them.
            if entry.is_connectionless() && entry.from_server {
                continue;
            }
            let mut flags = PollFlags::POLLIN;
            if entry.want_send || entry.cnx_in_progress {
                // A pending non-blocking connect reports its outcome as a
                // write event
                flags |= PollFlags::POLLOUT;
            }
            ids.push(id);
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(entry.fd) },
                flags,
            ));
        }

        let timeout_ms = self.poll_tick.as_millis().min(u16::MAX as u128) as u16;
        let ready = match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(n) => n,
            Err(Errno::EINTR) => return, // behave like a timeout
            Err(err) => panic!("poll(2) failed: {err}"),
        };
        if ready == 0 {
            return;
        }

        let triggered: Vec<(SocketId, PollFlags)> = ids
            .iter()
            .zip(fds.iter())
            .filter_map(|(&id, fd)| fd.revents().map(|r| (id, r)))
            .filter(|(_, r)| !r.is_empty())
            .collect();
        drop(fds);

        for (id, revents) in triggered {
            if !self.is_live(id) {
                continue;
            }
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                self.handle_readable(id);
            }
            if revents.contains(PollFlags::POLLOUT) {
                self.handle_writable(id);
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                self.events.push_back(Event::new(id, EventKind::Error));
            }
        }
    }

    fn handle_readable(&mut self, id: SocketId) {
        let entry = self.slots[id].as_ref().expect("checked live");
        let (fd, transport, is_server, bufsize, is_stream) = (
            entry.fd,
            entry.transport,
            entry.is_server,
            entry.bufsize,
            entry.is_stream(),
        );

        if is_server {
            match transport {
                t if t.is_connectionless() => self.read_cnxless_server(id, fd, transport, bufsize),
                Transport::Pipe => {
                    if let Some(data) = self.read_stream(id, fd, transport, bufsize) {
                        self.events.push_back(Event::new(id, EventKind::DataIn { data }));
                    }
                }
                _ => self.accept_connection(id, fd),
            }
        } else if is_stream {
            if let Some(data) = self.read_stream(id, fd, transport, bufsize) {
                self.events.push_back(Event::new(id, EventKind::DataIn { data }));
            }
        } else {
            // Packet-based comm socket (seqpacket, or a connected
            // client-side datagram socket)
            if let Some(data) = self.read_packet(id, fd, bufsize) {
                if let Some(entry) = self.slots.get_mut(id).and_then(Option::as_mut) {
                    entry.last_activity = Instant::now();
                }
                self.events.push_back(Event::new(id, EventKind::DataIn { data }));
            }
        }
    }

    fn handle_writable(&mut self, id: SocketId) {
        let entry = self.slots[id].as_mut().expect("checked live");
        if entry.cnx_in_progress {
            // The pending connect finished; ask the kernel how it went
            entry.cnx_in_progress = false;
            let fd = entry.fd;
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            let err = getsockopt(&bfd, sockopt::SocketError).unwrap_or(libc_einval());
            if err == 0 {
                set_nonblocking(fd, false);
                self.events.push_back(Event::new(id, EventKind::Established));
            } else {
                self.events
                    .push_back(Event::new(id, EventKind::NotEstablished));
            }
        } else {
            self.events.push_back(Event::new(id, EventKind::CanSend));
        }
    }

    fn accept_connection(&mut self, server_id: SocketId, fd: RawFd) {
        match accept(fd) {
            Ok(comm_fd) => {
                self.spawn_comm(server_id, comm_fd, None);
            }
            Err(Errno::EINTR) => {}
            Err(err) => warn!(server_id, %err, "accept failed"),
        }
    }

    /// Datagram arrived on a connectionless server: route it to the
    /// virtual peer for its source address, creating the peer on first
    /// contact
    fn read_cnxless_server(
        &mut self,
        server_id: SocketId,
        fd: RawFd,
        transport: Transport,
        bufsize: usize,
    ) {
        let mut buf = vec![0u8; bufsize];
        let received = if transport.is_unix() {
            recvfrom::<UnixAddr>(fd, &mut buf).map(|(n, addr)| {
                (n, addr.map(|a| (PeerKey::Unix(a.clone()), PeerAddr::Unix(a))))
            })
        } else {
            recvfrom::<SockaddrIn>(fd, &mut buf).map(|(n, addr)| {
                (n, addr.map(|a| (PeerKey::Inet(a), PeerAddr::Inet(a))))
            })
        };

        let (n, peer) = match received {
            Ok(result) => result,
            Err(Errno::EINTR) => return,
            Err(err) => {
                warn!(server_id, %err, "recvfrom failed");
                self.events.push_back(Event::new(server_id, EventKind::Error));
                return;
            }
        };
        // Empty datagrams are assumed never to be sent; an empty read means
        // the peer closed (seqpacket semantics)
        if n == 0 {
            self.events
                .push_back(Event::new(server_id, EventKind::Disconnected));
            return;
        }
        let Some((key, addr)) = peer else {
            warn!(server_id, "datagram without source address dropped");
            return;
        };

        buf.truncate(n);
        let data = Bytes::from(buf);

        let comm_id = match self.slots[server_id]
            .as_ref()
            .expect("checked live")
            .peers
            .get(&key)
        {
            Some(&comm_id) => comm_id,
            None => {
                // First datagram from this address: emulate a connection
                let comm_id = self.spawn_comm(server_id, fd, Some((key.clone(), addr)));
                self.slots[server_id]
                    .as_mut()
                    .expect("checked live")
                    .peers
                    .insert(key, comm_id);
                comm_id
            }
        };

        if let Some(peer_entry) = self.slots.get_mut(comm_id).and_then(Option::as_mut) {
            peer_entry.last_activity = Instant::now();
        }
        self.events
            .push_back(Event::new(comm_id, EventKind::DataIn { data }));
    }

    /// Drain up to `bufsize` bytes from a stream socket or pipe; queues
    /// `Disconnected` on EOF-with-nothing-read
    fn read_stream(
        &mut self,
        id: SocketId,
        fd: RawFd,
        transport: Transport,
        bufsize: usize,
    ) -> Option<Bytes> {
        let mut buf = vec![0u8; bufsize];
        let mut read_so_far = 0usize;
        loop {
            if read_so_far >= bufsize {
                break;
            }
            let result = if transport == Transport::Pipe {
                // Read end is O_NONBLOCK
                read_fd(fd, &mut buf[read_so_far..])
            } else {
                // Per-call non-blocking read on an otherwise blocking fd
                recv(fd, &mut buf[read_so_far..], MsgFlags::MSG_DONTWAIT)
            };
            match result {
                Ok(0) => {
                    if read_so_far == 0 {
                        self.events.push_back(Event::new(id, EventKind::Disconnected));
                    }
                    break;
                }
                Ok(n) => read_so_far += n,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => {
                    if read_so_far == 0 {
                        self.events.push_back(Event::new(id, EventKind::Disconnected));
                    }
                    break;
                }
                Err(err) => {
                    warn!(id, %err, "stream read failed");
                    self.events.push_back(Event::new(id, EventKind::Error));
                    break;
                }
            }
        }

        if read_so_far == 0 {
            return None;
        }
        buf.truncate(read_so_far);
        Some(Bytes::from(buf))
    }

    /// Read one packet from a connected packet socket
    fn read_packet(&mut self, id: SocketId, fd: RawFd, bufsize: usize) -> Option<Bytes> {
        let mut buf = vec![0u8; bufsize];
        loop {
            match recv(fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => {
                    self.events.push_back(Event::new(id, EventKind::Disconnected));
                    return None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Bytes::from(buf));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => {
                    self.events.push_back(Event::new(id, EventKind::Disconnected));
                    return None;
                }
                Err(err) => {
                    warn!(id, %err, "packet read failed");
                    self.events.push_back(Event::new(id, EventKind::Error));
                    return None;
                }
            }
        }
    }
}

impl<C> Drop for SocketSet<C> {
    fn drop(&mut self) {
        for id in 0..self.slots.len() {
            if self.is_live(id) {
                self.destroy(id);
            }
        }
    }
}

// ----------------------------------------------------------------------
// free helpers

fn effective_bufsize(bufsize: usize) -> usize {
    let bufsize = if bufsize == 0 { DEFAULT_BUFSIZE } else { bufsize };
    assert!(
        (MIN_BUFSIZE..=MAX_BUFSIZE).contains(&bufsize),
        "socket buffer size {bufsize} out of range"
    );
    bufsize
}

fn open_socket(url: &SocketUrl) -> Result<RawFd> {
    let (family, ty, protocol) = match url.transport() {
        Transport::UnixSeq => (AddressFamily::Unix, SockType::SeqPacket, None),
        Transport::UnixStream => (AddressFamily::Unix, SockType::Stream, None),
        Transport::UnixDgram => (AddressFamily::Unix, SockType::Datagram, None),
        Transport::Tcp => (
            AddressFamily::Inet,
            SockType::Stream,
            Some(SockProtocol::Tcp),
        ),
        Transport::Udp => (
            AddressFamily::Inet,
            SockType::Datagram,
            Some(SockProtocol::Udp),
        ),
        Transport::Pipe => unreachable!("pipes do not go through socket(2)"),
    };
    let fd = socket(family, ty, SockFlag::empty(), protocol).map_err(|source| {
        NetworkError::Socket {
            url: url.to_string(),
            source,
        }
    })?;
    Ok(fd.into_raw_fd())
}

fn bind_url(fd: RawFd, url: &SocketUrl) -> std::result::Result<(), Errno> {
    if url.transport().is_unix() {
        let path = url.path().expect("unix URL always has a path");
        let addr = UnixAddr::new(path)?;
        bind(fd, &addr)
    } else {
        let addr = inet_addr(url);
        bind(fd, &addr)
    }
}

fn connect_url(fd: RawFd, url: &SocketUrl) -> std::result::Result<(), Errno> {
    if url.transport().is_unix() {
        let path = url.path().expect("unix URL always has a path");
        let addr = UnixAddr::new(path)?;
        connect(fd, &addr)
    } else {
        let addr = inet_addr(url);
        connect(fd, &addr)
    }
}

fn inet_addr(url: &SocketUrl) -> SockaddrIn {
    match url.addr().expect("inet URL always has an address") {
        SocketAddr::V4(v4) => SockaddrIn::from(v4),
        SocketAddr::V6(_) => unreachable!("URLs resolve to IPv4 only"),
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) {
    let flags = fcntl(fd, FcntlArg::F_GETFL).expect("F_GETFL");
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).expect("F_SETFL");
}

/// `read(2)` on a descriptor the socket table owns (pipe read ends)
fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
    use std::io::Read;
    use std::os::fd::FromRawFd;
    // The fd stays owned by the socket table; ManuallyDrop prevents the
    // temporary File from closing it.
    let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    file.read(buf)
        .map_err(|err| Errno::from_raw(err.raw_os_error().unwrap_or(0)))
}

/// `write(2)` on a descriptor the socket table owns (pipe write ends)
fn write_fd(fd: RawFd, buf: &[u8]) -> std::result::Result<usize, Errno> {
    use std::io::Write;
    use std::os::fd::FromRawFd;
    let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    file.write(buf)
        .map_err(|err| Errno::from_raw(err.raw_os_error().unwrap_or(0)))
}

fn send_stream(fd: RawFd, transport: Transport, data: &[u8]) -> SendOutcome {
    let mut sent = 0usize;
    while sent < data.len() {
        let result = if transport == Transport::Pipe {
            write_fd(fd, &data[sent..])
        } else {
            // MSG_NOSIGNAL: a closed peer must not raise SIGPIPE
            send(fd, &data[sent..], MsgFlags::MSG_NOSIGNAL)
        };
        match result {
            Ok(0) => return SendOutcome::ResetByPeer,
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => return SendOutcome::ResetByPeer,
            Err(err) => {
                warn!(%err, "stream send failed");
                return SendOutcome::Error;
            }
        }
    }
    SendOutcome::Sent
}

fn send_packet(fd: RawFd, peer: Option<&PeerAddr>, data: &[u8]) -> SendOutcome {
    loop {
        let result = match peer {
            // Virtual peers share an unconnected server fd and must
            // address every packet explicitly
            Some(PeerAddr::Unix(addr)) => sendto(fd, data, addr, MsgFlags::MSG_NOSIGNAL),
            Some(PeerAddr::Inet(addr)) => sendto(fd, data, addr, MsgFlags::MSG_NOSIGNAL),
            None => send(fd, data, MsgFlags::MSG_NOSIGNAL),
        };
        match result {
            Ok(0) => panic!("unexpected empty send"),
            Ok(n) if n < data.len() => return SendOutcome::Truncated,
            Ok(_) => return SendOutcome::Sent,
            Err(Errno::EINTR) => continue,
            Err(Errno::EMSGSIZE) => return SendOutcome::TooBig,
            Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => return SendOutcome::ResetByPeer,
            Err(err) => {
                warn!(%err, "packet send failed");
                return SendOutcome::Error;
            }
        }
    }
}

fn unique_unix_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "plexus-{}-{:08x}.sock",
        std::process::id(),
        rand::random::<u32>()
    ))
}

fn libc_einval() -> i32 {
    Errno::EINVAL as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip_delivers_exactly_the_written_bytes() {
        let mut set: SocketSet<()> = SocketSet::new(Duration::from_millis(10));
        let pipe_url = SocketUrl::parse("pipe://").unwrap();
        let read_id = set
            .create_server(&pipe_url, 0, (), ServerExtra::Default)
            .unwrap();

        // The writing end is announced through a Connected event
        let event = set.poll();
        assert_eq!(event.socket, read_id);
        let write_id = match event.kind {
            EventKind::Connected { comm } => comm,
            other => panic!("expected Connected, got {other:?}"),
        };

        let payload = b"one small message".to_vec();
        assert_eq!(set.send(write_id, &payload).unwrap(), SendOutcome::Sent);

        let event = set.poll();
        assert_eq!(event.socket, read_id);
        match event.kind {
            EventKind::DataIn { data } => assert_eq!(&data[..], &payload[..]),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn slots_are_reused_before_growing() {
        let mut set: SocketSet<()> = SocketSet::new(Duration::from_millis(10));
        let pipe_url = SocketUrl::parse("pipe://").unwrap();
        let a = set
            .create_server(&pipe_url, 0, (), ServerExtra::Default)
            .unwrap();
        let event = set.poll();
        let a_comm = match event.kind {
            EventKind::Connected { comm } => comm,
            other => panic!("unexpected {other:?}"),
        };
        set.destroy(a_comm);
        set.destroy(a);

        let b = set
            .create_server(&pipe_url, 0, (), ServerExtra::Default)
            .unwrap();
        assert_eq!(b, a.min(a_comm));
    }

    #[test]
    fn stale_events_are_suppressed() {
        let mut set: SocketSet<()> = SocketSet::new(Duration::from_millis(10));
        let pipe_url = SocketUrl::parse("pipe://").unwrap();
        let read_id = set
            .create_server(&pipe_url, 0, (), ServerExtra::Default)
            .unwrap();
        // Destroy the server before draining its Connected event; poll must
        // not deliver it. try_poll on the otherwise empty set returns None.
        set.destroy(read_id);
        assert!(set.try_poll().is_none());
    }

    #[test]
    fn send_on_server_socket_is_rejected() {
        let mut set: SocketSet<()> = SocketSet::new(Duration::from_millis(10));
        let pipe_url = SocketUrl::parse("pipe://").unwrap();
        let read_id = set
            .create_server(&pipe_url, 0, (), ServerExtra::Default)
            .unwrap();
        assert!(matches!(
            set.send(read_id, b"x"),
            Err(NetworkError::NotCommSocket { .. })
        ));
        assert!(matches!(
            set.send(999, b"x"),
            Err(NetworkError::InvalidSocket { .. })
        ));
    }

    #[test]
    fn contexts_follow_the_socket() {
        let mut set: SocketSet<&'static str> = SocketSet::new(Duration::from_millis(10));
        let pipe_url = SocketUrl::parse("pipe://").unwrap();
        let read_id = set
            .create_server(&pipe_url, 0, "reader", ServerExtra::Default)
            .unwrap();
        assert_eq!(set.context(read_id), Some(&"reader"));
        let event = set.poll();
        let write_id = match event.kind {
            EventKind::Connected { comm } => comm,
            other => panic!("unexpected {other:?}"),
        };
        assert!(set.context(write_id).is_none());
        assert!(set.set_context(write_id, "writer"));
        assert_eq!(set.context(write_id), Some(&"writer"));
        set.destroy(write_id);
        assert!(set.context(write_id).is_none());
    }
}
