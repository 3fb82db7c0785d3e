//! End-to-end tests for the router daemon
//!
//! Two styles: protocol-level tests drive the daemon with a hand-rolled
//! "fake process" speaking the wire protocol directly; runtime-level
//! tests connect real actor runtimes through the daemon.

use config::RouterConfig;
use messaging_actors::{ActorConfig, ActorContext, Flow, Runtime};
use network::{EventKind, SendOutcome, SocketId, SocketSet, SocketUrl};
use routerd::{Daemon, DaemonHandle};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use types::{control, Flags, Message};

const RECV_DEADLINE: Duration = Duration::from_secs(5);

fn start_daemon(dir: &TempDir, domain: &str) -> (SocketUrl, DaemonHandle, JoinHandle<()>) {
    let path = dir.path().join("plexusd.sock");
    let url_string = format!("unix://{}", path.display());
    let cfg = RouterConfig {
        domain: domain.to_string(),
        local_url: url_string.clone(),
        poll_tick: Duration::from_millis(5),
    };
    let daemon = Daemon::new(cfg).expect("daemon starts");
    let handle = daemon.handle();
    let join = std::thread::spawn(move || daemon.run());
    (SocketUrl::parse(&url_string).unwrap(), handle, join)
}

/// A fake process speaking the wire protocol directly
struct TestProc {
    set: SocketSet<()>,
    daemon_id: SocketId,
    domain: String,
}

impl TestProc {
    fn connect(url: &SocketUrl, process_name: &str) -> TestProc {
        let mut set: SocketSet<()> = SocketSet::new(Duration::from_millis(5));
        let daemon_id = set.create_comm(None, url, 0, (), None).expect("comm socket");
        let deadline = Instant::now() + RECV_DEADLINE;
        loop {
            if let Some(event) = set.try_poll() {
                match event.kind {
                    EventKind::Established => break,
                    EventKind::NotEstablished | EventKind::Error => panic!("cannot reach daemon"),
                    _ => {}
                }
            }
            assert!(Instant::now() < deadline, "connect timed out");
        }

        let mut proc = TestProc {
            set,
            daemon_id,
            domain: String::new(),
        };
        let mut hello = Message::internal(
            control::INIT_MASTER_BORN,
            control::MASTER_NAME,
            control::DAEMON_NAME,
        );
        hello.add_string("name", process_name);
        proc.send_msg(&hello);

        let reply = proc.recv_msg();
        assert_eq!(reply.name(), control::INIT_DOMAIN);
        proc.domain = reply.get_string("domain").expect("domain field").to_string();
        proc
    }

    fn qualified(&self, base: &str) -> String {
        format!("{base}@{}", self.domain)
    }

    fn daemon_name(&self) -> String {
        self.qualified(control::DAEMON_NAME)
    }

    fn send_msg(&mut self, msg: &Message) {
        let frame = codec::encode(msg);
        assert_eq!(
            self.set.send(self.daemon_id, &frame).expect("send"),
            SendOutcome::Sent
        );
    }

    fn recv_msg(&mut self) -> Message {
        self.try_recv(RECV_DEADLINE)
            .expect("expected a message from the daemon")
    }

    fn try_recv(&mut self, window: Duration) -> Option<Message> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(event) = self.set.try_poll() {
                match event.kind {
                    EventKind::DataIn { data } => {
                        return Some(codec::decode(&data).expect("decodable frame"))
                    }
                    EventKind::Disconnected | EventKind::Error => {
                        panic!("daemon dropped the connection")
                    }
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Announce an actor living in this fake process; returns its
    /// qualified name
    fn register(&mut self, base: &str) -> String {
        let full = self.qualified(base);
        let born = Message::internal(control::BORN, full.clone(), self.daemon_name());
        self.send_msg(&born);
        full
    }
}

#[test]
fn handshake_assigns_domain_and_ping_pongs() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "pingdom");

    let mut proc = TestProc::connect(&url, "fake-proc");
    assert_eq!(proc.domain, "pingdom");

    let watcher = proc.register("watcher");
    let ping = Message::internal(control::PING, watcher.clone(), proc.daemon_name());
    proc.send_msg(&ping);
    let pong = proc.recv_msg();
    assert_eq!(pong.name(), control::PONG);
    assert_eq!(pong.recipient(), watcher);

    handle.terminate();
    join.join().unwrap();
}

#[test]
fn ttl_exhaustion_drops_and_notifies_exactly_once() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "ttldom");

    let mut proc = TestProc::connect(&url, "fake-proc");
    let watcher = proc.register("watcher");

    let mut msg = Message::new("app-data", proc.qualified("somewhere")).with_flags(Flags::NTF_DROP);
    msg.set_sender(watcher.clone());
    msg.set_ttl(1);
    let marker = msg.marker().to_string();
    proc.send_msg(&msg);

    let notice = proc.recv_msg();
    assert_eq!(notice.name(), control::ERROR_DROP);
    assert_eq!(notice.recipient(), watcher);
    assert_eq!(notice.get_string("reason"), Some("ttl"));
    assert_eq!(notice.get_string("original-marker"), Some(marker.as_str()));

    // Exactly one notice
    assert!(proc.try_recv(Duration::from_millis(200)).is_none());

    handle.terminate();
    join.join().unwrap();
}

#[test]
fn unknown_recipient_drops_with_notice_and_alarm() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "dropdom");

    let mut proc = TestProc::connect(&url, "fake-proc");
    let watcher = proc.register("watcher");

    let mut msg = Message::new("app-data", proc.qualified("nobody")).with_flags(Flags::NTF_DROP);
    msg.set_sender(watcher.clone());
    proc.send_msg(&msg);

    let notice = proc.recv_msg();
    assert_eq!(notice.name(), control::ERROR_DROP);
    assert_eq!(notice.get_string("reason"), Some("no-recipient"));

    // The drop is operator-visible through the alarm registry
    let query = Message::internal(control::REPORT_ALARMS, watcher.clone(), proc.daemon_name());
    proc.send_msg(&query);
    let report = proc.recv_msg();
    assert_eq!(report.name(), control::ALARM_REPORT);
    assert!(report
        .alarms()
        .iter()
        .any(|alarm| alarm.name() == "drop-no-recipient"));

    handle.terminate();
    join.join().unwrap();
}

#[test]
fn ntf_xon_for_dead_actor_is_answered_immediately() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "xondom");

    let mut proc = TestProc::connect(&url, "fake-proc");
    let watcher = proc.register("watcher");
    let ghost = proc.qualified("ghost");

    let mut ntf = Message::internal(control::NTF_XON, watcher.clone(), ghost.clone());
    ntf.add_string("origin", watcher.clone());
    proc.send_msg(&ntf);

    // The daemon answers on behalf of the dead actor instead of
    // forwarding anything
    let xon = proc.recv_msg();
    assert_eq!(xon.name(), control::XON);
    assert_eq!(xon.recipient(), watcher);
    assert_eq!(xon.sender(), ghost);
    assert_eq!(xon.get_string("origin"), Some(ghost.as_str()));
    assert!(proc.try_recv(Duration::from_millis(200)).is_none());

    handle.terminate();
    join.join().unwrap();
}

#[test]
fn multicast_delivers_per_matching_filter() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "mcdom");

    let mut subs = TestProc::connect(&url, "subscribers");
    let sub_all = subs.register("sub-all");
    let sub_jobs = subs.register("sub-jobs");
    let sub_picky = subs.register("sub-picky");

    for (subscriber, filter) in [
        (&sub_all, ""),
        (&sub_jobs, "job-"),
        (&sub_picky, "re:^job-done$"),
    ] {
        let mut sub = Message::internal(
            control::SUBSCRIBE,
            subscriber.clone(),
            subs.daemon_name(),
        );
        sub.add_string("group", "events");
        sub.add_string("filter", filter);
        subs.send_msg(&sub);
    }

    let mut publisher = TestProc::connect(&url, "publisher");
    let pub_actor = publisher.register("pub");
    let group = publisher.qualified("events");

    let publish = |publisher: &mut TestProc, name: &str| {
        let mut msg = Message::new(name, group.clone()).with_flags(Flags::MULTICAST);
        msg.set_sender(pub_actor.clone());
        publisher.send_msg(&msg);
    };

    // "job-done" matches all three filters
    publish(&mut publisher, "job-done");
    let mut recipients = Vec::new();
    for _ in 0..3 {
        let msg = subs.recv_msg();
        assert_eq!(msg.name(), "job-done");
        recipients.push(msg.recipient().to_string());
    }
    assert_eq!(recipients, vec![sub_all.clone(), sub_jobs.clone(), sub_picky.clone()]);

    // "job-start" misses the regex subscriber
    publish(&mut publisher, "job-start");
    let first = subs.recv_msg();
    let second = subs.recv_msg();
    assert_eq!(first.recipient(), sub_all);
    assert_eq!(second.recipient(), sub_jobs);
    assert!(subs.try_recv(Duration::from_millis(200)).is_none());

    // "misc" matches only the catch-all
    publish(&mut publisher, "misc");
    assert_eq!(subs.recv_msg().recipient(), sub_all);
    assert!(subs.try_recv(Duration::from_millis(200)).is_none());

    // After everyone unsubscribes, the group is gone and multicast is a
    // silent no-op
    for subscriber in [&sub_all, &sub_jobs, &sub_picky] {
        let mut unsub = Message::internal(
            control::UNSUBSCRIBE,
            subscriber.clone(),
            subs.daemon_name(),
        );
        unsub.add_string("group", "events");
        subs.send_msg(&unsub);
    }
    publish(&mut publisher, "job-done");
    assert!(subs.try_recv(Duration::from_millis(300)).is_none());

    handle.terminate();
    join.join().unwrap();
}

#[test]
fn actors_ping_pong_across_processes() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "e2edom");
    let url_string = url.to_string();

    let rt_a = Runtime::connect("proc-a", &url_string).expect("runtime a connects");
    let rt_b = Runtime::connect("proc-b", &url_string).expect("runtime b connects");
    assert_eq!(rt_a.domain(), "e2edom");

    rt_a.spawn(
        ActorConfig::new("echo"),
        |ctx: &mut ActorContext, msg: Message| {
            if msg.name() == "app-ping" {
                let mut reply = Message::new("app-pong", msg.sender());
                reply.add_string("payload", msg.get_string("payload").unwrap_or(""));
                ctx.send(reply);
            }
            Flow::Continue
        },
    )
    .unwrap();

    let (tx, rx) = std::sync::mpsc::channel::<String>();
    rt_b.spawn(
        ActorConfig::new("caller"),
        move |ctx: &mut ActorContext, msg: Message| {
            match msg.name() {
                "app-kick" => {
                    let mut ping = Message::new("app-ping", "echo@e2edom");
                    ping.add_string("payload", "42");
                    ctx.send(ping);
                }
                "app-pong" => {
                    let payload = msg.get_string("payload").unwrap_or("").to_string();
                    tx.send(payload).unwrap();
                }
                _ => {}
            }
            Flow::Continue
        },
    )
    .unwrap();

    // Give the birth notices a moment to land before routing through them
    std::thread::sleep(Duration::from_millis(100));
    rt_b.send(Message::new("app-kick", "caller"));
    assert_eq!(rx.recv_timeout(RECV_DEADLINE).unwrap(), "42");

    rt_a.shutdown();
    rt_b.shutdown();
    handle.terminate();
    join.join().unwrap();
}

#[test]
fn backpressure_pauses_but_never_stalls_the_producer() {
    let dir = TempDir::new().unwrap();
    let (url, handle, join) = start_daemon(&dir, "bpdom");
    let rt = Runtime::connect("proc-bp", &url.to_string()).expect("runtime connects");

    let total = 40usize;
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

    let mut received = 0usize;
    rt.spawn(
        ActorConfig::new("sink").queue_threshold(4),
        move |_ctx: &mut ActorContext, msg: Message| {
            if msg.name() == "app-data" {
                // A deliberately slow consumer so the queue crosses its
                // threshold and xoff fires
                std::thread::sleep(Duration::from_millis(2));
                received += 1;
                if received == total {
                    done_tx.send(()).unwrap();
                }
            }
            Flow::Continue
        },
    )
    .unwrap();

    let mut sent = 0usize;
    rt.spawn(
        ActorConfig::new("pump").xoff_timeout(Duration::from_millis(25)),
        move |ctx: &mut ActorContext, msg: Message| {
            if msg.name() == "app-tick" {
                sent += 1;
                ctx.send(Message::new("app-data", "sink"));
                if sent < total {
                    // Self-tick: one send per pop iteration, so a pause
                    // actually stops the flow until xon arrives
                    ctx.send(Message::new("app-tick", "pump"));
                }
            }
            Flow::Continue
        },
    )
    .unwrap();

    rt.send(Message::new("app-tick", "pump"));

    // Bounded-rate sender + xoff/xon: everything arrives, nobody stalls
    // forever
    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("all messages should arrive despite backpressure");

    rt.shutdown();
    handle.terminate();
    join.join().unwrap();
}
