//! End-to-end tests for the socket event layer
//!
//! These drive two `SocketSet`s against each other over real sockets in a
//! temporary directory.

use network::{EventKind, SendOutcome, ServerExtra, SocketSet, SocketUrl};
use std::time::Duration;
use tempfile::tempdir;

const TICK: Duration = Duration::from_millis(10);

/// Poll until the predicate accepts an event, with a generous deadline
fn poll_until<C>(
    set: &mut SocketSet<C>,
    deadline: Duration,
    mut pred: impl FnMut(&network::Event) -> bool,
) -> network::Event {
    let start = std::time::Instant::now();
    loop {
        if let Some(event) = set.try_poll() {
            if pred(&event) {
                return event;
            }
            continue;
        }
        if start.elapsed() > deadline {
            panic!("no matching event within {deadline:?}");
        }
    }
}

#[test]
fn seqpacket_connect_and_exchange() {
    let dir = tempdir().unwrap();
    let url = SocketUrl::parse(&format!("unix://{}/seq.sock", dir.path().display())).unwrap();

    let mut server: SocketSet<&str> = SocketSet::new(TICK);
    let server_id = server
        .create_server(&url, 0, "server", ServerExtra::Default)
        .unwrap();

    let mut client: SocketSet<&str> = SocketSet::new(TICK);
    let client_id = client
        .create_comm(None, &url, 0, "client", None)
        .unwrap();

    // Client learns the connection is up
    let established = poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Established)
    });
    assert_eq!(established.socket, client_id);

    // Server accepts and reports the spawned comm socket
    let connected = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Connected { .. })
    });
    assert_eq!(connected.socket, server_id);
    let peer_id = match connected.kind {
        EventKind::Connected { comm } => comm,
        _ => unreachable!(),
    };

    // Packets keep their boundaries in both directions
    assert_eq!(client.send(client_id, b"hello").unwrap(), SendOutcome::Sent);
    let data_in = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(data_in.socket, peer_id);
    assert_eq!(&data_in.data().unwrap()[..], b"hello");

    assert_eq!(server.send(peer_id, b"hi back").unwrap(), SendOutcome::Sent);
    let reply = poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(&reply.data().unwrap()[..], b"hi back");

    // Tearing the client down surfaces a disconnect on the server side
    client.destroy(client_id);
    let gone = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Disconnected)
    });
    assert_eq!(gone.socket, peer_id);
}

#[test]
fn connect_to_missing_path_is_not_established() {
    let dir = tempdir().unwrap();
    let url = SocketUrl::parse(&format!("unix://{}/nobody.sock", dir.path().display())).unwrap();

    let mut client: SocketSet<()> = SocketSet::new(TICK);
    let client_id = client.create_comm(None, &url, 0, (), None).unwrap();
    let outcome = poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Established | EventKind::NotEstablished)
    });
    assert_eq!(outcome.socket, client_id);
    assert!(matches!(outcome.kind, EventKind::NotEstablished));
}

#[test]
fn datagrams_from_one_address_share_one_virtual_peer() {
    let dir = tempdir().unwrap();
    let url = SocketUrl::parse(&format!("unixd://{}/dgram.sock", dir.path().display())).unwrap();

    let mut server: SocketSet<&str> = SocketSet::new(TICK);
    let server_id = server
        .create_server(
            &url,
            0,
            "server",
            ServerExtra::PeerIdleTimeout(Duration::from_secs(30)),
        )
        .unwrap();

    let mut client: SocketSet<&str> = SocketSet::new(TICK);
    let client_id = client.create_comm(None, &url, 0, "client", None).unwrap();
    poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Established)
    });

    client.send(client_id, b"first").unwrap();

    // First datagram from a new address: exactly one emulated connection,
    // then the data on the synthetic comm socket
    let connected = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Connected { .. })
    });
    assert_eq!(connected.socket, server_id);
    let peer_id = match connected.kind {
        EventKind::Connected { comm } => comm,
        _ => unreachable!(),
    };
    let first = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(first.socket, peer_id);
    assert_eq!(&first.data().unwrap()[..], b"first");

    // Second datagram from the same address: same synthetic id, no new
    // connection event
    client.send(client_id, b"second").unwrap();
    let second = poll_until(&mut server, Duration::from_secs(2), |e| {
        assert!(
            !matches!(e.kind, EventKind::Connected { .. }),
            "second datagram must not create a new peer"
        );
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(second.socket, peer_id);
    assert_eq!(&second.data().unwrap()[..], b"second");

    // The server can answer through the virtual peer
    assert_eq!(server.send(peer_id, b"ack").unwrap(), SendOutcome::Sent);
    let ack = poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(&ack.data().unwrap()[..], b"ack");
}

#[test]
fn idle_virtual_peer_disconnects_then_reconnects_fresh() {
    let dir = tempdir().unwrap();
    let url = SocketUrl::parse(&format!("unixd://{}/idle.sock", dir.path().display())).unwrap();

    let mut server: SocketSet<()> = SocketSet::new(TICK);
    server
        .create_server(
            &url,
            0,
            (),
            ServerExtra::PeerIdleTimeout(Duration::from_millis(50)),
        )
        .unwrap();

    let mut client: SocketSet<()> = SocketSet::new(TICK);
    let client_id = client.create_comm(None, &url, 0, (), None).unwrap();
    poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Established)
    });

    client.send(client_id, b"knock").unwrap();
    let connected = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Connected { .. })
    });
    let peer_id = match connected.kind {
        EventKind::Connected { comm } => comm,
        _ => unreachable!(),
    };
    poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });

    // No traffic for longer than the idle timeout: exactly one disconnect
    let gone = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Disconnected)
    });
    assert_eq!(gone.socket, peer_id);
    server.destroy(peer_id);

    // Traffic afterward is a brand-new peer, not a resurrection
    client.send(client_id, b"again").unwrap();
    let reconnected = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Connected { .. })
    });
    let fresh_id = match reconnected.kind {
        EventKind::Connected { comm } => comm,
        _ => unreachable!(),
    };
    let data = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(data.socket, fresh_id);
    assert_eq!(&data.data().unwrap()[..], b"again");
}

#[test]
fn tcp_connect_with_ephemeral_port() {
    let bind_url = SocketUrl::parse("tcp://127.0.0.1:0").unwrap();
    let mut server: SocketSet<()> = SocketSet::new(TICK);
    let server_id = server
        .create_server(&bind_url, 0, (), ServerExtra::Backlog(4))
        .unwrap();
    let actual = server.local_url(server_id).expect("bound TCP socket");

    let mut client: SocketSet<()> = SocketSet::new(TICK);
    let client_id = client.create_comm(None, &actual, 0, (), None).unwrap();
    poll_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Established)
    });

    let connected = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::Connected { .. })
    });
    let peer_id = match connected.kind {
        EventKind::Connected { comm } => comm,
        _ => unreachable!(),
    };

    client.send(client_id, b"over tcp").unwrap();
    let data = poll_until(&mut server, Duration::from_secs(2), |e| {
        matches!(e.kind, EventKind::DataIn { .. })
    });
    assert_eq!(data.socket, peer_id);
    assert_eq!(&data.data().unwrap()[..], b"over tcp");
}
