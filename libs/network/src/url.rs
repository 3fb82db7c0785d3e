//! URL representation of socket addresses
//!
//! A socket address is a combination of address family, socket type and
//! transport parameters, written as a URL:
//!
//! - `unix:///tmp/my.sock` — UNIX socket of type seqpacket
//! - `unixs:///tmp/xyz` — UNIX socket of type stream
//! - `unixd://local.sock` — UNIX socket of type datagram (relative paths
//!   are allowed)
//! - `tcp://10.1.2.3:8080` — IPv4 TCP socket
//! - `udp://127.0.0.1:9001` — IPv4 UDP socket
//! - `pipe://` — an anonymous pipe, as in `pipe(2)`
//!
//! Host names are resolved at parse time (IPv4 only, matching the address
//! family the layer speaks).

use crate::error::{NetworkError, Result};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transport selected by a URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `unix://` — UNIX seqpacket: connection-oriented, packet-based
    UnixSeq,
    /// `unixs://` — UNIX stream
    UnixStream,
    /// `unixd://` — UNIX datagram: connectionless, packet-based
    UnixDgram,
    /// `tcp://`
    Tcp,
    /// `udp://` — connectionless, packet-based
    Udp,
    /// `pipe://` — anonymous pipe pair
    Pipe,
}

impl Transport {
    /// Packet-based transports deliver whole datagrams; everything else is
    /// a byte stream
    pub fn is_packet(self) -> bool {
        matches!(self, Transport::UnixSeq | Transport::UnixDgram | Transport::Udp)
    }

    /// Connectionless transports have no connection handshake; peers are
    /// emulated per source address
    pub fn is_connectionless(self) -> bool {
        matches!(self, Transport::UnixDgram | Transport::Udp)
    }

    pub fn is_unix(self) -> bool {
        matches!(
            self,
            Transport::UnixSeq | Transport::UnixStream | Transport::UnixDgram
        )
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Transport::UnixSeq => "unix",
            Transport::UnixStream => "unixs",
            Transport::UnixDgram => "unixd",
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Pipe => "pipe",
        }
    }
}

/// A parsed socket URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketUrl {
    transport: Transport,
    path: Option<PathBuf>,
    addr: Option<SocketAddr>,
}

impl SocketUrl {
    pub fn parse(url: &str) -> Result<SocketUrl> {
        let lower = url.to_ascii_lowercase();

        if lower.starts_with("pipe://") {
            return Ok(SocketUrl {
                transport: Transport::Pipe,
                path: None,
                addr: None,
            });
        }

        for (prefix, transport) in [
            ("unixs://", Transport::UnixStream),
            ("unixd://", Transport::UnixDgram),
            ("unix://", Transport::UnixSeq),
        ] {
            if lower.starts_with(prefix) {
                let path = &url[prefix.len()..];
                if path.is_empty() {
                    return Err(NetworkError::invalid_url(url, "UNIX socket path is empty"));
                }
                return Ok(SocketUrl {
                    transport,
                    path: Some(PathBuf::from(path)),
                    addr: None,
                });
            }
        }

        for (prefix, transport) in [("tcp://", Transport::Tcp), ("udp://", Transport::Udp)] {
            if lower.starts_with(prefix) {
                let rest = &url[prefix.len()..];
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| NetworkError::invalid_url(url, "missing ':port'"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| NetworkError::invalid_url(url, "invalid port number"))?;
                let addr = resolve_ipv4(host, port)?;
                return Ok(SocketUrl {
                    transport,
                    path: None,
                    addr: Some(addr),
                });
            }
        }

        Err(NetworkError::invalid_url(url, "unknown scheme"))
    }

    /// Build a TCP or UDP URL directly from a resolved address
    pub fn from_addr(transport: Transport, addr: SocketAddr) -> SocketUrl {
        debug_assert!(matches!(transport, Transport::Tcp | Transport::Udp));
        SocketUrl {
            transport,
            path: None,
            addr: Some(addr),
        }
    }

    /// Build a UNIX URL directly from a path
    pub fn from_path(transport: Transport, path: impl Into<PathBuf>) -> SocketUrl {
        debug_assert!(transport.is_unix());
        SocketUrl {
            transport,
            path: Some(path.into()),
            addr: None,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}

impl FromStr for SocketUrl {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<SocketUrl> {
        SocketUrl::parse(s)
    }
}

impl fmt::Display for SocketUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Pipe => write!(f, "pipe://"),
            t if t.is_unix() => write!(
                f,
                "{}://{}",
                t.scheme(),
                self.path.as_deref().unwrap_or(Path::new("")).display()
            ),
            t => write!(
                f,
                "{}://{}",
                t.scheme(),
                self.addr.expect("inet URL always has an address")
            ),
        }
    }
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| NetworkError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetworkError::invalid_url(format!("{}:{}", host, port), "no IPv4 address"))
}
