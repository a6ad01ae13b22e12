use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs as _},
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

use crossbeam_channel::Sender;

use crate::{buffer::FlushToken, error::Error};

pub mod scheduler;
pub mod transport;

/// Remote address of the StatsD server, along with the transport used to reach it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteAddr {
    /// UDP.
    Udp(Vec<SocketAddr>),

    /// TCP.
    Tcp(Vec<SocketAddr>),

    /// Unix domain socket in `SOCK_DGRAM` mode.
    #[cfg(unix)]
    Unixgram(PathBuf),

    /// Unix domain socket in `SOCK_STREAM` mode.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl RemoteAddr {
    /// Returns `true` if the transport is connectionless.
    ///
    /// Datagram transports deliver each payload as a unit, so payloads are sent without their trailing newline. Stream
    /// transports keep it so that consecutive payloads stay delimited.
    pub const fn is_datagram(&self) -> bool {
        match self {
            RemoteAddr::Udp(_) => true,
            RemoteAddr::Tcp(_) => false,
            #[cfg(unix)]
            RemoteAddr::Unixgram(_) => true,
            #[cfg(unix)]
            RemoteAddr::Unix(_) => false,
        }
    }

    /// Returns the transport ID for the remote address.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp(_) => "udp",
            RemoteAddr::Tcp(_) => "tcp",
            #[cfg(unix)]
            RemoteAddr::Unixgram(_) => "unixgram",
            #[cfg(unix)]
            RemoteAddr::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddr::Udp(addrs) | RemoteAddr::Tcp(addrs) => match addrs.first() {
                Some(addr) => write!(f, "{}://{}", self.transport_id(), addr),
                None => write!(f, "{}://<unresolved>", self.transport_id()),
            },
            #[cfg(unix)]
            RemoteAddr::Unixgram(path) | RemoteAddr::Unix(path) => {
                write!(f, "{}://{}", self.transport_id(), path.display())
            }
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        let (scheme, rest) = addr.split_once("://").unwrap_or(("udp", addr));
        match scheme {
            "udp" => resolve(rest).map(RemoteAddr::Udp),
            "tcp" => resolve(rest).map(RemoteAddr::Tcp),
            #[cfg(unix)]
            "unixgram" => Ok(RemoteAddr::Unixgram(PathBuf::from(rest))),
            #[cfg(unix)]
            "unix" => Ok(RemoteAddr::Unix(PathBuf::from(rest))),
            _ => Err(format!("invalid scheme '{scheme}' (expected 'udp', 'tcp', 'unix' or 'unixgram')")),
        }
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>, String> {
    // `:8125` is shorthand for the local host.
    let addr = if addr.starts_with(':') { format!("127.0.0.1{addr}") } else { addr.to_string() };

    let addrs: Vec<SocketAddr> = addr.to_socket_addrs().map_err(|e| e.to_string())?.collect();
    if addrs.is_empty() {
        return Err(format!("'{addr}' did not resolve to any address"));
    }
    Ok(addrs)
}

/// Forwarder configuration.
#[derive(Clone)]
pub struct ForwarderConfiguration {
    pub remote_addr: RemoteAddr,
    pub flush_interval: Duration,
}

/// Work handed to the forwarder thread.
pub(crate) enum FlushRequest {
    /// A slot filled up and has to be written out.
    BufferFull(FlushToken),

    /// Drain both slots, then reply with the result.
    Flush(Sender<Result<(), Error>>),

    /// Drain both slots and close the connection, then reply with the result and stop.
    Close(Sender<Result<(), Error>>),
}
