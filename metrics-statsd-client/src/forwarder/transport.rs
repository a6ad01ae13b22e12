use std::{
    io::{self, Write as _},
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket},
    sync::Arc,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::{UnixDatagram, UnixStream};

use tracing::{debug, trace};

use super::RemoteAddr;
use crate::error::Error;

/// A connection to the remote server.
pub trait Connection: Send {
    /// Writes the whole buffer as a single payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be written in full, an error is returned.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Sets the timeout applied to each write.
    ///
    /// # Errors
    ///
    /// If the underlying socket rejects the timeout, an error is returned.
    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Shuts the connection down.
    ///
    /// # Errors
    ///
    /// If the connection could not be shut down cleanly, an error is returned.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens connections to the remote server.
///
/// The default implementation, [`SocketDialer`], uses the standard library sockets. A custom dialer can be provided
/// to the builder to route metrics through some other channel.
pub trait Dialer: Send + Sync {
    /// Opens a connection to `addr`, giving up after `timeout` where the transport allows it.
    ///
    /// # Errors
    ///
    /// If the connection could not be established, an error is returned.
    fn dial(&self, addr: &RemoteAddr, timeout: Duration) -> io::Result<Box<dyn Connection>>;
}

/// Dialer backed by the standard library sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketDialer;

impl Dialer for SocketDialer {
    fn dial(&self, addr: &RemoteAddr, timeout: Duration) -> io::Result<Box<dyn Connection>> {
        let socket = match addr {
            RemoteAddr::Udp(addrs) => {
                let bind_addr: SocketAddr = match addrs.first() {
                    Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                    _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(bind_addr)?;
                socket.connect(&addrs[..])?;
                Socket::Udp(socket)
            }

            RemoteAddr::Tcp(addrs) => {
                let mut last_error = io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to");
                let mut connected = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last_error = e,
                    }
                }
                let stream = connected.ok_or(last_error)?;
                stream.set_nodelay(true)?;
                Socket::Tcp(stream)
            }

            #[cfg(unix)]
            RemoteAddr::Unixgram(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Socket::Unixgram(socket)
            }

            #[cfg(unix)]
            RemoteAddr::Unix(path) => Socket::Unix(UnixStream::connect(path)?),
        };

        Ok(Box::new(socket))
    }
}

enum Socket {
    Udp(UdpSocket),
    Tcp(TcpStream),

    #[cfg(unix)]
    Unixgram(UnixDatagram),

    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Socket::Udp(socket) => socket.send(buf).map(drop),
            Socket::Tcp(stream) => stream.write_all(buf),
            #[cfg(unix)]
            Socket::Unixgram(socket) => socket.send(buf).map(drop),
            #[cfg(unix)]
            Socket::Unix(stream) => stream.write_all(buf),
        }
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        match self {
            Socket::Udp(socket) => socket.set_write_timeout(timeout),
            Socket::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            Socket::Unixgram(socket) => socket.set_write_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Socket::Udp(_) => Ok(()),
            Socket::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Socket::Unixgram(_) => Ok(()),
            #[cfg(unix)]
            Socket::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
    }
}

/// Owner of the connection to the remote server.
///
/// Connects lazily, frames payloads for the transport class, and reconnects after failures.
pub(crate) struct Transport {
    remote_addr: RemoteAddr,
    timeout: Duration,
    dialer: Arc<dyn Dialer>,
    conn: Option<Box<dyn Connection>>,
    closed: bool,
}

impl Transport {
    /// Creates a new, disconnected `Transport`.
    pub fn new(remote_addr: RemoteAddr, timeout: Duration, dialer: Arc<dyn Dialer>) -> Self {
        Self { remote_addr, timeout, dialer, conn: None, closed: false }
    }

    /// Returns `true` if there is a live connection.
    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Opens a new connection, replacing the current one.
    pub fn dial(&mut self) -> Result<(), Error> {
        self.discard();
        self.conn = Some(open(&self.remote_addr, self.timeout, self.dialer.as_ref())?);
        Ok(())
    }

    /// Writes a payload of one or more complete lines.
    ///
    /// After the transport is closed, payloads are silently discarded.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), Error> {
        if self.closed {
            trace!(payload_len = payload.len(), "Discarding payload written after close.");
            return Ok(());
        }

        // StatsD servers reject a trailing newline in a datagram.
        let payload = if self.remote_addr.is_datagram() {
            payload.strip_suffix(b"\n").unwrap_or(payload)
        } else {
            payload
        };
        if payload.is_empty() {
            return Ok(());
        }

        let result = self.try_write(payload);
        if matches!(result, Err(Error::Write { .. })) && !self.remote_addr.is_datagram() {
            debug!(remote_addr = %self.remote_addr, "Write failed, reconnecting to remote server.");
            return self.try_write(payload);
        }
        result
    }

    fn try_write(&mut self, payload: &[u8]) -> Result<(), Error> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => open(&self.remote_addr, self.timeout, self.dialer.as_ref())?,
        };
        let conn = self.conn.insert(conn);

        match conn.write(payload) {
            Ok(()) => {
                trace!(payload_len = payload.len(), "Wrote payload.");
                Ok(())
            }
            Err(source) => {
                self.discard();
                Err(Error::Write { source })
            }
        }
    }

    /// Closes the connection and stops accepting writes.
    pub fn close(&mut self) -> Result<(), Error> {
        self.closed = true;
        match self.conn.take() {
            Some(mut conn) => conn.close().map_err(|source| Error::Close { source }),
            None => Ok(()),
        }
    }

    fn discard(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close();
        }
    }
}

fn open(remote_addr: &RemoteAddr, timeout: Duration, dialer: &dyn Dialer) -> Result<Box<dyn Connection>, Error> {
    let dial_error = |source| Error::Dial { addr: remote_addr.to_string(), source };

    let mut conn = dialer.dial(remote_addr, timeout).map_err(dial_error)?;
    conn.set_write_timeout(timeout).map_err(dial_error)?;

    // Datagram sockets "connect" even with nobody listening. Writing a couple of empty datagrams surfaces the resulting
    // ICMP errors right away instead of on the first real payload.
    if remote_addr.is_datagram() {
        for _ in 0..2 {
            if let Err(e) = conn.write(&[]) {
                let _ = conn.close();
                return Err(dial_error(e));
            }
        }
    }

    debug!(%remote_addr, "Connected to remote server.");
    Ok(conn)
}
