//! Stream transport shared by the host and app sides.
//!
//! [`Connection`] hides whether an endpoint is a Unix socket or TCP, and
//! [`LineReader`] reads newline-delimited frames while observing a
//! [`CallContext`] so a blocked read can be abandoned.

mod listener;


use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};
use trellis_config::SocketEndpoint;

pub use self::listener::{ConnectionHandler, ListenerHandle, SocketListener};
use crate::context::CallContext;
use crate::error::HostError;

const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Read timeout used to poll the call context while waiting for a frame.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An established stream to an app or host.
#[derive(Debug)]
pub enum Connection {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix domain socket stream.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// Independent handle on the same stream.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }

    /// Sets the read timeout of the underlying stream.
    ///
    /// # Errors
    ///
    /// Fails when the option cannot be applied.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    /// Shuts down both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        let result = match self {
            Self::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
        };
        if let Err(error) = result
            && error.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(target: TRANSPORT_TARGET, error = %error, "socket shutdown failed");
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// Dials `endpoint`, giving up after `timeout`.
///
/// # Errors
///
/// Returns [`HostError::Connect`] when dialing fails, or
/// [`HostError::UnsupportedTransport`] for Unix endpoints on other platforms.
pub fn connect(endpoint: &SocketEndpoint, timeout: Duration) -> Result<Connection, HostError> {
    let connect_error = |source: io::Error| HostError::Connect {
        endpoint: endpoint.to_string(),
        source: Arc::new(source),
    };
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let address = resolve_tcp_address(host, *port).map_err(connect_error)?;
            TcpStream::connect_timeout(&address, timeout)
                .map(Connection::Tcp)
                .map_err(connect_error)
        }
        SocketEndpoint::Unix { path } => {
            #[cfg(unix)]
            {
                connect_unix(path.as_str(), timeout).map_err(connect_error)
            }

            #[cfg(not(unix))]
            {
                let _ = path;
                Err(HostError::UnsupportedTransport {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }
}

pub(crate) fn resolve_tcp_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find(|addr| matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses"))
}

#[cfg(unix)]
fn connect_unix(path: &str, timeout: Duration) -> io::Result<Connection> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, timeout)?;
    let stream: UnixStream = socket.into();
    Ok(Connection::Unix(stream))
}

/// Reads newline-terminated frames from a connection.
#[derive(Debug)]
pub struct LineReader {
    inner: BufReader<Connection>,
    pending: Vec<u8>,
}

impl LineReader {
    /// Wraps `connection`, switching it to short read timeouts.
    ///
    /// # Errors
    ///
    /// Fails when the read timeout cannot be set.
    pub fn new(connection: Connection) -> io::Result<Self> {
        connection.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            inner: BufReader::new(connection),
            pending: Vec::new(),
        })
    }

    /// Reads the next line, checking `ctx` between polls. A partial line
    /// survives an interrupted read and is completed by the next call.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Disconnected`] at end of stream, the context's
    /// error on cancellation or expiry, and [`HostError::Io`] otherwise.
    pub fn read_line(&mut self, ctx: &CallContext) -> Result<Vec<u8>, HostError> {
        loop {
            ctx.check()?;
            match self.inner.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(HostError::Disconnected),
                Ok(_) if self.pending.ends_with(b"\n") => {
                    return Ok(std::mem::take(&mut self.pending));
                }
                Ok(_) => return Err(HostError::Disconnected),
                Err(error) if is_poll_timeout(&error) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Reads the next line without a deadline; `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors other than poll timeouts.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, HostError> {
        match self.read_line(&CallContext::background()) {
            Ok(line) => Ok(Some(line)),
            Err(HostError::Disconnected) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

fn is_poll_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
