//! Socket transport for TCP and Unix-domain endpoints.
//!
//! A connection string is either `host:port` (TCP) or a filesystem path
//! (Unix-domain socket). [`Address`] classifies the string once and offers
//! the three ways the rest of the crate talks to an endpoint:
//!
//! - [`Address::listen`] binds an async listener (server side)
//! - [`Address::connect`] opens an async stream (subscribing clients)
//! - [`Address::with_sync_connection`] opens a blocking stream for one-shot
//!   command delivery (task helpers, controllers)
//!
//! Unix-domain socket files are chmod'ed to [`SOCKET_MODE`] right after
//! bind so only the owner and group can connect.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::constants::SOCKET_MODE;

/// Boxed read half of an accepted or connected stream.
pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of an accepted or connected stream.
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// A classified connection string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// `host:port` endpoint.
    Tcp {
        /// Hostname or dotted IPv4 literal.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix-domain socket at a filesystem path.
    Unix(PathBuf),
}

impl Address {
    /// Classify a connection string.
    ///
    /// `host:port` with a hostname-like host and a numeric port is TCP;
    /// everything else is taken as a Unix socket path.
    pub fn parse(connection: &str) -> Self {
        if let Some((host, port)) = connection.rsplit_once(':') {
            if is_host(host) && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::Tcp {
                        host: host.to_string(),
                        port,
                    };
                }
            }
        }
        Self::Unix(PathBuf::from(connection))
    }

    /// Returns `true` for `host:port` endpoints.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Returns `true` for Unix-domain socket paths.
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// Bind a listener on this address.
    ///
    /// For Unix sockets a stale socket file is removed first, and the new
    /// file's mode is forced to `0o770` immediately after bind. A failure to
    /// set the mode fails the whole call.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn listen(&self) -> io::Result<Listener> {
        match self {
            Self::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Self::Unix(path) => {
                if path.exists() {
                    log::debug!("[Transport] Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }

                let listener = std::os::unix::net::UnixListener::bind(path).map_err(|e| {
                    io::Error::new(e.kind(), format!("failed to bind {}: {e}", path.display()))
                })?;
                restrict_socket_permissions(path)?;

                listener.set_nonblocking(true)?;
                let listener = UnixListener::from_std(listener)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Open an async stream to this address.
    pub async fn connect(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Self::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
        }
    }

    /// Open a blocking stream to this address.
    ///
    /// Blocks the calling thread only; never call this on a reactor thread.
    pub fn connect_sync(&self) -> io::Result<SyncConnection> {
        let inner = match self {
            Self::Tcp { host, port } => {
                SyncInner::Tcp(std::net::TcpStream::connect((host.as_str(), *port))?)
            }
            Self::Unix(path) => SyncInner::Unix(std::os::unix::net::UnixStream::connect(path)?),
        };
        Ok(SyncConnection {
            inner,
            closed: false,
        })
    }

    /// Run `f` against a blocking connection, then flush, close the write
    /// side and close the socket, whether or not `f` succeeded.
    ///
    /// An error from `f` takes precedence over an error while closing.
    pub fn with_sync_connection<T, F>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut SyncConnection) -> io::Result<T>,
    {
        let mut conn = self.connect_sync()?;
        let result = f(&mut conn);
        let closed = conn.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

fn is_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

fn restrict_socket_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to set permissions on socket {}: {e}", path.display()),
        )
    })
}

/// Async listener returned by [`Address::listen`].
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix-domain listener and the socket file it owns.
    Unix {
        /// Bound listener.
        listener: UnixListener,
        /// Socket file path (removed on [`Listener::cleanup`]).
        path: PathBuf,
    },
}

impl Listener {
    /// Accept the next inbound connection.
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Self::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The address clients should connect to.
    ///
    /// For TCP this reflects the actual bound port, so binding port `0`
    /// yields a connectable address.
    pub fn address(&self) -> io::Result<Address> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Address::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            Self::Unix { path, .. } => Ok(Address::Unix(path.clone())),
        }
    }

    /// Remove the Unix socket file, if any.
    pub fn cleanup(&self) {
        if let Self::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("[Transport] Failed to remove socket {}: {e}", path.display());
                }
            }
        }
    }
}

/// Async duplex stream over either transport.
#[derive(Debug)]
pub enum Stream {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix-domain stream.
    Unix(UnixStream),
}

impl Stream {
    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Self::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Self::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

#[derive(Debug)]
enum SyncInner {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

/// Blocking duplex stream.
///
/// Dropping it flushes and closes the write side, same as [`close`](Self::close).
#[derive(Debug)]
pub struct SyncConnection {
    inner: SyncInner,
    closed: bool,
}

impl SyncConnection {
    /// Flush, shut down the write side, then close.
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown_write()
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush()?;
        let result = match &self.inner {
            SyncInner::Tcp(s) => s.shutdown(Shutdown::Write),
            SyncInner::Unix(s) => s.shutdown(Shutdown::Write),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Write for SyncConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            SyncInner::Tcp(s) => s.write(buf),
            SyncInner::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            SyncInner::Tcp(s) => s.flush(),
            SyncInner::Unix(s) => s.flush(),
        }
    }
}

impl Read for SyncConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            SyncInner::Tcp(s) => s.read(buf),
            SyncInner::Unix(s) => s.read(buf),
        }
    }
}

impl Drop for SyncConnection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_write() {
            log::debug!("[Transport] Error closing sync connection: {e}");
        }
    }
}
