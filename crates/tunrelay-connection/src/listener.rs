//! Listening sockets: TCP ports and Unix domain sockets
//!
//! Listen addresses are written `host:port`, `:port` (all interfaces) or
//! `unix:/path/to.sock`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::info;

use crate::{configure_keepalive, Accept, KeepaliveConfig};

#[derive(Debug, Error)]
pub enum ListenAddrError {
    #[error("empty listen address")]
    Empty,

    #[error("empty unix socket path")]
    EmptyUnixPath,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this address: lsof -i {address}\n  • Try using a different address or port")]
    BindError { address: String, reason: String },

    #[error("unix domain sockets are not supported on this platform")]
    UnixUnsupported,
}

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn parse(s: &str) -> Result<Self, ListenAddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ListenAddrError::Empty);
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ListenAddrError::EmptyUnixPath);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with(':') {
            return Ok(Self::Tcp(format!("0.0.0.0{}", s)));
        }
        Ok(Self::Tcp(s.to_string()))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl std::str::FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A bound listener of either family.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub async fn bind(addr: &ListenAddr) -> Result<Self, ListenAddrError> {
        let bind_error = |e: io::Error| ListenAddrError::BindError {
            address: addr.to_string(),
            reason: e.to_string(),
        };

        match addr {
            ListenAddr::Tcp(address) => {
                let listener = TcpListener::bind(address.as_str())
                    .await
                    .map_err(bind_error)?;
                if let Ok(local) = listener.local_addr() {
                    info!("Listening: {}", local);
                }
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                use std::os::unix::fs::PermissionsExt;

                // A stale socket file from a previous run blocks bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
                    .map_err(bind_error)?;
                info!("Listening: {}", path.display());
                Ok(Self::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => Err(ListenAddrError::UnixUnsupported),
        }
    }

    /// Printable local address, e.g. `127.0.0.1:8443` or `unix:/tmp/x.sock`
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(format!("unix:{}", path.display())),
        }
    }
}

#[async_trait]
impl Accept for Listener {
    type Stream = AcceptedStream;

    async fn accept(&self) -> io::Result<(AcceptedStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((AcceptedStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((AcceptedStream::Unix(stream), format!("unix:{}", path.display())))
            }
        }
    }

    fn prepare(&self, stream: &AcceptedStream, keepalive: &KeepaliveConfig) -> io::Result<()> {
        match stream {
            AcceptedStream::Tcp(stream) => configure_keepalive(stream, keepalive),
            #[cfg(unix)]
            AcceptedStream::Unix(_) => Ok(()),
        }
    }
}

/// A connection accepted by [`Listener`].
#[derive(Debug)]
pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for AcceptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AcceptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
