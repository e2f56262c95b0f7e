//! Framed handshake adapter
//!
//! Turns a freshly terminated client stream into an open connection to the
//! target the client asked for. The handshake is taken from exactly one
//! read; any bytes after the newline are written to the target before the
//! relay starts so the client's byte order is preserved.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use tunrelay_auth::{AuthError, Authenticator};
use tunrelay_connection::{BufferPool, DialError, Dialer, RelayConfig};
use tunrelay_proto::{handshake_buffer_len, Handshake, HandshakeError, TargetAddr, TargetAddrError};

/// Why a framed session was closed before relaying.
///
/// Only ever logged; the client just sees its connection close.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    TlsTimeout(Duration),

    #[error("handshake read failed: {0}")]
    Read(#[source] io::Error),

    #[error("handshake read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("malformed handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid target: {0}")]
    Target(#[from] TargetAddrError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("writing leftover bytes to {target} failed: {source}")]
    Write {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("writing leftover bytes to {target} timed out after {timeout:?}")]
    WriteTimeout { target: String, timeout: Duration },
}

/// Reads, authenticates and acts on framed handshakes.
///
/// Shared by every connection of one listener; holds only immutable
/// configuration plus the lock-free handshake buffer pool.
pub struct FramedAdapter {
    auth: Authenticator,
    secret_len: usize,
    pool: Arc<BufferPool>,
    dialer: Arc<dyn Dialer>,
    io_timeout: Duration,
}

impl FramedAdapter {
    /// `secret` of `None` (or empty) accepts any caller; the frame then
    /// starts directly with the address.
    pub fn new(secret: Option<&str>, dialer: Arc<dyn Dialer>, config: &RelayConfig) -> Self {
        let secret_len = secret.map(str::len).unwrap_or(0);
        Self {
            auth: Authenticator::token(secret),
            secret_len,
            pool: BufferPool::new(handshake_buffer_len(secret_len), config.pool_capacity),
            dialer,
            io_timeout: config.dial_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Run the handshake on `client` and return the connected target.
    ///
    /// On success the leftover payload has already been delivered to the
    /// target and the handshake buffer is back in the pool.
    pub async fn establish<S>(&self, client: &mut S) -> Result<(TcpStream, TargetAddr), SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut buffer = self.pool.acquire();

        let read = match timeout(self.io_timeout, client.read(&mut buffer[..])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(SessionError::Read(e)),
            Err(_) => return Err(SessionError::ReadTimeout(self.io_timeout)),
        };

        let frame = Handshake::parse(&buffer[..read], self.secret_len)?;
        self.auth.verify(Some(frame.token))?;
        let target = TargetAddr::from_bytes(frame.target)?;
        debug!(
            "Handshake accepted: target {}, {} leftover byte(s)",
            target,
            frame.leftover.len()
        );

        let mut upstream = self.dialer.dial(&target).await?;

        if !frame.leftover.is_empty() {
            match timeout(self.io_timeout, upstream.write_all(frame.leftover)).await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(SessionError::Write {
                        target: target.to_string(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(SessionError::WriteTimeout {
                        target: target.to_string(),
                        timeout: self.io_timeout,
                    })
                }
            }
        }

        drop(buffer);
        Ok((upstream, target))
    }
}
