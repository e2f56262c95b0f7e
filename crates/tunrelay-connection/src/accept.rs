//! Accept loop with error classification and per-connection dispatch

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{KeepaliveConfig, RelayConfig, ACCEPT_RETRY_DELAY};

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("failed to accept connection: {0}")]
    Accept(#[from] io::Error),
}

/// How the accept loop reacts to an error from `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// Log, wait [`ACCEPT_RETRY_DELAY`] and keep accepting
    Transient,
    /// The listener is gone; stop quietly
    Shutdown,
    /// Stop and report the error
    Fatal,
}

/// Source of inbound connections.
#[async_trait]
pub trait Accept: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection and return it with a printable peer address.
    async fn accept(&self) -> io::Result<(Self::Stream, String)>;

    /// Apply socket options to a freshly accepted connection.
    fn prepare(&self, _stream: &Self::Stream, _keepalive: &KeepaliveConfig) -> io::Result<()> {
        Ok(())
    }
}

/// Per-connection protocol logic run by [`serve`].
///
/// `shutdown` fires when the server stops; handlers end their session when
/// it does. Failures are handled inside: the accept loop never sees them.
#[async_trait]
pub trait ConnectionHandler<S>: Send + Sync + 'static
where
    S: Send + 'static,
{
    async fn handle(&self, stream: S, peer: String, shutdown: CancellationToken);
}

pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::OutOfMemory => AcceptErrorKind::Transient,
        ErrorKind::UnexpectedEof | ErrorKind::NotConnected => AcceptErrorKind::Shutdown,
        _ if is_fd_exhaustion(err) => AcceptErrorKind::Transient,
        _ => AcceptErrorKind::Fatal,
    }
}

/// EMFILE / ENFILE: out of file descriptors, usually clears once
/// existing sessions close.
fn is_fd_exhaustion(err: &io::Error) -> bool {
    cfg!(unix) && matches!(err.raw_os_error(), Some(23) | Some(24))
}

/// Accept connections until `shutdown` fires or a fatal error occurs.
///
/// Each connection is configured with the keepalive settings and handed to
/// `handler` on its own task, tracked by `tracker` and tied to `sessions`.
/// A connection whose socket options cannot be applied is dropped without
/// stopping the loop.
pub async fn accept_loop<L, H>(
    listener: &L,
    handler: &Arc<H>,
    config: &RelayConfig,
    shutdown: &CancellationToken,
    sessions: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<(), AcceptError>
where
    L: Accept,
    H: ConnectionHandler<L::Stream>,
{
    let mut conn_id: u64 = 0;

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                debug!("Accept loop received shutdown signal");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = listener.prepare(&stream, &config.keepalive) {
                    warn!("Failed to configure connection from {}: {}", peer, e);
                    continue;
                }

                conn_id += 1;
                let span = info_span!("conn", id = conn_id, peer = %peer);
                let handler = handler.clone();
                let token = sessions.clone();
                tracker.spawn(
                    async move {
                        debug!("Accepted connection");
                        handler.handle(stream, peer, token).await;
                        debug!("Connection finished");
                    }
                    .instrument(span),
                );
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptErrorKind::Transient => {
                    warn!(
                        "Temporary accept error: {}; retrying in {:?}",
                        e, ACCEPT_RETRY_DELAY
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
                AcceptErrorKind::Shutdown => {
                    info!("Listener closed: {}", e);
                    return Ok(());
                }
                AcceptErrorKind::Fatal => {
                    error!("Fatal accept error: {}", e);
                    return Err(AcceptError::Accept(e));
                }
            },
        }
    }
}

/// Run [`accept_loop`] and then close every live session.
///
/// Once the loop ends, sessions are signalled to stop and the call waits
/// up to `config.drain_grace` for their tasks to finish.
pub async fn serve<L, H>(
    listener: L,
    handler: Arc<H>,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<(), AcceptError>
where
    L: Accept,
    H: ConnectionHandler<L::Stream>,
{
    let tracker = TaskTracker::new();
    let sessions = shutdown.child_token();

    let result = accept_loop(&listener, &handler, config, &shutdown, &sessions, &tracker).await;
    drop(listener);

    tracker.close();
    sessions.cancel();
    if !tracker.is_empty() {
        info!("Closing {} live session(s)", tracker.len());
    }
    if tokio::time::timeout(config.drain_grace, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "{} session(s) still running after {:?}",
            tracker.len(),
            config.drain_grace
        );
    }

    result
}
