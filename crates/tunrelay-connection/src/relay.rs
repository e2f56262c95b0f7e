//! Full-duplex byte relay between a client and its target
//!
//! The calling task copies client → target while a spawned task copies
//! target → client. The first direction to finish ends the session: the
//! other direction is aborted and every half is dropped, so each
//! connection is closed exactly once by ownership.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::RELAY_BUFFER_SIZE;

/// Why a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client sent EOF
    ClientClosed,
    /// Target sent EOF
    TargetClosed,
    /// Read or write failed in either direction
    Error,
    /// Server shutdown signal
    Shutdown,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientClosed => "client closed",
            Self::TargetClosed => "target closed",
            Self::Error => "i/o error",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub duration: Duration,
    pub end: RelayEnd,
}

/// Relay bytes between `client` and `target` until either side finishes
/// or `shutdown` fires.
///
/// Leftover handshake bytes must already have been written to `target`.
/// No idle timeout applies; dead peers are detected by TCP keepalive.
pub async fn relay<C, T>(client: C, target: T, shutdown: &CancellationToken) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let started = Instant::now();
    let (mut client_r, client_w) = tokio::io::split(client);
    let (target_r, mut target_w) = tokio::io::split(target);

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let mut reverse = tokio::spawn({
        let received = received.clone();
        async move {
            let mut target_r = target_r;
            let mut client_w = client_w;
            copy_direction(&mut target_r, &mut client_w, &received).await
        }
    });
    let mut reverse_done = false;

    let end = tokio::select! {
        result = copy_direction(&mut client_r, &mut target_w, &sent) => match result {
            Ok(()) => RelayEnd::ClientClosed,
            Err(e) => {
                debug!("client -> target copy failed: {}", e);
                RelayEnd::Error
            }
        },
        joined = &mut reverse => {
            reverse_done = true;
            match joined {
                Ok(Ok(())) => RelayEnd::TargetClosed,
                Ok(Err(e)) => {
                    debug!("target -> client copy failed: {}", e);
                    RelayEnd::Error
                }
                Err(e) => {
                    debug!("target -> client task failed: {}", e);
                    RelayEnd::Error
                }
            }
        },
        _ = shutdown.cancelled() => RelayEnd::Shutdown,
    };

    if !reverse_done {
        reverse.abort();
        let _ = reverse.await;
    }
    drop(client_r);
    drop(target_w);

    let stats = RelayStats {
        client_to_target: sent.load(Ordering::Relaxed),
        target_to_client: received.load(Ordering::Relaxed),
        duration: started.elapsed(),
        end,
    };
    debug!(
        "Relay ended ({}): {} bytes sent, {} bytes received in {:?}",
        stats.end, stats.client_to_target, stats.target_to_client, stats.duration
    );
    stats
}

/// Copy until EOF, counting forwarded bytes. Returns `Ok` on clean EOF.
async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
