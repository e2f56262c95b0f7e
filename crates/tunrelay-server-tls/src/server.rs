//! TLS listener for the framed protocol
//!
//! The accept loop only accepts and dispatches. TLS termination, the
//! handshake read, the dial and the relay all run in the spawned
//! per-connection task, so a slow client never stalls other accepts.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunrelay_proto::TargetAddr;
use tunrelay_connection::{
    relay, serve, Accept, AcceptError, ConnectionHandler, Dialer, ListenAddr, ListenAddrError,
    Listener, RelayConfig, TcpDialer,
};

use crate::session::{FramedAdapter, SessionError};

#[derive(Debug, Error)]
pub enum TlsServerError {
    #[error(transparent)]
    Listen(#[from] ListenAddrError),

    #[error(transparent)]
    Accept(#[from] AcceptError),
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub listen: ListenAddr,
    /// Shared secret every frame must start with; `None` disables auth
    pub secret: Option<String>,
    pub relay: RelayConfig,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp("0.0.0.0:443".to_string()),
            secret: None,
            relay: RelayConfig::default(),
        }
    }
}

pub struct TlsServer {
    config: TlsServerConfig,
    acceptor: TlsAcceptor,
    dialer: Arc<dyn Dialer>,
}

impl TlsServer {
    pub fn new(config: TlsServerConfig, acceptor: TlsAcceptor) -> Self {
        let dialer = Arc::new(TcpDialer::new(
            config.relay.dial_timeout,
            config.relay.keepalive,
        ));
        Self {
            config,
            acceptor,
            dialer,
        }
    }

    /// Replace the dialer used to reach targets
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), TlsServerError> {
        let listener = Listener::bind(&self.config.listen).await?;
        info!(
            "TLS tunnel server listening on {} (auth: {})",
            self.config.listen,
            if self.config.secret.is_some() { "token" } else { "none" }
        );
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve<L: Accept>(
        self,
        listener: L,
        shutdown: CancellationToken,
    ) -> Result<(), TlsServerError> {
        let adapter = FramedAdapter::new(
            self.config.secret.as_deref(),
            self.dialer,
            &self.config.relay,
        );
        let handler = Arc::new(FramedHandler {
            acceptor: self.acceptor,
            adapter,
        });

        serve(listener, handler, &self.config.relay, shutdown).await?;
        info!("TLS tunnel server stopped");
        Ok(())
    }
}

struct FramedHandler {
    acceptor: TlsAcceptor,
    adapter: FramedAdapter,
}

impl FramedHandler {
    /// Terminate TLS and run the framed handshake.
    async fn open<S>(
        &self,
        stream: S,
    ) -> Result<(TlsStream<S>, TcpStream, TargetAddr), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = self.adapter.io_timeout();
        let mut client = match timeout(limit, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(SessionError::Tls(e)),
            Err(_) => return Err(SessionError::TlsTimeout(limit)),
        };

        let (upstream, target) = self.adapter.establish(&mut client).await?;
        Ok((client, upstream, target))
    }
}

#[async_trait]
impl<S> ConnectionHandler<S> for FramedHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, stream: S, peer: String, shutdown: CancellationToken) {
        let opened = tokio::select! {
            result = self.open(stream) => result,
            _ = shutdown.cancelled() => {
                debug!("Connection from {} closed by shutdown", peer);
                return;
            }
        };

        let (client, upstream, target) = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!("Closing connection from {}: {}", peer, e);
                return;
            }
        };

        debug!("Relaying {} to {}", peer, target);
        let stats = relay(client, upstream, &shutdown).await;
        debug!(
            "Session to {} closed ({}): {} bytes up, {} bytes down",
            target, stats.end, stats.client_to_target, stats.target_to_client
        );
    }
}
