//! HTTP proxy listener
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tunrelay_auth::Authenticator;
use tunrelay_connection::{
    serve, Accept, AcceptError, ConnectionHandler, Dialer, ListenAddr, ListenAddrError, Listener,
    RelayConfig, TcpDialer,
};

use crate::forward::{Forwarder, FORWARD_TIMEOUT};
use crate::service::{proxy, ProxyState};

/// Time allowed for a client to send a complete request head
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error(transparent)]
    Listen(#[from] ListenAddrError),

    #[error(transparent)]
    Accept(#[from] AcceptError),
}

#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    pub listen: ListenAddr,
    /// `user:pass` required in `Proxy-Authorization`; `None` disables auth
    pub credentials: Option<String>,
    pub relay: RelayConfig,
    pub forward_timeout: Duration,
}

impl Default for HttpProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp("0.0.0.0:8081".to_string()),
            credentials: None,
            relay: RelayConfig::default(),
            forward_timeout: FORWARD_TIMEOUT,
        }
    }
}

pub struct HttpProxyServer {
    config: HttpProxyConfig,
    tls: Option<TlsAcceptor>,
    dialer: Arc<dyn Dialer>,
}

impl HttpProxyServer {
    pub fn new(config: HttpProxyConfig) -> Self {
        let dialer = Arc::new(TcpDialer::new(
            config.relay.dial_timeout,
            config.relay.keepalive,
        ));
        Self {
            config,
            tls: None,
            dialer,
        }
    }

    /// Terminate TLS on accepted connections (HTTPS proxy)
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Replace the dialer used for CONNECT targets and forwarded requests
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub async fn start(self, shutdown: CancellationToken) -> Result<(), HttpProxyError> {
        let listener = Listener::bind(&self.config.listen).await?;
        info!(
            "HTTP{} proxy listening on {}",
            if self.tls.is_some() { "S" } else { "" },
            self.config.listen
        );
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve<L: Accept>(
        self,
        listener: L,
        shutdown: CancellationToken,
    ) -> Result<(), HttpProxyError> {
        let auth = Authenticator::basic_proxy(self.config.credentials.as_deref());
        if auth.requires_auth() {
            info!("Proxy authentication: {}", auth.auth_type());
        }

        let state = Arc::new(ProxyState {
            auth,
            dialer: self.dialer.clone(),
            forwarder: Forwarder::new(self.dialer.clone(), self.config.forward_timeout),
        });
        let handler = Arc::new(ProxyHandler {
            state,
            tls: self.tls,
            tls_timeout: self.config.relay.dial_timeout,
        });

        serve(listener, handler, &self.config.relay, shutdown).await?;
        info!("HTTP proxy stopped");
        Ok(())
    }
}

struct ProxyHandler {
    state: Arc<ProxyState>,
    tls: Option<TlsAcceptor>,
    tls_timeout: Duration,
}

impl ProxyHandler {
    /// Serve HTTP/1 on one connection, then wait for any CONNECT tunnels
    /// it opened to finish.
    async fn serve_http<I>(&self, io: I, peer: &str, shutdown: &CancellationToken)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tunnels = TaskTracker::new();
        let service = service_fn({
            let state = self.state.clone();
            let shutdown = shutdown.clone();
            let tunnels = tunnels.clone();
            move |req| proxy(req, state.clone(), shutdown.clone(), tunnels.clone())
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection from {} ended: {}", peer, e);
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Connection from {} closed by shutdown", peer);
            }
        }

        tunnels.close();
        tunnels.wait().await;
    }
}

#[async_trait]
impl<S> ConnectionHandler<S> for ProxyHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, stream: S, peer: String, shutdown: CancellationToken) {
        let Some(acceptor) = &self.tls else {
            self.serve_http(stream, &peer, &shutdown).await;
            return;
        };

        let accepted = tokio::select! {
            result = timeout(self.tls_timeout, acceptor.accept(stream)) => result,
            _ = shutdown.cancelled() => return,
        };
        match accepted {
            Ok(Ok(tls)) => self.serve_http(tls, &peer, &shutdown).await,
            Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", peer, e),
            Err(_) => warn!("TLS handshake with {} timed out", peer),
        }
    }
}
