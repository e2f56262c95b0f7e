//! Outbound connections to tunnel targets

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunrelay_proto::TargetAddr;

use crate::{configure_keepalive, KeepaliveConfig, DIAL_TIMEOUT};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("timed out after {timeout:?} connecting to {target}")]
    Timeout { target: String, timeout: Duration },

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opens the outbound half of a tunnel.
///
/// Both front ends share one dialer so that timeouts and socket options
/// are identical whichever way the target address was learned.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError>;
}

/// Plain TCP dialer with a bounded connect timeout.
///
/// Every resolved address is tried in turn until one connects or the
/// timeout expires.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
    keepalive: KeepaliveConfig,
}

impl TcpDialer {
    pub fn new(timeout: Duration, keepalive: KeepaliveConfig) -> Self {
        Self { timeout, keepalive }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DIAL_TIMEOUT, KeepaliveConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect((target.host(), target.port()));
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError::Connect {
                    target: target.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(DialError::Timeout {
                    target: target.to_string(),
                    timeout: self.timeout,
                })
            }
        };

        if let Err(e) = configure_keepalive(&stream, &self.keepalive) {
            warn!("Failed to set keepalive on connection to {}: {}", target, e);
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set nodelay on connection to {}: {}", target, e);
        }

        debug!("Connected to {}", target);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = TcpDialer::default();
        let stream = dialer
            .dial(&TargetAddr::new("127.0.0.1", port))
            .await
            .unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let dialer = TcpDialer::default();
        let err = dialer
            .dial(&TargetAddr::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_dial_ipv6_literal_host() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            // No IPv6 loopback in this environment.
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let target = TargetAddr::parse(&format!("[::1]:{port}")).unwrap();
        assert!(TcpDialer::default().dial(&target).await.is_ok());
    }
}
