//! Connection-level settings shared by every listener

use std::time::Duration;

use crate::DIAL_TIMEOUT;

/// TCP keepalive applied to accepted and dialed sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    /// Idle time before the first probe; `None` keeps the OS default
    pub period: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: None,
        }
    }
}

/// Immutable relay settings, built once at startup and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub dial_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    /// Buffers retained by the handshake pool; extra buffers are dropped
    pub pool_capacity: usize,
    /// How long a stopped server waits for live sessions to finish
    pub drain_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
            keepalive: KeepaliveConfig::default(),
            pool_capacity: 1024,
            drain_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(7));
        assert!(config.keepalive.enabled);
        assert_eq!(config.keepalive.period, None);
    }
}
