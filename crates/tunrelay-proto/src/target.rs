//! Tunnel target addresses
//!
//! Targets use plain `host:port` syntax. IPv6 literals must be bracketed
//! (`[::1]:443`); the brackets are stripped from the stored host and
//! restored by `Display`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetAddrError {
    #[error("empty target address")]
    Empty,

    #[error("target address is not valid UTF-8")]
    InvalidUtf8,

    #[error("missing port in address {0}")]
    MissingPort(String),

    #[error("invalid port in address {0}")]
    InvalidPort(String),

    #[error("too many colons in address {0}")]
    TooManyColons(String),

    #[error("missing ']' in address {0}")]
    MissingBracket(String),

    #[error("missing host in address {0}")]
    MissingHost(String),
}

/// Destination of a tunnel: hostname (or IP literal) plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; the port is mandatory.
    pub fn parse(s: &str) -> Result<Self, TargetAddrError> {
        let (host, port) = split_host_port(s)?;
        let port = port.ok_or_else(|| TargetAddrError::MissingPort(s.to_string()))?;
        Self::build(s, host, port)
    }

    /// Parse `host[:port]`, using `default_port` when the port is absent.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, TargetAddrError> {
        let (host, port) = split_host_port(s)?;
        Self::build(s, host, port.unwrap_or(default_port))
    }

    /// Parse the raw address bytes carried by a framed handshake.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, TargetAddrError> {
        let s = std::str::from_utf8(raw).map_err(|_| TargetAddrError::InvalidUtf8)?;
        Self::parse(s)
    }

    fn build(original: &str, host: &str, port: u16) -> Result<Self, TargetAddrError> {
        if host.is_empty() {
            return Err(TargetAddrError::MissingHost(original.to_string()));
        }
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TargetAddr {
    type Err = TargetAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split `host:port`, `[v6]:port`, `host` or `[v6]` into host and optional port.
fn split_host_port(s: &str) -> Result<(&str, Option<u16>), TargetAddrError> {
    if s.is_empty() {
        return Err(TargetAddrError::Empty);
    }

    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| TargetAddrError::MissingBracket(s.to_string()))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| TargetAddrError::InvalidPort(s.to_string()))?;
        return Ok((host, Some(parse_port(s, port)?)));
    }

    match s.rsplit_once(':') {
        None => Ok((s, None)),
        Some((host, _)) if host.contains(':') => Err(TargetAddrError::TooManyColons(s.to_string())),
        Some((host, port)) => Ok((host, Some(parse_port(s, port)?))),
    }
}

fn parse_port(original: &str, port: &str) -> Result<u16, TargetAddrError> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TargetAddrError::InvalidPort(original.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| TargetAddrError::InvalidPort(original.to_string()))
}
