//! HTTP proxy server
//!
//! `CONNECT host:port` opens a raw tunnel to the target; any other method
//! is forwarded as a single plain HTTP request. Optional Basic proxy
//! credentials gate both, and an optional certificate turns the listener
//! into an HTTPS proxy.
pub mod forward;
pub mod server;
pub mod service;

pub use forward::{
    BoxError, DeadlineBody, DialerConnector, ForwardError, Forwarder, UpstreamConnectError,
    FORWARD_TIMEOUT,
};
pub use server::{HttpProxyConfig, HttpProxyError, HttpProxyServer};
pub use service::{request_host, ProxyState};
