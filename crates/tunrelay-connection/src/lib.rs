//! Connection plumbing shared by the tunrelay servers
//!
//! - [`BufferPool`]: fixed-size buffers for reading handshakes
//! - [`Dialer`]: outbound TCP connections with a bounded timeout
//! - [`accept_loop`] / [`serve`]: accept with error classification and
//!   per-connection task dispatch
//! - [`relay`]: full-duplex copy between an accepted client and its target

pub mod accept;
pub mod config;
pub mod dial;
pub mod keepalive;
pub mod listener;
pub mod pool;
pub mod relay;

pub use accept::{
    accept_loop, classify_accept_error, serve, Accept, AcceptError, AcceptErrorKind,
    ConnectionHandler,
};
pub use config::{KeepaliveConfig, RelayConfig};
pub use dial::{DialError, Dialer, TcpDialer};
pub use keepalive::configure_keepalive;
pub use listener::{AcceptedStream, ListenAddr, ListenAddrError, Listener};
pub use pool::{BufferPool, PooledBuffer};
pub use relay::{relay, RelayEnd, RelayStats};

use std::time::Duration;

/// Bound on dialing a target, reading a handshake and writing leftover bytes
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(7);

/// Back-off after a transient accept error
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Copy buffer size for each relay direction
pub const RELAY_BUFFER_SIZE: usize = 8192;
