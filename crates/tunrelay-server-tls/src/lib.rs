//! Framed-protocol tunnel server
//!
//! Terminates TLS, reads a single `<secret><host:port>\n<payload>` frame,
//! authenticates it, dials the target and relays bytes until either side
//! closes. Handshake failures are silent: the connection is just closed.
pub mod server;
pub mod session;

pub use server::{TlsServer, TlsServerConfig, TlsServerError};
pub use session::{FramedAdapter, SessionError};
