//! TCP keepalive configuration

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::KeepaliveConfig;

/// Apply `config` to a connected TCP socket.
pub fn configure_keepalive(stream: &TcpStream, config: &KeepaliveConfig) -> std::io::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    if let Some(period) = config.period.filter(|p| !p.is_zero()) {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))?;
    }
    Ok(())
}
