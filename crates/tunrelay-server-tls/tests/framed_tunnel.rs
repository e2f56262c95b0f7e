//! End-to-end tests for the framed TLS tunnel server
//!
//! Each test starts an echo target, a TLS tunnel server with a fresh
//! self-signed certificate and one or more `tokio-rustls` clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tunrelay_cert::Certificate;
use tunrelay_connection::{DialError, Dialer, ListenAddr, Listener, RelayConfig, TcpDialer};
use tunrelay_proto::{encode_handshake, TargetAddr};
use tunrelay_server_tls::{TlsServer, TlsServerConfig};

const SECRET: &str = "tok1";
const WAIT: Duration = Duration::from_secs(5);

/// Dialer that counts attempts before delegating to a real TCP dial.
#[derive(Default)]
struct CountingDialer {
    inner: TcpDialer,
    attempts: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(target).await
    }
}

struct TestServer {
    addr: SocketAddr,
    connector: TlsConnector,
    dialer: Arc<CountingDialer>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), tunrelay_server_tls::TlsServerError>>,
}

impl TestServer {
    async fn start(relay: RelayConfig) -> Self {
        tunrelay_cert::install_crypto_provider();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let acceptor: TlsAcceptor = Certificate::from_pem(
            cert.pem().as_bytes(),
            key_pair.serialize_pem().as_bytes(),
        )
        .unwrap()
        .into_acceptor()
        .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert.der().clone()).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let listener = Listener::bind(&ListenAddr::parse("127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap().parse().unwrap();

        let config = TlsServerConfig {
            listen: ListenAddr::Tcp(addr.to_string()),
            secret: Some(SECRET.to_string()),
            relay,
        };
        let dialer = Arc::new(CountingDialer::default());
        let shutdown = CancellationToken::new();
        let server = TlsServer::new(config, acceptor).with_dialer(dialer.clone());
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            addr,
            connector,
            dialer,
            shutdown,
            handle,
        }
    }

    async fn connect(&self) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        self.connector.connect(name, tcp).await.unwrap()
    }

    fn dials(&self) -> usize {
        self.dialer.attempts.load(Ordering::SeqCst)
    }
}

/// Echo server standing in for the tunnel target
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Read until the server closes the tunnel. Closing without
/// `close_notify` surfaces as an error, which counts as closed too.
async fn assert_closed(client: &mut TlsStream<TcpStream>) {
    let mut buf = [0u8; 16];
    let result = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(matches!(result, Ok(0) | Err(_)), "unexpected data: {result:?}");
}

/// Test 1: handshake with payload, then raw relay in both directions
#[tokio::test]
async fn test_handshake_leftover_then_echo() {
    let echo = start_echo_server().await;
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(SECRET.as_bytes(), &echo.to_string(), b"HELLO");
    client.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"HELLO");

    client.write_all(b"more bytes").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"more bytes");
    assert_eq!(server.dials(), 1);
}

/// Test 2: leftover bytes arrive before anything sent after the handshake
#[tokio::test]
async fn test_leftover_ordering() {
    let echo = start_echo_server().await;
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(SECRET.as_bytes(), &echo.to_string(), b"first-");
    client.write_all(&frame).await.unwrap();
    client.write_all(b"second").await.unwrap();

    let mut buf = [0u8; 12];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"first-second");
}

/// Test 3: wrong secret closes the connection and never dials
#[tokio::test]
async fn test_wrong_secret_rejected() {
    let echo = start_echo_server().await;
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(b"tok2", &echo.to_string(), b"HELLO");
    client.write_all(&frame).await.unwrap();

    assert_closed(&mut client).await;
    assert_eq!(server.dials(), 0);
}

/// Test 4: malformed frames are dropped silently
#[tokio::test]
async fn test_malformed_handshakes_rejected() {
    let echo = start_echo_server().await;
    let server = TestServer::start(RelayConfig::default()).await;

    let no_delimiter = format!("{SECRET}{echo}");
    let no_address = format!("{SECRET}\nHELLO");
    for frame in ["to", no_delimiter.as_str(), no_address.as_str()] {
        let mut client = server.connect().await;
        client.write_all(frame.as_bytes()).await.unwrap();
        assert_closed(&mut client).await;
    }
    assert_eq!(server.dials(), 0);
}

/// Test 5: a client that never sends its handshake is cut off
#[tokio::test]
async fn test_silent_client_times_out() {
    let relay = RelayConfig {
        dial_timeout: Duration::from_millis(200),
        ..RelayConfig::default()
    };
    let server = TestServer::start(relay).await;
    let mut client = server.connect().await;

    assert_closed(&mut client).await;
    assert_eq!(server.dials(), 0);
}

/// Test 6: unreachable target closes the client connection
#[tokio::test]
async fn test_unreachable_target_closes_client() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(SECRET.as_bytes(), &format!("127.0.0.1:{port}"), b"");
    client.write_all(&frame).await.unwrap();

    assert_closed(&mut client).await;
    assert_eq!(server.dials(), 1);
}

/// Test 7: concurrent tunnels do not see each other's bytes
#[tokio::test]
async fn test_concurrent_tunnels_isolated() {
    let echo = start_echo_server().await;
    let server = Arc::new(TestServer::start(RelayConfig::default()).await);

    let mut tasks = Vec::new();
    for i in 0..20u32 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = server.connect().await;
            let payload = format!("client-{i:02}");
            let frame = encode_handshake(SECRET.as_bytes(), &echo.to_string(), payload.as_bytes());
            client.write_all(&frame).await.unwrap();

            let mut buf = vec![0u8; payload.len()];
            timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
            assert_eq!(buf, payload.as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(server.dials(), 20);
}

/// Test 8: closing the client closes the target side
#[tokio::test]
async fn test_client_close_reaches_target() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(SECRET.as_bytes(), &target_addr.to_string(), b"x");
    client.write_all(&frame).await.unwrap();
    let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();

    let mut buf = [0u8; 1];
    upstream.read_exact(&mut buf).await.unwrap();
    drop(client);

    let n = timeout(WAIT, upstream.read(&mut buf))
        .await
        .expect("target side was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

/// Test 9: shutdown stops the server and closes live tunnels
#[tokio::test]
async fn test_shutdown_closes_tunnels() {
    let echo = start_echo_server().await;
    let server = TestServer::start(RelayConfig::default()).await;
    let mut client = server.connect().await;

    let frame = encode_handshake(SECRET.as_bytes(), &echo.to_string(), b"ping");
    client.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

    server.shutdown.cancel();
    assert_closed(&mut client).await;

    let result = timeout(WAIT, server.handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}
