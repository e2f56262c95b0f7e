//! Plain (non-CONNECT) request forwarding
//!
//! One request in, one response out, over a pooled upstream client. There
//! is no relay state here: the response body streams straight back to the
//! proxy client, and the whole exchange shares a single deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::InvalidUri;
use http::{header, Request, Response, Uri};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout_at, Instant, Sleep};
use tunrelay_connection::{DialError, Dialer};
use tunrelay_proto::{TargetAddr, TargetAddrError};

/// Bound on a forwarded exchange, from sending the request to the last
/// byte of the response body
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_IDLE_PER_HOST: usize = 233;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const UPSTREAM_DEFAULT_PORT: u16 = 80;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] InvalidUri),

    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("upstream exchange exceeded {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum UpstreamConnectError {
    #[error("upstream URI has no authority: {0}")]
    MissingAuthority(Uri),

    #[error(transparent)]
    Target(#[from] TargetAddrError),

    #[error(transparent)]
    Dial(#[from] DialError),
}

/// Connector for the pooled client that opens every upstream connection
/// through the listener's [`Dialer`].
#[derive(Clone)]
pub struct DialerConnector {
    dialer: Arc<dyn Dialer>,
}

impl DialerConnector {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

impl tower::Service<Uri> for DialerConnector {
    type Response = TokioIo<TcpStream>;
    type Error = UpstreamConnectError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let target = upstream_target(&uri)?;
            let stream = dialer.dial(&target).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

fn upstream_target(uri: &Uri) -> Result<TargetAddr, UpstreamConnectError> {
    let authority = uri
        .authority()
        .ok_or_else(|| UpstreamConnectError::MissingAuthority(uri.clone()))?;
    let host_port = authority
        .as_str()
        .rsplit_once('@')
        .map_or(authority.as_str(), |(_, host_port)| host_port);
    Ok(TargetAddr::parse_with_default_port(
        host_port,
        UPSTREAM_DEFAULT_PORT,
    )?)
}

/// Response body that fails once the exchange deadline passes.
///
/// The error makes the proxy connection abort instead of waiting on an
/// upstream that stopped sending.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl<B> DeadlineBody<B> {
    fn new(inner: B, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            timeout,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(Into::into)));
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Some(Err(ForwardError::Timeout(this.timeout).into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Pooled HTTP/1 client for forwarded requests.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<DialerConnector, Incoming>,
    timeout: Duration,
}

impl Forwarder {
    /// Upstream connections come from `dialer`, so they get the same
    /// connect timeout and socket options as CONNECT tunnels.
    pub fn new(dialer: Arc<dyn Dialer>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(DialerConnector::new(dialer));

        Self { client, timeout }
    }

    /// Send `req` to `target` and return the upstream response unchanged.
    ///
    /// The request URI is rewritten to `http://target/path?query`; the
    /// proxy's own `Proxy-Authorization` header is not passed on. The
    /// returned body errors out if it is still streaming when the
    /// exchange deadline passes.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: &TargetAddr,
    ) -> Result<Response<DeadlineBody<Incoming>>, ForwardError> {
        let deadline = Instant::now() + self.timeout;
        *req.uri_mut() = upstream_uri(req.uri(), target)?;
        req.headers_mut().remove(header::PROXY_AUTHORIZATION);

        match timeout_at(deadline, self.client.request(req)).await {
            Ok(result) => {
                let resp = result?;
                Ok(resp.map(|body| DeadlineBody::new(body, deadline, self.timeout)))
            }
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        }
    }
}

fn upstream_uri(original: &Uri, target: &TargetAddr) -> Result<Uri, InvalidUri> {
    let path = original
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| p.starts_with('/'))
        .unwrap_or("/");
    format!("http://{}{}", target, path).parse()
}
