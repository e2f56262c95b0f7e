//! Per-request proxy logic
//!
//! Order of checks for every request: proxy credentials, target host,
//! then either a CONNECT tunnel or a plain forward.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use tunrelay_auth::Authenticator;
use tunrelay_connection::{relay, Dialer};
use tunrelay_proto::TargetAddr;

use crate::forward::{BoxError, Forwarder};

pub type ProxyBody = BoxBody<Bytes, BoxError>;

const CONNECT_DEFAULT_PORT: u16 = 443;
const FORWARD_DEFAULT_PORT: u16 = 80;

/// Immutable state shared by every connection of one proxy listener.
pub struct ProxyState {
    pub auth: Authenticator,
    pub dialer: Arc<dyn Dialer>,
    pub forwarder: Forwarder,
}

/// Host the request is aimed at: URI authority, then `Host`, then the
/// first path segment. `None` when all three are empty.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }

    if let Some(host) = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
    {
        return Some(host.to_string());
    }

    req.uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Handle one request from a proxy client.
///
/// CONNECT tunnels are spawned on `tunnels` once the `200` has been sent,
/// and close when `shutdown` fires.
pub async fn proxy(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
    tunnels: TaskTracker,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let presented = req.headers().get(PROXY_AUTHORIZATION).map(|v| v.as_bytes());
    if let Err(e) = state.auth.verify(presented) {
        warn!("Reject: {} ({} {})", e, req.method(), req.uri());
        return Ok(status_response(StatusCode::BAD_REQUEST));
    }

    let Some(host) = request_host(&req) else {
        warn!("Reject: empty host ({} {})", req.method(), req.uri());
        return Ok(status_response(StatusCode::BAD_REQUEST));
    };

    let default_port = if req.method() == Method::CONNECT {
        CONNECT_DEFAULT_PORT
    } else {
        FORWARD_DEFAULT_PORT
    };
    let target = match TargetAddr::parse_with_default_port(&host, default_port) {
        Ok(target) => target,
        Err(e) => {
            warn!("Reject: invalid host {}: {}", host, e);
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    if req.method() == Method::CONNECT {
        connect(req, target, &state, shutdown, &tunnels).await
    } else {
        debug!("Forwarding {} {} to {}", req.method(), req.uri(), target);
        match state.forwarder.forward(req, &target).await {
            Ok(resp) => Ok(resp.map(|b| b.boxed())),
            Err(e) => {
                warn!("Forward to {} failed: {}", target, e);
                Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }
}

async fn connect(
    req: Request<Incoming>,
    target: TargetAddr,
    state: &ProxyState,
    shutdown: CancellationToken,
    tunnels: &TaskTracker,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let upstream = match state.dialer.dial(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT {} failed: {}", target, e);
            return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    tunnels.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let stats = relay(TokioIo::new(upgraded), upstream, &shutdown).await;
                debug!(
                    "Tunnel to {} closed ({}): {} bytes up, {} bytes down",
                    target, stats.end, stats.client_to_target, stats.target_to_client
                );
            }
            Err(e) => warn!("Upgrade for {} failed: {}", target, e),
        }
    });

    let mut resp = Response::new(empty());
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    resp.headers_mut().insert(
        HeaderName::from_static("keep-alive"),
        HeaderValue::from_static("timeout=120, max=5"),
    );
    Ok(resp)
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = status;
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
