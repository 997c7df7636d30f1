//! Forwarding to the rendering backend.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tilequeue::Error;
use tokio::net::TcpStream;

/// Response body the dispatcher writes: either the backend's streamed body or
/// a short error page.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe one connection and must not cross the proxy.
const HOP_BY_HOP: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "te", "upgrade"];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Sends `req` to `backend` on a fresh connection and returns once response
/// headers arrive. The body keeps streaming after this returns.
///
/// # Errors
///
/// - [`Error::BackendUnreachable`] when the TCP or HTTP handshake fails.
/// - [`Error::BackendReset`] when the exchange breaks before headers.
pub async fn forward(
    backend: SocketAddr,
    mut req: Request<Incoming>,
) -> Result<Response<Incoming>, Error> {
    let stream = TcpStream::connect(backend)
        .await
        .map_err(|e| Error::BackendUnreachable {
            context: format!("connect {backend}: {e}"),
        })?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::BackendUnreachable {
            context: format!("handshake {backend}: {e}"),
        })?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Backend connection to {backend} closed: {e}");
        }
    });

    strip_hop_by_hop(req.headers_mut());
    let mut resp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::BackendReset {
            context: e.to_string(),
        })?;
    strip_hop_by_hop(resp.headers_mut());
    Ok(resp)
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response for a request that could not be forwarded.
pub fn error_response(err: &Error) -> Response<ProxyBody> {
    let status = StatusCode::from(err);
    let mut resp = Response::new(full(format!("{status}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
