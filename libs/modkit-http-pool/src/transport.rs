//! Innermost service of the client stack: one request/response exchange over
//! a pooled or a single-use connection.

use crate::error::{FailureKind, HttpError};
use crate::pool::{Connect, ConnectionPool, Destination, HttpConnection};
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, HOST};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderValue, Request, Response, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Future returned by the client service stack
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<Bytes>, HttpError>> + Send>>;

enum Mode<C: Connect> {
    Pooled(Arc<ConnectionPool<C>>),
    Unpooled(Arc<C>),
}

impl<C: Connect> Clone for Mode<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Pooled(pool) => Self::Pooled(Arc::clone(pool)),
            Self::Unpooled(connector) => Self::Unpooled(Arc::clone(connector)),
        }
    }
}

/// Sends a request and buffers the response body.
///
/// In pooled mode the connection is returned to the pool only after the body
/// was read completely and the server allowed reuse; any failure destroys it.
/// In unpooled mode every request gets a fresh connection that is closed
/// afterwards.
pub struct Transport<C: Connect> {
    mode: Mode<C>,
    read_timeout: Duration,
    max_body_size: usize,
}

impl<C: Connect> Clone for Transport<C> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            read_timeout: self.read_timeout,
            max_body_size: self.max_body_size,
        }
    }
}

impl<C> Transport<C>
where
    C: Connect<Connection = HttpConnection>,
{
    /// Exchange requests over connections leased from `pool`.
    #[must_use]
    pub fn pooled(
        pool: Arc<ConnectionPool<C>>,
        read_timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        Self {
            mode: Mode::Pooled(pool),
            read_timeout,
            max_body_size,
        }
    }

    /// Open a fresh connection per request and close it afterwards.
    #[must_use]
    pub fn unpooled(connector: Arc<C>, read_timeout: Duration, max_body_size: usize) -> Self {
        Self {
            mode: Mode::Unpooled(connector),
            read_timeout,
            max_body_size,
        }
    }

    async fn execute(self, req: Request<Full<Bytes>>) -> Result<Response<Bytes>, HttpError> {
        let destination = Destination::from_uri(req.uri())?;
        let mut req = into_origin_form(req, &destination)?;

        match &self.mode {
            Mode::Pooled(pool) => {
                let mut conn = pool.acquire(&destination).await?;
                let response = self.exchange(&mut conn, req).await?;

                match connection_reuse(response.headers(), response.version()) {
                    Reuse::Close => conn.discard(),
                    Reuse::KeepAlive(hint) => {
                        if let Some(keep_alive) = hint {
                            conn.set_keep_alive(keep_alive);
                        }
                        conn.release();
                    }
                }
                Ok(response)
            }
            Mode::Unpooled(connector) => {
                req.headers_mut()
                    .entry(CONNECTION)
                    .or_insert(HeaderValue::from_static("close"));
                let mut conn = connector.connect(&destination).await?;
                self.exchange(&mut conn, req).await
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut HttpConnection,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>, HttpError> {
        let max_body_size = self.max_body_size;
        let attempt = async move {
            let response = conn.send_request(req).await?;
            let (parts, body) = response.into_parts();
            let body = read_body(body, max_body_size).await?;
            Ok::<_, HttpError>(Response::from_parts(parts, body))
        };

        tokio::time::timeout(self.read_timeout, attempt)
            .await
            .map_err(|_| HttpError::Timeout(self.read_timeout))?
    }
}

impl<C> Service<Request<Full<Bytes>>> for Transport<C>
where
    C: Connect<Connection = HttpConnection>,
{
    type Response = Response<Bytes>;
    type Error = HttpError;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        Box::pin(self.clone().execute(req))
    }
}

/// Rewrite an absolute-form request into origin-form with a `Host` header.
fn into_origin_form(
    mut req: Request<Full<Bytes>>,
    destination: &Destination,
) -> Result<Request<Full<Bytes>>, HttpError> {
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = http::Uri::from(path);

    if !req.headers().contains_key(HOST) {
        let host = HeaderValue::try_from(destination.host_header())?;
        req.headers_mut().insert(HOST, host);
    }
    Ok(req)
}

/// Read the whole body, failing once it grows past `limit` bytes.
///
/// The response head already arrived, so the peer processed the request:
/// a broken body is [`FailureKind::Io`] and only idempotent requests retry.
async fn read_body(mut body: Incoming, limit: usize) -> Result<Bytes, HttpError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| HttpError::transport(FailureKind::Io, e))?;
        if let Ok(data) = frame.into_data() {
            let actual = buf.len() + data.len();
            if actual > limit {
                return Err(HttpError::BodyTooLarge { limit, actual });
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reuse {
    Close,
    /// Reusable; `Some` carries the server's `Keep-Alive: timeout` hint
    KeepAlive(Option<Duration>),
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
}

fn connection_reuse(headers: &HeaderMap, version: Version) -> Reuse {
    if connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("close")) {
        return Reuse::Close;
    }
    if version == Version::HTTP_10
        && !connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("keep-alive"))
    {
        return Reuse::Close;
    }
    Reuse::KeepAlive(keep_alive_hint(headers))
}

/// Parse the `timeout` parameter of a `Keep-Alive` header, in seconds.
fn keep_alive_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all("keep-alive")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|param| {
            let (name, value) = param.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("timeout") {
                return None;
            }
            value.trim().trim_matches('"').parse::<u64>().ok()
        })
        .find(|secs| *secs > 0)
        .map(Duration::from_secs)
}
