use crate::config::IDEMPOTENCY_KEY_HEADER;
use crate::error::HttpError;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use http_body_util::Full;
use hyper::body::Body;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Header name for retry attempt number (1-indexed).
/// Added to retried requests to indicate which retry attempt this is.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Tower layer that re-sends requests failing with a retryable transport error
///
/// Retries are immediate. Whether a failure is retried is decided by
/// [`RetryPolicy`]; HTTP status codes are never retried, only errors that
/// carry a [`FailureKind`](crate::FailureKind).
#[derive(Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy,
        }
    }
}

/// Service that implements the retry loop
///
/// A request counts as idempotent when it has no body or carries an
/// `Idempotency-Key` header.
#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S, ResBody> Service<Request<Full<Bytes>>> for RetryService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy;

        let (parts, body) = req.into_parts();
        let idempotent =
            body.size_hint().exact() == Some(0) || parts.headers.contains_key(IDEMPOTENCY_KEY_HEADER);

        Box::pin(async move {
            let mut attempt: u32 = 1;
            loop {
                let mut req = Request::from_parts(parts.clone(), body.clone());
                if attempt > 1 {
                    req.headers_mut()
                        .insert(RETRY_ATTEMPT_HEADER, HeaderValue::from(attempt - 1));
                }

                let mut svc = inner.clone();
                svc.ready().await?;

                match svc.call(req).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) => {
                        let Some(kind) = err.failure_kind() else {
                            return Err(err);
                        };
                        if !policy.should_retry(kind, attempt, idempotent) {
                            if attempt > 1 {
                                tracing::debug!(
                                    method = %parts.method,
                                    uri = %parts.uri,
                                    attempt,
                                    failure = %kind,
                                    "giving up after retries"
                                );
                            }
                            return Err(err);
                        }
                        tracing::debug!(
                            method = %parts.method,
                            uri = %parts.uri,
                            attempt,
                            failure = %kind,
                            error = %err,
                            "retrying request"
                        );
                        attempt += 1;
                    }
                }
            }
        })
    }
}
