use http::{HeaderName, HeaderValue, Request};
use std::future::Future;
use std::task::{Context, Poll};
use tower::{Layer, Service};

pub const TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
pub const SAMPLED_HEADER: &str = "x-b3-sampled";

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// B3 trace identifiers propagated on outbound requests.
///
/// Requests sent from inside [`TraceContext::scope`] carry the `x-b3-*`
/// headers of the scope's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: Option<bool>,
}

impl TraceContext {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            sampled: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    #[must_use]
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    /// Run `fut` with `ctx` as the current trace context.
    pub async fn scope<F: Future>(ctx: Self, fut: F) -> F::Output {
        CURRENT.scope(ctx, fut).await
    }

    /// The context of the enclosing [`scope`](Self::scope), if any
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    fn apply(&self, headers: &mut http::HeaderMap) {
        let sampled = self.sampled.map(|s| if s { "1" } else { "0" });
        let values = [
            (TRACE_ID_HEADER, Some(self.trace_id.as_str())),
            (SPAN_ID_HEADER, Some(self.span_id.as_str())),
            (PARENT_SPAN_ID_HEADER, self.parent_span_id.as_deref()),
            (SAMPLED_HEADER, sampled),
        ];

        for (name, value) in values {
            let Some(value) = value else { continue };
            if headers.contains_key(name) {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(name), value);
                }
                Err(_) => tracing::debug!(header = %name, "skipping invalid trace header value"),
            }
        }
    }
}

/// Tower layer that adds B3 trace headers from the current [`TraceContext`]
#[derive(Clone, Copy, Default)]
pub struct TraceHeadersLayer;

impl<S> Layer<S> for TraceHeadersLayer {
    type Service = TraceHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceHeadersService { inner }
    }
}

/// Service that adds B3 trace headers to requests
#[derive(Clone)]
pub struct TraceHeadersService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for TraceHeadersService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        if let Some(ctx) = TraceContext::current() {
            ctx.apply(req.headers_mut());
        }
        self.inner.call(req)
    }
}
