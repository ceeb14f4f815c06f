use crate::builder::HttpClientBuilder;
use crate::config::{EffectivePoolConfig, HttpClientConfig};
use crate::error::HttpError;
use crate::layers::{RetryLayer, TraceHeadersLayer, UserAgentLayer};
use crate::pool::{ConnectionPool, HyperConnector, PoolStats};
use crate::request::RequestBuilder;
use crate::response::HttpResponse;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::Full;
use parking_lot::Mutex;
use std::sync::Arc;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};

/// Type-erased client service stack
type ClientService = BoxCloneService<Request<Full<Bytes>>, Response<Bytes>, HttpError>;

/// HTTP client facade over a bounded connection pool
///
/// The pool, its idle evictor and the tower stack are built lazily by the
/// first request. Without a pool configuration every request opens its own
/// connection and neither retries nor eviction apply.
///
/// # Thread Safety
///
/// `HttpClient` is `Clone + Send + Sync`. Clones share the same pool; the
/// pool is released by [`close`](Self::close) or when the last clone is
/// dropped.
///
/// # Example
///
/// ```ignore
/// let client = HttpClient::builder()
///     .pool(PoolConfig::default().with_max_per_destination(10))
///     .build()?;
///
/// let user: User = client
///     .get("https://api.example.com/users/1")
///     .send()
///     .await?
///     .json()?;
///
/// client.close();
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").finish_non_exhaustive()
    }
}

enum Lifecycle {
    /// Not used yet; may hold a caller-provided pool handle
    Fresh(Option<ConnectionPool<HyperConnector>>),
    Ready {
        service: ClientService,
        pool: Option<Arc<ConnectionPool<HyperConnector>>>,
    },
    Closed,
}

struct ClientInner {
    config: HttpClientConfig,
    connector: HyperConnector,
    user_agent: UserAgentLayer,
    state: Mutex<Lifecycle>,
}

impl HttpClient {
    /// Create a pooled HTTP client with default configuration
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, HttpError> {
        HttpClientBuilder::new().build()
    }

    /// Create a builder for configuring the HTTP client
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Create a client from a configuration
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails or the user agent is not
    /// a valid header value
    pub fn from_config(config: HttpClientConfig) -> Result<Self, HttpError> {
        Self::assemble(config, None)
    }

    /// Create a client over an existing pool handle
    ///
    /// [`close`](Self::close) releases this handle: a shared pool stays open
    /// while other holders remain, a non-shared pool is torn down.
    ///
    /// # Errors
    /// Returns an error if the default user agent cannot be used
    pub fn with_pool(pool: ConnectionPool<HyperConnector>) -> Result<Self, HttpError> {
        HttpClientBuilder::new().shared_pool(pool).build()
    }

    pub(crate) fn assemble(
        config: HttpClientConfig,
        pool: Option<ConnectionPool<HyperConnector>>,
    ) -> Result<Self, HttpError> {
        let user_agent = UserAgentLayer::try_new(&config.user_agent)?;
        let timeouts = config
            .pool
            .as_ref()
            .map(crate::config::PoolConfig::effective)
            .unwrap_or_default();
        let connector = HyperConnector::for_config(&timeouts, config.tls)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                user_agent,
                state: Mutex::new(Lifecycle::Fresh(pool)),
            }),
        })
    }

    /// The configuration this client was built with
    #[must_use]
    pub fn config(&self) -> &HttpClientConfig {
        &self.inner.config
    }

    /// Create a GET request builder
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Create a POST request builder
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Create a PUT request builder
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Create a PATCH request builder
    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Create a DELETE request builder
    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Create a HEAD request builder
    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Create an OPTIONS request builder
    pub fn options(&self, url: &str) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Create a request builder for any method
    ///
    /// The URL must be absolute (`http://` or `https://` with a host);
    /// anything else fails at [`send`](RequestBuilder::send) with
    /// [`HttpError::InvalidUri`] or [`HttpError::InvalidScheme`].
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url.to_owned())
    }

    /// Pool counters, or `None` for an unpooled client
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        match &*self.inner.state.lock() {
            Lifecycle::Fresh(pool) => pool.as_ref().map(ConnectionPool::stats),
            Lifecycle::Ready { pool, .. } => pool.as_ref().map(|p| p.stats()),
            Lifecycle::Closed => None,
        }
    }

    /// Release the pool and reject further requests. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), Lifecycle::Closed)
    }

    pub(crate) async fn execute(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<HttpResponse, HttpError> {
        let service = self.inner.service()?;
        let response = service.oneshot(request).await?;
        Ok(HttpResponse::from_response(response))
    }
}

impl ClientInner {
    /// Clone the service stack, building it on first use.
    fn service(&self) -> Result<ClientService, HttpError> {
        let mut state = self.state.lock();
        if let Lifecycle::Fresh(provided) = &mut *state {
            let provided = provided.take();
            match self.build(provided) {
                Ok(ready) => *state = ready,
                Err(e) => {
                    // the pool is gone; never fall back to a default one
                    *state = Lifecycle::Closed;
                    return Err(e);
                }
            }
        }
        match &*state {
            Lifecycle::Ready { service, .. } => Ok(service.clone()),
            Lifecycle::Fresh(_) | Lifecycle::Closed => Err(HttpError::PoolClosed),
        }
    }

    fn build(
        &self,
        provided: Option<ConnectionPool<HyperConnector>>,
    ) -> Result<Lifecycle, HttpError> {
        let max_body_size = self.config.max_body_size;

        let pool = match provided {
            Some(pool) => Some(pool),
            None => self
                .config
                .pool
                .as_ref()
                .map(|pc| ConnectionPool::new(self.connector.clone(), pc.effective())),
        };

        let (transport, pool, retry): (ClientService, _, _) = match pool {
            Some(pool) => {
                let config: EffectivePoolConfig = *pool.config();
                if let Err(e) = pool.start_eviction() {
                    pool.shutdown();
                    return Err(e);
                }
                let pool = Arc::new(pool);
                let transport =
                    Transport::pooled(Arc::clone(&pool), config.read_timeout, max_body_size);
                (
                    transport.boxed_clone(),
                    Some(pool),
                    Some(RetryPolicy::new(config.retry_count)),
                )
            }
            None => {
                let read_timeout = EffectivePoolConfig::default().read_timeout;
                let connector = Arc::new(self.connector.clone());
                let transport = Transport::unpooled(connector, read_timeout, max_body_size);
                (transport.boxed_clone(), None, None)
            }
        };

        // Request flow (outer → inner):
        //   TraceHeaders → UserAgent → Retry (pooled only) → Transport
        let mut service = transport;
        if let Some(policy) = retry {
            service = ServiceBuilder::new()
                .layer(RetryLayer::new(policy))
                .service(service)
                .boxed_clone();
        }
        let service = ServiceBuilder::new()
            .layer(TraceHeadersLayer)
            .layer(self.user_agent.clone())
            .service(service)
            .boxed_clone();

        tracing::debug!(
            pooled = pool.is_some(),
            retry_count = retry.as_ref().map(RetryPolicy::retry_count),
            "http client initialised"
        );
        Ok(Lifecycle::Ready { service, pool })
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Closed);
        match previous {
            Lifecycle::Closed => {}
            Lifecycle::Fresh(pool) => {
                if let Some(pool) = pool {
                    pool.shutdown();
                }
                tracing::debug!("http client closed before first use");
            }
            Lifecycle::Ready { pool, .. } => {
                if let Some(pool) = pool {
                    pool.shutdown();
                }
                tracing::debug!("http client closed");
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}
