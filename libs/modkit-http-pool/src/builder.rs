use crate::client::HttpClient;
use crate::config::{HttpClientConfig, PoolConfig, TlsTrust};
use crate::error::HttpError;
use crate::pool::{ConnectionPool, HyperConnector};

/// Builder for constructing an [`HttpClient`].
pub struct HttpClientBuilder {
    config: HttpClientConfig,
    pool: Option<ConnectionPool<HyperConnector>>,
}

impl HttpClientBuilder {
    /// Create a new builder with default configuration (pooled)
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
            pool: None,
        }
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self { config, pool: None }
    }

    /// Use a connection pool built from `pool`
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = Some(pool);
        self
    }

    /// Disable pooling: one fresh connection per request, no retries
    #[must_use]
    pub fn unpooled(mut self) -> Self {
        self.config.pool = None;
        self
    }

    /// Send requests through an existing pool handle
    ///
    /// Overrides [`pool`](Self::pool) and [`unpooled`](Self::unpooled); the
    /// handle's own configuration applies.
    #[must_use]
    pub fn shared_pool(mut self, pool: ConnectionPool<HyperConnector>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the maximum response body size
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the server certificate trust strategy
    #[must_use]
    pub fn tls(mut self, tls: TlsTrust) -> Self {
        self.config.tls = tls;
        self
    }

    /// Build the HTTP client
    ///
    /// The connection pool, evictor and service stack are created on the
    /// first request.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails or the user agent is not
    /// a valid header value
    pub fn build(self) -> Result<HttpClient, HttpError> {
        HttpClient::assemble(self.config, self.pool)
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
