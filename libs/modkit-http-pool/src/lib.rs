#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Pooled HTTP/1.1 client for `ModKit`
//!
//! This crate provides a hyper-based HTTP client with:
//! - A bounded connection pool with per-destination and total caps
//! - A background evictor that closes expired and idle connections
//! - Keep-alive handling driven by the server's `Keep-Alive` header
//! - Retries for failures that happen before a response arrives
//! - TLS via rustls, trusting any server certificate by default
//! - User-Agent and B3 trace header injection
//!
//! # Lifecycle
//!
//! Nothing is allocated until the first request: the pool, its evictor and
//! the service stack are created lazily and torn down by
//! [`HttpClient::close`] (or when the last clone is dropped). Clients built
//! over a shared [`ConnectionPool`] leave the pool running until its last
//! holder closes.
//!
//! # Example
//!
//! ```ignore
//! use modkit_http_pool::{HttpClient, PoolConfig};
//!
//! let client = HttpClient::builder()
//!     .pool(PoolConfig::default().with_max_per_destination(10))
//!     .user_agent("my-app/1.0")
//!     .build()?;
//!
//! let data: MyData = client
//!     .get("https://example.com/api")
//!     .query(&Filter { active: true })
//!     .send()
//!     .await?
//!     .json()?;
//!
//! client.close();
//! ```

mod builder;
mod client;
mod config;
mod error;
mod layers;
pub mod pool;
pub mod qs;
mod request;
mod response;
mod retry;
mod tls;
mod transport;

pub use builder::HttpClientBuilder;
pub use client::HttpClient;
pub use config::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVICTION_INTERVAL,
    DEFAULT_KEEP_ALIVE, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_IDLE, DEFAULT_MAX_LIFETIME,
    DEFAULT_MAX_PER_DESTINATION, DEFAULT_MAX_TOTAL, DEFAULT_READ_TIMEOUT, DEFAULT_RETRY_COUNT,
    DEFAULT_USER_AGENT, EffectivePoolConfig, HttpClientConfig, IDEMPOTENCY_KEY_HEADER,
    PoolConfig, TlsTrust,
};
pub use error::{FailureKind, HttpError, InvalidUriKind};
pub use layers::{
    PARENT_SPAN_ID_HEADER, RETRY_ATTEMPT_HEADER, RetryLayer, RetryService, SAMPLED_HEADER,
    SPAN_ID_HEADER, TRACE_ID_HEADER, TraceContext, TraceHeadersLayer, TraceHeadersService,
    UserAgentLayer, UserAgentService,
};
pub use pool::{ConnectionPool, Destination, PoolStats, Pooled};
pub use request::RequestBuilder;
pub use response::{ERROR_BODY_PREVIEW_LIMIT, HttpResponse};
pub use retry::RetryPolicy;
pub use tls::{TrustAllVerifier, client_config};
pub use transport::{ServiceFuture, Transport};
