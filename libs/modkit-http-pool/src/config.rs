use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-http-pool/", env!("CARGO_PKG_VERSION"));

/// Standard idempotency key header name (display form)
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Default maximum response body size (10 MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Default read timeout for a single request attempt
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default wait for a pooled connection
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default cap on connections to a single destination
pub const DEFAULT_MAX_PER_DESTINATION: usize = 5;
/// Default cap on connections across all destinations
pub const DEFAULT_MAX_TOTAL: usize = 40;
/// Default idle duration after which a free connection is closed
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_millis(1_800_000);
/// Default interval between eviction sweeps
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_millis(30_000);
/// Default reuse window when the server sends no `Keep-Alive` hint
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(60_000);
/// Default maximum age of a connection
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_millis(600_000);
/// Default number of attempts (initial attempt included)
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Connection pool configuration.
///
/// Every numeric field is optional: `None` or a value `<= 0` resolves to the
/// documented default when read through the getters, so partially filled
/// configuration (e.g. from YAML) is always usable.
///
/// ```
/// use modkit_http_pool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_max_total(2)
///     .with_acquire_timeout_ms(100);
///
/// assert_eq!(config.max_total(), 2);
/// assert_eq!(config.max_per_destination(), 5);
/// assert_eq!(config.acquire_timeout(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// TCP connect timeout in milliseconds (default: 5000)
    pub connect_timeout_ms: Option<i64>,

    /// Read timeout of a single request attempt in milliseconds (default: 10000)
    pub read_timeout_ms: Option<i64>,

    /// Maximum wait for a pooled connection in milliseconds (default: 10000)
    pub acquire_timeout_ms: Option<i64>,

    /// Maximum connections per destination (default: 5)
    pub max_per_destination: Option<i64>,

    /// Maximum connections across all destinations (default: 40)
    ///
    /// Should be at least `max_per_destination`; a smaller value simply
    /// becomes the effective per-destination bound as well.
    pub max_total: Option<i64>,

    /// Maximum age of a connection in milliseconds (default: 600000)
    pub max_lifetime_ms: Option<i64>,

    /// Interval between idle eviction sweeps in milliseconds (default: 30000)
    pub eviction_interval_ms: Option<i64>,

    /// Idle duration after which a free connection is closed, in milliseconds
    /// (default: 1800000)
    pub max_idle_ms: Option<i64>,

    /// Reuse window when the server sends no `Keep-Alive` hint, in
    /// milliseconds (default: 60000)
    pub keep_alive_ms: Option<i64>,

    /// Total attempts per request, initial attempt included (default: 3)
    ///
    /// Use `1` to disable retries.
    pub retry_count: Option<i64>,

    /// Whether the pool is shared between several owners (default: false)
    ///
    /// A shared pool is torn down only when its last holder releases it.
    pub shared: bool,
}

fn positive_millis(value: Option<i64>, default: Duration) -> Duration {
    match value.and_then(|v| u64::try_from(v).ok()) {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

fn positive_count(value: Option<i64>, default: usize) -> usize {
    match value.and_then(|v| usize::try_from(v).ok()) {
        Some(n) if n > 0 => n,
        _ => default,
    }
}

impl PoolConfig {
    /// Set the connect timeout in milliseconds
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: i64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set the read timeout in milliseconds
    #[must_use]
    pub fn with_read_timeout_ms(mut self, ms: i64) -> Self {
        self.read_timeout_ms = Some(ms);
        self
    }

    /// Set the acquire timeout in milliseconds
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: i64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Set the per-destination connection cap
    #[must_use]
    pub fn with_max_per_destination(mut self, n: i64) -> Self {
        self.max_per_destination = Some(n);
        self
    }

    /// Set the total connection cap
    #[must_use]
    pub fn with_max_total(mut self, n: i64) -> Self {
        self.max_total = Some(n);
        self
    }

    /// Set the maximum connection lifetime in milliseconds
    #[must_use]
    pub fn with_max_lifetime_ms(mut self, ms: i64) -> Self {
        self.max_lifetime_ms = Some(ms);
        self
    }

    /// Set the eviction sweep interval in milliseconds
    #[must_use]
    pub fn with_eviction_interval_ms(mut self, ms: i64) -> Self {
        self.eviction_interval_ms = Some(ms);
        self
    }

    /// Set the maximum idle duration in milliseconds
    #[must_use]
    pub fn with_max_idle_ms(mut self, ms: i64) -> Self {
        self.max_idle_ms = Some(ms);
        self
    }

    /// Set the default keep-alive window in milliseconds
    #[must_use]
    pub fn with_keep_alive_ms(mut self, ms: i64) -> Self {
        self.keep_alive_ms = Some(ms);
        self
    }

    /// Set the total number of attempts per request
    #[must_use]
    pub fn with_retry_count(mut self, n: i64) -> Self {
        self.retry_count = Some(n);
        self
    }

    /// Mark the pool as shared between several owners
    #[must_use]
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        positive_millis(self.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        positive_millis(self.read_timeout_ms, DEFAULT_READ_TIMEOUT)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        positive_millis(self.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT)
    }

    #[must_use]
    pub fn max_per_destination(&self) -> usize {
        positive_count(self.max_per_destination, DEFAULT_MAX_PER_DESTINATION)
    }

    #[must_use]
    pub fn max_total(&self) -> usize {
        positive_count(self.max_total, DEFAULT_MAX_TOTAL)
    }

    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        positive_millis(self.max_lifetime_ms, DEFAULT_MAX_LIFETIME)
    }

    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        positive_millis(self.eviction_interval_ms, DEFAULT_EVICTION_INTERVAL)
    }

    #[must_use]
    pub fn max_idle(&self) -> Duration {
        positive_millis(self.max_idle_ms, DEFAULT_MAX_IDLE)
    }

    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        positive_millis(self.keep_alive_ms, DEFAULT_KEEP_ALIVE)
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        match self.retry_count.and_then(|v| u32::try_from(v).ok()) {
            Some(n) if n > 0 => n,
            _ => DEFAULT_RETRY_COUNT,
        }
    }

    /// Resolve every field to its effective value.
    #[must_use]
    pub fn effective(&self) -> EffectivePoolConfig {
        EffectivePoolConfig {
            connect_timeout: self.connect_timeout(),
            read_timeout: self.read_timeout(),
            acquire_timeout: self.acquire_timeout(),
            max_per_destination: self.max_per_destination(),
            max_total: self.max_total(),
            max_lifetime: self.max_lifetime(),
            eviction_interval: self.eviction_interval(),
            max_idle: self.max_idle(),
            keep_alive: self.keep_alive(),
            retry_count: self.retry_count(),
            shared: self.shared,
        }
    }
}

/// [`PoolConfig`] with every default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePoolConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_per_destination: usize,
    pub max_total: usize,
    pub max_lifetime: Duration,
    pub eviction_interval: Duration,
    pub max_idle: Duration,
    pub keep_alive: Duration,
    pub retry_count: u32,
    pub shared: bool,
}

impl Default for EffectivePoolConfig {
    fn default() -> Self {
        PoolConfig::default().effective()
    }
}

/// Server certificate trust strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsTrust {
    /// Accept any certificate for any host
    ///
    /// **WARNING**: exposes traffic to interception. Kept as the default for
    /// compatibility with internal endpoints using self-signed certificates.
    #[default]
    TrustAll,
    /// Verify against the OS native root certificate store
    NativeRoots,
}

/// Overall HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Connection pool configuration (default: pooled with default limits)
    ///
    /// `None` disables pooling: every request opens a fresh connection that
    /// is closed afterwards, and neither retries nor idle eviction apply.
    pub pool: Option<PoolConfig>,

    /// User-Agent header value
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// Server certificate trust strategy (default: `TrustAll`)
    pub tls: TlsTrust,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool: Some(PoolConfig::default()),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            tls: TlsTrust::default(),
        }
    }
}

impl HttpClientConfig {
    /// Configuration without pooling: one fresh connection per request
    #[must_use]
    pub fn unpooled() -> Self {
        Self {
            pool: None,
            ..Default::default()
        }
    }

    /// Pooled configuration with the given pool settings
    #[must_use]
    pub fn pooled(pool: PoolConfig) -> Self {
        Self {
            pool: Some(pool),
            ..Default::default()
        }
    }
}
