use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Transport failure classification consumed by [`RetryPolicy`].
///
/// Every transport-level failure surfaced by the pool, the connector or the
/// request exchange carries exactly one of these kinds.
///
/// [`RetryPolicy`]: crate::RetryPolicy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FailureKind {
    /// Peer closed the connection before sending any response
    PeerClosed,
    /// TLS handshake with the peer failed
    TlsHandshake,
    /// TLS error outside the handshake (e.g. invalid server name)
    Tls,
    /// I/O was interrupted or a read deadline elapsed
    Interrupted,
    /// Destination host could not be resolved
    UnknownHost,
    /// TCP connect did not complete within the connect timeout
    ConnectTimeout,
    /// Any other I/O failure (connection refused, reset, protocol error)
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PeerClosed => "peer closed connection without response",
            Self::TlsHandshake => "TLS handshake failure",
            Self::Tls => "TLS error",
            Self::Interrupted => "I/O interrupted",
            Self::UnknownHost => "destination host unresolvable",
            Self::ConnectTimeout => "connect timeout",
            Self::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// HTTP client error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Invalid client or pool construction argument
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// URL scheme is neither `http` nor `https`
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        /// The URL scheme that was rejected
        scheme: String,
        /// Reason the scheme was rejected
        reason: String,
    },

    /// Query parameters could not be flattened into a query string
    #[error("Invalid query parameters: {0}")]
    InvalidQuery(String),

    /// No connection could be acquired before the acquire timeout elapsed
    #[error("Connection pool exhausted for {destination}: waited {waited:?}")]
    PoolExhausted {
        /// Destination the caller tried to reach
        destination: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The pool (or the client owning it) has been shut down
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// Transport error (network, connection, TLS, etc)
    #[error("Transport error ({kind}): {source}")]
    Transport {
        /// Classification used by the retry policy
        kind: FailureKind,
        /// Underlying cause
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Read timeout elapsed while waiting for the response
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// HTTP non-2xx status
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        content_type: Option<String>,
    },

    /// JSON (de)serialization error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),
}

impl HttpError {
    /// Build a transport error of the given kind.
    #[must_use]
    pub fn transport(
        kind: FailureKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            kind,
            source: source.into(),
        }
    }

    /// Classification of this error for retry decisions.
    ///
    /// Returns `None` for errors that are not transport failures; those are
    /// never retried.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            Self::Timeout(_) => Some(FailureKind::Interrupted),
            _ => None,
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        let kind = classify_hyper_error(&err);
        HttpError::transport(kind, err)
    }
}

/// Map a hyper client error onto a [`FailureKind`].
///
/// A message that was cut off, a request cancelled because the connection
/// went away, or a connection found closed before dispatch all mean the
/// peer never answered.
pub(crate) fn classify_hyper_error(err: &hyper::Error) -> FailureKind {
    if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
        return FailureKind::PeerClosed;
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return classify_io_error(io);
        }
        source = cause.source();
    }

    FailureKind::Io
}

/// Map an I/O error onto a [`FailureKind`].
pub(crate) fn classify_io_error(err: &std::io::Error) -> FailureKind {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut => FailureKind::Interrupted,
        ErrorKind::UnexpectedEof => FailureKind::PeerClosed,
        _ => FailureKind::Io,
    }
}
