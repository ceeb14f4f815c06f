use crate::error::{HttpError, InvalidUriKind};
use std::fmt;

/// URL scheme of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// The (scheme, host, port) triple a pooled connection terminates at.
///
/// Connections are only ever reused for requests to an equal destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    #[must_use]
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the destination of an absolute `http`/`https` URI.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidUri`] when the scheme or host is missing,
    /// and [`HttpError::InvalidScheme`] for schemes other than `http`/`https`.
    pub fn from_uri(uri: &http::Uri) -> Result<Self, HttpError> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(other) => {
                return Err(HttpError::InvalidScheme {
                    scheme: other.to_owned(),
                    reason: "only http:// and https:// schemes are supported".to_owned(),
                });
            }
            None => {
                return Err(HttpError::InvalidUri {
                    url: uri.to_string(),
                    kind: InvalidUriKind::MissingScheme,
                    reason: "missing scheme".to_owned(),
                });
            }
        };

        let Some(host) = uri.host().filter(|h| !h.is_empty()) else {
            return Err(HttpError::InvalidUri {
                url: uri.to_string(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "missing host/authority".to_owned(),
            });
        };

        // IPv6 literals keep their brackets in `Uri::host`
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host, port))
    }

    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Value for the `Host` request header (port omitted when default)
    #[must_use]
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}
