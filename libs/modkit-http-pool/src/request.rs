use crate::client::HttpClient;
use crate::error::{HttpError, InvalidUriKind};
use crate::qs;
use crate::response::HttpResponse;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Method, Request};
use http_body_util::Full;
use serde::Serialize;

/// Body type for the request builder
#[derive(Clone, Debug)]
enum BodyKind {
    Empty,
    Bytes(Bytes),
    /// JSON-serialized body (stored as bytes after serialization)
    Json(Bytes),
    /// Form URL-encoded body (stored as bytes after serialization)
    Form(Bytes),
}

impl BodyKind {
    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Form(_) => Some("application/x-www-form-urlencoded"),
            Self::Empty | Self::Bytes(_) => None,
        }
    }
}

/// HTTP request builder with fluent API
///
/// Created by [`HttpClient::get`], [`HttpClient::post`], etc. Header and
/// query errors are deferred until [`send()`](RequestBuilder::send).
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize)]
/// struct Search { q: String, ids: Vec<u32> }
///
/// // GET https://api.example.com/search?q=rust&ids=1&ids=2
/// let resp = client
///     .get("https://api.example.com/search")
///     .query(&Search { q: "rust".into(), ids: vec![1, 2] })
///     .header("x-request-id", "123")
///     .send()
///     .await?;
///
/// // POST with JSON body
/// let resp = client
///     .post("https://api.example.com/users")
///     .json(&NewUser { name: "Alice" })?
///     .send()
///     .await?;
/// ```
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    client: HttpClient,
    method: Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: BodyKind,
    /// Error captured during building (deferred to `send()`)
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(client: HttpClient, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            headers: Vec::new(),
            body: BodyKind::Empty,
            error: None,
        }
    }

    /// Add a single header to the request
    ///
    /// Caller headers take precedence over defaults (content type, user
    /// agent, trace headers).
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Add multiple headers to the request
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Append `params` to the URL's query string
    ///
    /// Nested objects become dotted keys and sequences repeat the key; see
    /// [`qs`](crate::qs) for the full rules. Errors are deferred to `send()`.
    pub fn query<T: Serialize + ?Sized>(mut self, params: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match qs::append_to_url(&self.url, params) {
            Ok(url) => self.url = url,
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Set request body as JSON
    ///
    /// Sets Content-Type to `application/json` unless the caller provided one.
    ///
    /// # Errors
    ///
    /// Returns `Err(HttpError::Json)` if serialization fails.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Json(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Set request body as form URL-encoded, flattened like [`query`](Self::query)
    ///
    /// Sets Content-Type to `application/x-www-form-urlencoded` unless the
    /// caller provided one.
    ///
    /// # Errors
    ///
    /// Returns `Err(HttpError::InvalidQuery)` if `fields` is not an object and
    /// `Err(HttpError::FormEncode)` if encoding fails.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resp = client
    ///     .post("https://auth.example.com/token")
    ///     .form(&TokenRequest { grant_type: "client_credentials" })?
    ///     .send()
    ///     .await?;
    /// ```
    pub fn form<T: Serialize + ?Sized>(mut self, fields: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Form(Bytes::from(qs::stringify(fields)?));
        Ok(self)
    }

    /// Set request body as raw bytes
    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = BodyKind::Bytes(body);
        self
    }

    /// Set request body as a string
    pub fn body_string(mut self, body: String) -> Self {
        self.body = BodyKind::Bytes(Bytes::from(body));
        self
    }

    fn parse_url(&self) -> Result<http::Uri, HttpError> {
        let uri: http::Uri =
            self.url
                .parse()
                .map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
                    url: self.url.clone(),
                    kind: InvalidUriKind::ParseError,
                    reason: e.to_string(),
                })?;

        match uri.scheme_str() {
            None => Err(HttpError::InvalidUri {
                url: self.url.clone(),
                kind: InvalidUriKind::MissingScheme,
                reason: "missing scheme".to_owned(),
            }),
            Some("http" | "https") if uri.authority().is_none() => Err(HttpError::InvalidUri {
                url: self.url.clone(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "missing host/authority".to_owned(),
            }),
            Some("http" | "https") => Ok(uri),
            Some(scheme) => Err(HttpError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            }),
        }
    }

    fn into_request(mut self) -> Result<(HttpClient, Request<Full<Bytes>>), HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let uri = self.parse_url()?;

        let mut builder = Request::builder().method(self.method).uri(uri);

        let has_content_type = self.headers.iter().any(|(name, _)| name == CONTENT_TYPE);
        if !has_content_type && let Some(content_type) = self.body.default_content_type() {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }

        let body = match self.body {
            BodyKind::Empty => Bytes::new(),
            BodyKind::Bytes(b) | BodyKind::Json(b) | BodyKind::Form(b) => b,
        };

        Ok((self.client, builder.body(Full::new(body))?))
    }

    /// Send the request and return the buffered response
    ///
    /// Non-2xx statuses are returned as `Ok`; use
    /// [`HttpResponse::error_for_status`] or the checked body accessors.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if:
    /// - Request building failed (invalid headers, query, URL)
    /// - The pool is exhausted or the client is closed
    /// - A transport error persisted after retries
    /// - The read timeout elapsed or the body exceeded `max_body_size`
    pub async fn send(self) -> Result<HttpResponse, HttpError> {
        let (client, request) = self.into_request()?;
        client.execute(request).await
    }
}
