use crate::error::HttpError;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use serde::de::DeserializeOwned;

/// Longest body prefix kept in [`HttpError::HttpStatus`] (8 KiB)
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// HTTP response with a fully buffered body.
///
/// The body was read (and bounded by `max_body_size`) before the connection
/// went back to the pool, so every accessor here is synchronous.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn from_response(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    /// Get the response status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the response headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Check status and return error for non-2xx responses
    ///
    /// # Errors
    ///
    /// Returns `HttpError::HttpStatus` (with a body preview) if the response
    /// status is not 2xx.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resp = client.get("https://example.com/api").send().await?;
    /// let body = resp.error_for_status()?.bytes();
    /// ```
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(self.status_error())
    }

    /// Response body without status check
    #[must_use]
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Read response body as text (UTF-8) with status check
    ///
    /// Invalid UTF-8 sequences are replaced with the Unicode replacement character.
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` if status is not 2xx.
    pub fn text(self) -> Result<String, HttpError> {
        let body = self.error_for_status()?.body;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Parse response body as JSON with status check
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` if status is not 2xx.
    /// Returns `HttpError::Json` if parsing fails.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = self.error_for_status()?.body;
        Ok(serde_json::from_slice(&body)?)
    }

    fn status_error(&self) -> HttpError {
        let content_type = self
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let preview = &self.body[..self.body.len().min(ERROR_BODY_PREVIEW_LIMIT)];

        HttpError::HttpStatus {
            status: self.status,
            body_preview: String::from_utf8_lossy(preview).into_owned(),
            content_type,
        }
    }
}
