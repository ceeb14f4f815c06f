//! Retry decision policy.
//!
//! [`RetryPolicy`] is a pure function of the failure kind, the number of
//! attempts already made and whether the request may be repeated safely. It
//! performs no I/O and can be tested without a network.

use crate::config::DEFAULT_RETRY_COUNT;
use crate::error::FailureKind;

/// Decides whether a failed request attempt is retried.
///
/// `retry_count` bounds the total number of attempts: once `attempt`
/// (1-based, counting the attempt that just failed) reaches it, the request
/// is given up. A `retry_count` of 1 therefore disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT)
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(retry_count: u32) -> Self {
        Self { retry_count }
    }

    /// A policy that never retries
    #[must_use]
    pub const fn disabled() -> Self {
        Self { retry_count: 1 }
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Evaluate the decision table; the first matching rule wins.
    ///
    /// 1. attempts exhausted: give up
    /// 2. peer closed without response: retry, the request was never processed
    /// 3. TLS handshake failure, other TLS errors, interrupted I/O, unknown
    ///    host and connect timeout: give up
    /// 4. anything else: retry only if the request is idempotent (no body, or
    ///    explicitly marked)
    #[must_use]
    pub fn should_retry(&self, failure: FailureKind, attempt: u32, idempotent: bool) -> bool {
        if attempt >= self.retry_count {
            return false;
        }
        match failure {
            FailureKind::PeerClosed => true,
            FailureKind::TlsHandshake
            | FailureKind::Tls
            | FailureKind::Interrupted
            | FailureKind::UnknownHost
            | FailureKind::ConnectTimeout => false,
            FailureKind::Io => idempotent,
        }
    }
}
