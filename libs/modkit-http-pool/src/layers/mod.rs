//! Tower layers for HTTP client middleware
//!
//! The client stack is, outermost first:
//! [`TraceHeadersLayer`] → [`UserAgentLayer`] → [`RetryLayer`] → transport.
//!
//! ## Available Layers
//!
//! - [`TraceHeadersLayer`] - Adds B3 trace headers from the current [`TraceContext`]
//! - [`UserAgentLayer`] - Adds User-Agent header to all requests
//! - [`RetryLayer`] - Re-sends requests failing with a retryable transport error

mod retry;
mod trace;
mod user_agent;

pub use retry::{RETRY_ATTEMPT_HEADER, RetryLayer, RetryService};
pub use trace::{
    PARENT_SPAN_ID_HEADER, SAMPLED_HEADER, SPAN_ID_HEADER, TRACE_ID_HEADER, TraceContext,
    TraceHeadersLayer, TraceHeadersService,
};
pub use user_agent::{UserAgentLayer, UserAgentService};
