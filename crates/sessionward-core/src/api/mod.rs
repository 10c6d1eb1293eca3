//! Authenticated API access.
//!
//! This module provides the `ApiClient` request dispatcher together with the
//! pieces it is built from:
//! - `transport`: the HTTP boundary and its reqwest implementation
//! - `refresh`: single-flight token refresh shared by concurrent requests
//! - `retry`: transient-failure classification and backoff
//! - `error`: the error taxonomy surfaced to callers

pub mod client;
pub mod error;
pub mod refresh;
pub mod request;
pub mod retry;
pub mod transport;

pub use client::ApiClient;
pub use error::{ApiError, ErrorBody};
pub use refresh::{RefreshCoordinator, RefreshPhase};
pub use request::{ApiRequest, ApiResponse, RequestKind};
pub use retry::RetryPolicy;
pub use transport::{
    Body, FormPart, FormValue, HttpRequest, HttpResponse, Method, ReqwestTransport, Transport,
    TransportError,
};
