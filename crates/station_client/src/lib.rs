//! Station API client library.
//!
//! Every outbound call passes through an [`InterceptorChain`] that tags it
//! with a request id, attaches the bearer token on protected paths, retries
//! transient failures, reports rejected tokens to the session store and
//! paces calls client-side.

pub mod auth_api;
pub mod interceptors;
pub mod public_paths;
pub mod rate_limit;
pub mod rest;
pub mod transport;

pub use auth_api::HttpAuthApi;
pub use interceptors::{
    CredentialInterceptor, Interceptor, InterceptorChain, Next, PacingInterceptor,
    RequestIdInterceptor, RetryInterceptor, RetryPolicy, UnauthorizedInterceptor,
};
pub use public_paths::PublicPaths;
pub use rate_limit::RateLimiter;
pub use rest::StationApi;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
