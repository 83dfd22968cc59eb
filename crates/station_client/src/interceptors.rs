//! Request/response pipeline around the transport.
//!
//! Standard order, outermost first:
//!
//! 1. [`RequestIdInterceptor`] tags the call with `x-request-id`.
//! 2. [`CredentialInterceptor`] attaches the bearer token on protected paths.
//! 3. [`RetryInterceptor`] retries network failures and 5xx with backoff.
//! 4. [`UnauthorizedInterceptor`] expires the session when its token is rejected.
//! 5. [`PacingInterceptor`] waits for a read or write slot and backs off on `Retry-After`.
//!
//! Credentials sit outside the retry loop so that every attempt of one call
//! carries the same token, which is the token the 401 observer compares.

use async_trait::async_trait;
use common::config::{BackoffStrategy, ClientConfig, RetryConfig};
use common::Result;
use session::{SessionStore, TokenLifecycle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::public_paths::PublicPaths;
use crate::rate_limit::RateLimiter;
use crate::transport::{ApiRequest, ApiResponse, Transport, AUTHORIZATION};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse>;
}

/// The remainder of the chain. `Copy`, so an interceptor may call it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a dyn Transport,
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub async fn run(self, request: ApiRequest) -> Result<ApiResponse> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    transport: self.transport,
                    rest: tail,
                };
                head.intercept(request, next).await
            }
            None => self.transport.send(&request).await,
        }
    }
}

#[derive(Clone)]
pub struct InterceptorChain {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Vec::new(),
        }
    }

    /// Append an interceptor inside the ones already added.
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// The full pipeline used for data calls.
    pub fn standard(
        transport: Arc<dyn Transport>,
        lifecycle: Arc<TokenLifecycle>,
        config: &ClientConfig,
    ) -> Self {
        let store = Arc::clone(lifecycle.store());
        Self::new(transport)
            .with(RequestIdInterceptor)
            .with(CredentialInterceptor::new(
                lifecycle,
                PublicPaths::new(config.api.public_paths.as_slice()),
            ))
            .with(RetryInterceptor::new(RetryPolicy::from(&config.retry)))
            .with(UnauthorizedInterceptor::new(store))
            .with(PacingInterceptor::new(RateLimiter::from(&config.rate_limit)))
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        Next {
            transport: self.transport.as_ref(),
            rest: &self.interceptors,
        }
        .run(request)
        .await
    }
}

// ── Request id ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdInterceptor;

#[async_trait]
impl Interceptor for RequestIdInterceptor {
    async fn intercept(&self, mut request: ApiRequest, next: Next<'_>) -> Result<ApiResponse> {
        if request.header(REQUEST_ID_HEADER).is_none() {
            request.set_header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        }
        debug!(
            "{} {} [{}]",
            request.method,
            request.path,
            request.header(REQUEST_ID_HEADER).unwrap_or_default()
        );
        next.run(request).await
    }
}

// ── Credentials ───────────────────────────────────────────────────────

pub struct CredentialInterceptor {
    lifecycle: Arc<TokenLifecycle>,
    public: PublicPaths,
}

impl CredentialInterceptor {
    pub fn new(lifecycle: Arc<TokenLifecycle>, public: PublicPaths) -> Self {
        Self { lifecycle, public }
    }
}

#[async_trait]
impl Interceptor for CredentialInterceptor {
    async fn intercept(&self, mut request: ApiRequest, next: Next<'_>) -> Result<ApiResponse> {
        if self.public.is_public(&request.path) {
            request.remove_header(AUTHORIZATION);
            return next.run(request).await;
        }

        match self.lifecycle.access_token().await {
            Some(token) => request.set_bearer(&token),
            None => debug!("No session; sending {} without credentials", request.path),
        }
        next.run(request).await
    }
}

// ── Retry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff: config.backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    async fn intercept(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse> {
        let mut attempt = 1;
        loop {
            let outcome = next.run(request.clone()).await;

            let retryable = match &outcome {
                Ok(resp) => resp.status >= 500,
                Err(e) => e.is_transient(),
            };
            if !retryable || attempt >= self.policy.max_attempts {
                return outcome;
            }

            let delay = self.policy.delay_for(attempt);
            match &outcome {
                Ok(resp) => warn!(
                    "{} {} returned {}, retrying in {:?} (attempt {}/{})",
                    request.method, request.path, resp.status, delay, attempt, self.policy.max_attempts
                ),
                Err(e) => warn!(
                    "{} {} failed: {}, retrying in {:?} (attempt {}/{})",
                    request.method, request.path, e, delay, attempt, self.policy.max_attempts
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// ── Unauthorized ──────────────────────────────────────────────────────

/// Expires the session when the server rejects the token it is still using.
pub struct UnauthorizedInterceptor {
    store: Arc<SessionStore>,
}

impl UnauthorizedInterceptor {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Interceptor for UnauthorizedInterceptor {
    async fn intercept(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse> {
        let token_used = request.bearer_token().map(str::to_string);
        let response = next.run(request.clone()).await?;

        if response.status == 401 {
            let reason = format!("server rejected credentials for {}", request.path);
            if self.store.invalidate_if_current(token_used.as_deref(), &reason) {
                warn!("Session invalidated after 401 on {}", request.path);
            } else {
                debug!("401 on {} did not affect the current session", request.path);
            }
        }
        Ok(response)
    }
}

// ── Pacing ────────────────────────────────────────────────────────────

pub struct PacingInterceptor {
    limiter: RateLimiter,
}

impl PacingInterceptor {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Interceptor for PacingInterceptor {
    async fn intercept(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse> {
        if request.is_write() {
            self.limiter.wait_write().await;
        } else {
            self.limiter.wait_read().await;
        }
        let response = next.run(request).await?;
        self.limiter.observe(&response);
        Ok(response)
    }
}
