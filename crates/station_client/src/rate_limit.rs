//! Client-side request pacing.
//!
//! Two governor buckets, one for reads and one for writes, sized from
//! `[rate_limit]` in the config. On top of the buckets the limiter honours
//! server pacing: a 429 or 503 carrying `Retry-After` holds every later call
//! until the requested instant, so polling and retries back off together.

use chrono::Utc;
use common::config::RateLimitConfig;
use governor::{Quota, RateLimiter as GovLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::transport::ApiResponse;

/// Longest pause a single `Retry-After` may impose.
const MAX_SERVER_BACKOFF: Duration = Duration::from_secs(300);

type DirectLimiter = GovLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Read/write buckets plus a shared server-requested pause.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    reads: Arc<DirectLimiter>,
    writes: Arc<DirectLimiter>,
    paused_until: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// Per-second quotas. A zero quota still admits one call per second.
    pub fn with_limits(reads_per_sec: u32, writes_per_sec: u32) -> Self {
        let quota = |per_sec: u32| Quota::per_second(NonZeroU32::new(per_sec).unwrap_or(NonZeroU32::MIN));
        Self {
            reads: Arc::new(GovLimiter::direct(quota(reads_per_sec))),
            writes: Arc::new(GovLimiter::direct(quota(writes_per_sec))),
            paused_until: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait out any server pause, then for a read slot.
    pub async fn wait_read(&self) {
        self.wait_for_server().await;
        self.reads.until_ready().await;
    }

    /// Wait out any server pause, then for a write slot.
    pub async fn wait_write(&self) {
        self.wait_for_server().await;
        self.writes.until_ready().await;
    }

    pub fn try_read(&self) -> bool {
        self.server_pause().is_none() && self.reads.check().is_ok()
    }

    pub fn try_write(&self) -> bool {
        self.server_pause().is_none() && self.writes.check().is_ok()
    }

    /// Hold all calls for `wait` (capped). An existing longer pause is kept.
    pub fn pause_for(&self, wait: Duration) {
        let until = Instant::now() + wait.min(MAX_SERVER_BACKOFF);
        let mut paused = self.paused_until.lock().unwrap_or_else(|p| p.into_inner());
        if paused.map_or(true, |current| until > current) {
            *paused = Some(until);
        }
    }

    /// Time left on the server-requested pause, if any.
    pub fn server_pause(&self) -> Option<Duration> {
        let paused = *self.paused_until.lock().unwrap_or_else(|p| p.into_inner());
        paused
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Pick up a pacing hint from a throttling response.
    pub fn observe(&self, response: &ApiResponse) {
        if !matches!(response.status, 429 | 503) {
            return;
        }
        if let Some(wait) = response.retry_after(Utc::now()) {
            warn!(
                "Server asked to back off for {:?} (status {})",
                wait.min(MAX_SERVER_BACKOFF),
                response.status
            );
            self.pause_for(wait);
        }
    }

    async fn wait_for_server(&self) {
        let until = *self.paused_until.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(until) = until {
            tokio::time::sleep_until(until).await;
        }
    }
}

impl From<&RateLimitConfig> for RateLimiter {
    fn from(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.reads_per_sec, config.writes_per_sec)
    }
}
