//! Repository facade over cache, coordinator and remote source.
//!
//! One cache and one coordinator per value type, so every lookup is
//! statically typed. Fetch, validation and cache population all happen
//! inside the shared flight: whichever caller started it, every waiter
//! gets the validated value and the cache is written exactly once.
//!
//! `clear()` starts a new cache epoch. Flights are keyed by epoch, and a
//! flight that started before a clear never writes its result into the
//! cache, so data fetched under an ended session is not served afterwards.

use async_trait::async_trait;
use common::config::CacheConfig;
use common::{
    DateRange, ErrorKind, HistoricalSeries, Result, StationId, StationSummary, WidgetData,
};
use flight::{RequestCoordinator, TtlCache};
use session::{SessionEvent, SessionStore};
use station_client::StationApi;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::request::DataRequest;
use crate::validation::ReadingValidator;

/// Where fresh data comes from.
#[async_trait]
pub trait StationSource: Send + Sync {
    async fn widget_data(&self, station: &StationId) -> Result<WidgetData>;

    async fn historical(&self, station: &StationId, range: &DateRange) -> Result<HistoricalSeries>;

    async fn stations(&self) -> Result<Vec<StationSummary>>;
}

#[async_trait]
impl StationSource for StationApi {
    async fn widget_data(&self, station: &StationId) -> Result<WidgetData> {
        StationApi::widget_data(self, station).await
    }

    async fn historical(&self, station: &StationId, range: &DateRange) -> Result<HistoricalSeries> {
        StationApi::historical(self, station, range).await
    }

    async fn stations(&self) -> Result<Vec<StationSummary>> {
        StationApi::stations(self).await
    }
}

/// Signal sequence delivered to an observer: `Loading` only on a cache miss,
/// then exactly one settled state.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchState<T> {
    Loading,
    Success(T),
    Error { kind: ErrorKind, message: String },
}

impl<T> FetchState<T> {
    pub fn is_settled(&self) -> bool {
        !matches!(self, FetchState::Loading)
    }
}

impl<T> From<Result<T>> for FetchState<T> {
    fn from(outcome: Result<T>) -> Self {
        match outcome {
            Ok(value) => FetchState::Success(value),
            Err(e) => FetchState::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Serve a fresh cached value when there is one.
    #[default]
    CacheFirst,
    /// Skip the cache read (pull-to-refresh). Still deduplicated and cached.
    NetworkOnly,
}

struct Lane<T> {
    cache: Arc<TtlCache<T>>,
    flights: RequestCoordinator<T>,
    epoch: Arc<AtomicU64>,
}

impl<T> Lane<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(epoch: Arc<AtomicU64>) -> Self {
        Self {
            cache: Arc::new(TtlCache::new()),
            flights: RequestCoordinator::new(),
            epoch,
        }
    }

    async fn resolve<F, Fut>(
        &self,
        request: &DataRequest,
        ttl: Duration,
        policy: FetchPolicy,
        on_miss: impl FnOnce(),
        fetch: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = request.cache_key();
        if policy == FetchPolicy::CacheFirst {
            if let Some(hit) = self.cache.get(&key) {
                debug!("Cache hit: {}", key);
                return Ok(hit);
            }
        }
        on_miss();

        let started_in = self.epoch.load(Ordering::SeqCst);
        let epoch = Arc::clone(&self.epoch);
        let cache = Arc::clone(&self.cache);
        let flight_key = key.clone();
        self.flights
            .run_deduplicated(&format!("{key}@{started_in}"), move || async move {
                // A flight for this key may have landed between our miss and now.
                if policy == FetchPolicy::CacheFirst {
                    if let Some(hit) = cache.get(&flight_key) {
                        return Ok(hit);
                    }
                }

                match fetch().await {
                    Ok(value) => {
                        if epoch.load(Ordering::SeqCst) != started_in {
                            debug!("Not caching {}: cache cleared during fetch", flight_key);
                            return Ok(value);
                        }
                        cache.put(flight_key.as_str(), value.clone(), ttl);
                        // A clear may have landed between the check and the put.
                        if epoch.load(Ordering::SeqCst) != started_in {
                            cache.clear(&flight_key);
                            return Ok(value);
                        }
                        debug!("Cached {} for {:?}", flight_key, ttl);
                        Ok(value)
                    }
                    Err(e) => {
                        warn!("Fetch for {} failed: {}", flight_key, e);
                        Err(e)
                    }
                }
            })
            .await
    }
}

struct Inner {
    epoch: Arc<AtomicU64>,
    source: Arc<dyn StationSource>,
    validator: Arc<dyn ReadingValidator>,
    ttl: CacheConfig,
    widgets: Lane<WidgetData>,
    history: Lane<HistoricalSeries>,
    stations: Lane<Vec<StationSummary>>,
}

/// Cheap to clone; clones share caches and in-flight requests.
#[derive(Clone)]
pub struct DataRepository {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRepository")
            .field("cached_widgets", &self.inner.widgets.cache.len())
            .field("cached_history", &self.inner.history.cache.len())
            .field("cached_stations", &self.inner.stations.cache.len())
            .finish()
    }
}

impl DataRepository {
    pub fn new(
        source: Arc<dyn StationSource>,
        validator: Arc<dyn ReadingValidator>,
        ttl: CacheConfig,
    ) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        Self {
            inner: Arc::new(Inner {
                source,
                validator,
                ttl,
                widgets: Lane::new(Arc::clone(&epoch)),
                history: Lane::new(Arc::clone(&epoch)),
                stations: Lane::new(Arc::clone(&epoch)),
                epoch,
            }),
        }
    }

    // ── Direct access ─────────────────────────────────────────────────

    pub async fn widget(&self, station: &StationId, policy: FetchPolicy) -> Result<WidgetData> {
        self.widget_with(station, policy, || {}).await
    }

    pub async fn historical(
        &self,
        station: &StationId,
        range: DateRange,
        policy: FetchPolicy,
    ) -> Result<HistoricalSeries> {
        self.historical_with(station, range, policy, || {}).await
    }

    pub async fn stations(&self, policy: FetchPolicy) -> Result<Vec<StationSummary>> {
        self.stations_with(policy, || {}).await
    }

    // ── Observed access ───────────────────────────────────────────────

    /// Fetch in the background and report progress on the returned channel.
    ///
    /// Dropping the receiver does not cancel the fetch; its result is still cached.
    pub fn observe_widget(
        &self,
        station: &StationId,
        policy: FetchPolicy,
    ) -> mpsc::UnboundedReceiver<FetchState<WidgetData>> {
        let repo = self.clone();
        let station = station.clone();
        observe(move |on_miss| async move { repo.widget_with(&station, policy, on_miss).await })
    }

    pub fn observe_historical(
        &self,
        station: &StationId,
        range: DateRange,
        policy: FetchPolicy,
    ) -> mpsc::UnboundedReceiver<FetchState<HistoricalSeries>> {
        let repo = self.clone();
        let station = station.clone();
        observe(move |on_miss| async move {
            repo.historical_with(&station, range, policy, on_miss).await
        })
    }

    pub fn observe_stations(
        &self,
        policy: FetchPolicy,
    ) -> mpsc::UnboundedReceiver<FetchState<Vec<StationSummary>>> {
        let repo = self.clone();
        observe(move |on_miss| async move { repo.stations_with(policy, on_miss).await })
    }

    // ── Cache control ─────────────────────────────────────────────────

    /// Drop the cached response for one request. Returns whether one existed.
    pub fn invalidate(&self, request: &DataRequest) -> bool {
        let key = request.cache_key();
        match request {
            DataRequest::Widget { .. } => self.inner.widgets.cache.clear(&key),
            DataRequest::Historical { .. } => self.inner.history.cache.clear(&key),
            DataRequest::Stations => self.inner.stations.cache.clear(&key),
        }
    }

    /// Drop every cached response, including ones still being fetched.
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.widgets.cache.clear_all();
        self.inner.history.cache.clear_all();
        self.inner.stations.cache.clear_all();
        info!("Cleared cached station data");
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.widgets.cache.purge_expired()
            + self.inner.history.cache.purge_expired()
            + self.inner.stations.cache.purge_expired()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.widgets.flights.in_flight()
            + self.inner.history.flights.in_flight()
            + self.inner.stations.flights.in_flight()
    }

    /// Clear cached data whenever the session ends, so one user's readings
    /// are never served to the next.
    pub fn spawn_session_watch(&self, store: &SessionStore) -> JoinHandle<()> {
        let repo = self.clone();
        let mut events = store.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::LoggedOut) | Ok(SessionEvent::Expired { .. }) => repo.clear(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Session watcher missed {} events; clearing cache", missed);
                        repo.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodically drop expired entries that nobody has read since.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let repo = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = repo.purge_expired();
                if removed > 0 {
                    debug!("Swept {} expired cache entries", removed);
                }
            }
        })
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn widget_with(
        &self,
        station: &StationId,
        policy: FetchPolicy,
        on_miss: impl FnOnce(),
    ) -> Result<WidgetData> {
        let request = DataRequest::Widget {
            station: station.clone(),
        };
        let ttl = request.ttl(&self.inner.ttl);
        let source = Arc::clone(&self.inner.source);
        let validator = Arc::clone(&self.inner.validator);
        let station = station.clone();

        self.inner
            .widgets
            .resolve(&request, ttl, policy, on_miss, move || async move {
                let raw = source.widget_data(&station).await?;
                validator.validate_widget(raw)
            })
            .await
    }

    async fn historical_with(
        &self,
        station: &StationId,
        range: DateRange,
        policy: FetchPolicy,
        on_miss: impl FnOnce(),
    ) -> Result<HistoricalSeries> {
        let request = DataRequest::Historical {
            station: station.clone(),
            range,
        };
        let ttl = request.ttl(&self.inner.ttl);
        let source = Arc::clone(&self.inner.source);
        let validator = Arc::clone(&self.inner.validator);
        let station = station.clone();

        self.inner
            .history
            .resolve(&request, ttl, policy, on_miss, move || async move {
                let raw = source.historical(&station, &range).await?;
                validator.validate_series(raw)
            })
            .await
    }

    async fn stations_with(
        &self,
        policy: FetchPolicy,
        on_miss: impl FnOnce(),
    ) -> Result<Vec<StationSummary>> {
        let request = DataRequest::Stations;
        let ttl = request.ttl(&self.inner.ttl);
        let source = Arc::clone(&self.inner.source);

        self.inner
            .stations
            .resolve(&request, ttl, policy, on_miss, move || async move {
                source.stations().await
            })
            .await
    }
}

type OnMiss = Box<dyn FnOnce() + Send>;

fn observe<T, F, Fut>(run: F) -> mpsc::UnboundedReceiver<FetchState<T>>
where
    T: Send + 'static,
    F: FnOnce(OnMiss) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let loading = tx.clone();
    tokio::spawn(async move {
        let on_miss: OnMiss = Box::new(move || {
            let _ = loading.send(FetchState::Loading);
        });
        let outcome = run(on_miss).await;
        let _ = tx.send(FetchState::from(outcome));
    });
    rx
}
