//! Singleflight-style request coordinator.
//!
//! The first caller for a key registers a ticket holding a shared future;
//! every caller that arrives while it is pending awaits that same future.
//! The ticket map is only locked while looking up or inserting a ticket,
//! never while the fetch itself runs.
//!
//! Tickets hold a weak handle to the flight. Waiters hold the strong
//! handles, so dropping one waiter never cancels a fetch others still
//! await, and once the last waiter is gone the fetch is dropped. A guard
//! inside the flight removes its ticket when it settles or is dropped.

use common::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type FlightFuture<T> = BoxFuture<'static, std::result::Result<T, Error>>;
type Flight<T> = Shared<FlightFuture<T>>;

struct Ticket<T> {
    id: u64,
    flight: WeakShared<FlightFuture<T>>,
}

/// Removes the owning ticket when the flight finishes or is dropped.
struct TicketGuard<T> {
    tickets: Arc<DashMap<String, Ticket<T>>>,
    key: String,
    id: u64,
}

impl<T> Drop for TicketGuard<T> {
    fn drop(&mut self) {
        // Only remove our own ticket; a newer flight may already own the key.
        self.tickets.remove_if(&self.key, |_, ticket| ticket.id == self.id);
    }
}

/// Collapses concurrent identical fetches into one in-flight call per key.
pub struct RequestCoordinator<T> {
    tickets: Arc<DashMap<String, Ticket<T>>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for RequestCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("in_flight", &self.tickets.len())
            .finish()
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `operation` for `key` unless a call for `key` is already in flight,
    /// in which case wait for that call and return its outcome.
    ///
    /// `operation` is invoked at most once per flight, lazily, from inside the
    /// shared future. Errors reach every waiter unchanged and are never
    /// replayed to later callers.
    pub async fn run_deduplicated<F, Fut>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (flight, leader) = self.join_or_register(key, operation);
        if !leader {
            debug!("Joined in-flight request: {}", key);
        }
        flight.await
    }

    /// Number of flights currently registered.
    pub fn in_flight(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.tickets.contains_key(key)
    }

    fn join_or_register<F, Fut>(&self, key: &str, operation: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        // The shard lock taken by `entry` makes check-and-insert atomic per key.
        match self.tickets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(flight) = occupied.get().flight.upgrade() {
                    return (flight, false);
                }
                // Every waiter of the old flight went away before it settled.
                let (ticket, flight) = self.new_flight(key, operation);
                match ticket {
                    Some(ticket) => {
                        occupied.insert(ticket);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                (flight, true)
            }
            Entry::Vacant(vacant) => {
                let (ticket, flight) = self.new_flight(key, operation);
                if let Some(ticket) = ticket {
                    vacant.insert(ticket);
                }
                (flight, true)
            }
        }
    }

    fn new_flight<F, Fut>(&self, key: &str, operation: F) -> (Option<Ticket<T>>, Flight<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = TicketGuard {
            tickets: Arc::clone(&self.tickets),
            key: key.to_string(),
            id,
        };

        let flight = async move {
            let _guard = guard;
            operation().await
        }
        .boxed()
        .shared();

        let ticket = flight.downgrade().map(|weak| Ticket { id, flight: weak });
        (ticket, flight)
    }
}

impl<T> Default for RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn counting_op(
        counter: Arc<AtomicUsize>,
        delay: Duration,
        result: Result<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String>> + Send + 'static {
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_invocation() {
        let coordinator = Arc::new(RequestCoordinator::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "historical:StationA:2024-01-01:2024-01-02";

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            let op = counting_op(calls.clone(), Duration::from_millis(200), Ok("series".into()));
            handles.push(tokio::spawn(async move {
                coordinator.run_deduplicated(key, op).await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok("series".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_is_not_replayed() {
        let coordinator = Arc::new(RequestCoordinator::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = Error::Server {
            status: 503,
            message: "unavailable".into(),
        };

        let a = coordinator.run_deduplicated(
            "widget:StationA",
            counting_op(calls.clone(), Duration::from_millis(50), Err(failure.clone())),
        );
        let b = coordinator.run_deduplicated(
            "widget:StationA",
            counting_op(calls.clone(), Duration::from_millis(50), Ok("unused".into())),
        );
        let (ra, rb) = tokio::join!(a, b);

        assert_eq!(ra, Err(failure.clone()));
        assert_eq!(rb, Err(failure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight("widget:StationA"));

        let retry = coordinator
            .run_deduplicated(
                "widget:StationA",
                counting_op(calls.clone(), Duration::from_millis(50), Ok("fresh".into())),
            )
            .await;
        assert_eq!(retry, Ok("fresh".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "a new flight should start");
    }

    #[tokio::test]
    async fn test_slow_key_does_not_block_other_keys() {
        let coordinator = Arc::new(RequestCoordinator::<String>::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run_deduplicated("widget:Slow", move || async move {
                        let _ = release_rx.await;
                        Ok("slow".to_string())
                    })
                    .await
            })
        };

        // Let the slow flight register and park on the channel.
        while !coordinator.is_in_flight("widget:Slow") {
            tokio::task::yield_now().await;
        }

        let fast = coordinator
            .run_deduplicated("widget:Fast", || async { Ok("fast".to_string()) })
            .await;
        assert_eq!(fast, Ok("fast".to_string()));
        assert!(!slow.is_finished(), "slow fetch should still be pending");

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), Ok("slow".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_leader_does_not_cancel_shared_fetch() {
        let coordinator = Arc::new(RequestCoordinator::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coordinator = coordinator.clone();
            let op = counting_op(calls.clone(), Duration::from_millis(100), Ok("done".into()));
            tokio::spawn(async move { coordinator.run_deduplicated("k", op).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let follower = {
            let coordinator = coordinator.clone();
            let op = counting_op(calls.clone(), Duration::from_millis(100), Ok("other".into()));
            tokio::spawn(async move { coordinator.run_deduplicated("k", op).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        assert_eq!(follower.await.unwrap(), Ok("done".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_flight_releases_its_ticket() {
        let coordinator = Arc::new(RequestCoordinator::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let only_waiter = {
            let coordinator = coordinator.clone();
            let op = counting_op(calls.clone(), Duration::from_secs(60), Ok("never".into()));
            tokio::spawn(async move { coordinator.run_deduplicated("k", op).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_in_flight("k"));

        only_waiter.abort();
        let _ = only_waiter.await;
        assert_eq!(coordinator.in_flight(), 0, "ticket must not leak");

        let next = coordinator
            .run_deduplicated(
                "k",
                counting_op(calls.clone(), Duration::from_millis(1), Ok("again".into())),
            )
            .await;
        assert_eq!(next, Ok("again".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
