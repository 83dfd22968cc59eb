//! Token lifecycle: when to refresh, how to refresh, what a failure means.
//!
//! Refreshes run through a [`RequestCoordinator`] under a single key, so any
//! number of protected calls that find the token expiring share one refresh.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, LoginRequest, Result, TokenGrant};
use flight::RequestCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::{Session, SessionState, SessionStore};

const REFRESH_KEY: &str = "refresh";

/// Credential exchange and refresh endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Server-side revocation. Best effort; the local session is gone either way.
    async fn logout(&self, _access_token: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Absent,
    Valid,
    /// Inside the refresh buffer but not yet expired.
    ExpiringSoon,
    Expired,
}

pub fn assess_token(session: &Session, now: DateTime<Utc>, refresh_buffer: Duration) -> TokenStatus {
    let Some(expires_at) = session.expires_at() else {
        return TokenStatus::Absent;
    };
    match (expires_at - now).to_std() {
        // Negative remaining lifetime.
        Err(_) => TokenStatus::Expired,
        Ok(remaining) if remaining.is_zero() => TokenStatus::Expired,
        Ok(remaining) if remaining <= refresh_buffer => TokenStatus::ExpiringSoon,
        Ok(_) => TokenStatus::Valid,
    }
}

/// Puts the session back to LOGGED_IN if a refresh is dropped before it settles.
struct RefreshGuard {
    store: Arc<SessionStore>,
    armed: bool,
}

impl RefreshGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.armed {
            self.store.abort_refresh();
        }
    }
}

pub struct TokenLifecycle {
    store: Arc<SessionStore>,
    auth: Arc<dyn AuthApi>,
    refresh_buffer: Duration,
    refreshes: RequestCoordinator<String>,
}

impl std::fmt::Debug for TokenLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycle")
            .field("store", &self.store)
            .field("refresh_buffer", &self.refresh_buffer)
            .field("refreshes", &self.refreshes)
            .finish()
    }
}

impl TokenLifecycle {
    pub fn new(store: Arc<SessionStore>, auth: Arc<dyn AuthApi>, refresh_buffer: Duration) -> Self {
        Self {
            store,
            auth,
            refresh_buffer,
            refreshes: RequestCoordinator::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn status(&self) -> TokenStatus {
        assess_token(&self.store.snapshot(), Utc::now(), self.refresh_buffer)
    }

    pub async fn login(&self, request: LoginRequest) -> Result<Session> {
        debug!("Signing in: {:?}", request);
        let grant = self.auth.login(&request).await?;
        self.store.establish(grant, Utc::now())
    }

    /// Clear the local session, then ask the server to revoke the token.
    pub async fn logout(&self) {
        let token = self.store.snapshot().access_token().map(str::to_string);
        self.store.logout();
        if let Some(token) = token {
            if let Err(e) = self.auth.logout(&token).await {
                warn!("Server-side sign-out failed: {}", e);
            }
        }
    }

    /// The token a protected call should carry, refreshing first if needed.
    ///
    /// Returns `None` when there is no usable session; the call then goes
    /// out without a credential and the server decides.
    pub async fn access_token(&self) -> Option<String> {
        let session = self.store.snapshot();
        match assess_token(&session, Utc::now(), self.refresh_buffer) {
            TokenStatus::Absent => None,
            TokenStatus::Valid => session.access_token().map(str::to_string),
            TokenStatus::ExpiringSoon | TokenStatus::Expired => match self.refresh().await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("Proceeding without credentials: {}", e);
                    None
                }
            },
        }
    }

    /// Refresh the access token, joining a refresh already in flight.
    ///
    /// On failure the session moves to TOKEN_EXPIRED and the error is returned.
    pub async fn refresh(&self) -> Result<String> {
        let store = Arc::clone(&self.store);
        let auth = Arc::clone(&self.auth);
        let buffer = self.refresh_buffer;

        self.refreshes
            .run_deduplicated(REFRESH_KEY, move || async move {
                // A refresh that finished just before this flight started may
                // already have produced a good token.
                let session = store.snapshot();
                match assess_token(&session, Utc::now(), buffer) {
                    TokenStatus::Absent => {
                        return Err(Error::Unauthorized("no active session".into()));
                    }
                    TokenStatus::Valid => {
                        if let Some(token) = session.access_token() {
                            return Ok(token.to_string());
                        }
                    }
                    TokenStatus::ExpiringSoon | TokenStatus::Expired => {}
                }

                let Some(refresh_token) = session.refresh_token().map(str::to_string) else {
                    store.expire("access token expired and no refresh token is available");
                    return Err(Error::Unauthorized("session expired".into()));
                };

                if !store.begin_refresh() {
                    return Err(Error::Unauthorized("session ended".into()));
                }
                let guard = RefreshGuard {
                    store: Arc::clone(&store),
                    armed: true,
                };

                debug!("Refreshing access token");
                let outcome = auth.refresh(&refresh_token).await;
                guard.disarm();

                match outcome {
                    Ok(grant) => {
                        let session = store.apply_refresh(grant, Utc::now())?;
                        session
                            .access_token()
                            .map(str::to_string)
                            .ok_or_else(|| Error::Auth("refreshed session has no token".into()))
                    }
                    Err(e) => {
                        warn!("Token refresh failed: {}", e);
                        store.expire(&format!("token refresh failed: {e}"));
                        Err(e)
                    }
                }
            })
            .await
    }

    /// One pass of the periodic check: refresh proactively inside the buffer.
    pub async fn check_session(&self) -> SessionState {
        match self.status() {
            TokenStatus::ExpiringSoon | TokenStatus::Expired => {
                if let Err(e) = self.refresh().await {
                    debug!("Periodic refresh did not succeed: {}", e);
                }
            }
            TokenStatus::Absent | TokenStatus::Valid => {}
        }
        self.store.state()
    }

    /// Run [`check_session`](Self::check_session) every `every` until the handle is aborted.
    pub fn spawn_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            info!("Session monitor running every {:?}", every);
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let state = lifecycle.check_session().await;
                debug!("Session check: {:?}", state);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionEvent;
    use crate::vault::MemoryVault;
    use common::UserIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubAuth {
        refresh_calls: AtomicUsize,
        revoked: Mutex<Vec<String>>,
        refresh_result: Result<TokenGrant>,
        delay: Duration,
    }

    impl StubAuth {
        fn new(refresh_result: Result<TokenGrant>) -> Arc<Self> {
            Arc::new(Self {
                refresh_calls: AtomicUsize::new(0),
                revoked: Mutex::new(Vec::new()),
                refresh_result,
                delay: Duration::from_millis(100),
            })
        }
    }

    #[async_trait]
    impl AuthApi for StubAuth {
        async fn login(&self, _request: &LoginRequest) -> Result<TokenGrant> {
            Ok(grant("a1", Some("r1"), 3600))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
            assert_eq!(refresh_token, "r1");
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.refresh_result.clone()
        }

        async fn logout(&self, access_token: &str) -> Result<()> {
            self.revoked.lock().unwrap().push(access_token.to_string());
            Ok(())
        }
    }

    fn grant(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenGrant {
        TokenGrant {
            access_token: access.into(),
            refresh_token: refresh.map(str::to_string),
            expires_in,
            user: Some(UserIdentity {
                id: "u-1".into(),
                display_name: "Ana".into(),
                email: None,
            }),
        }
    }

    fn lifecycle(auth: Arc<StubAuth>) -> Arc<TokenLifecycle> {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryVault::new())));
        Arc::new(TokenLifecycle::new(store, auth, Duration::from_secs(300)))
    }

    #[test]
    fn test_assess_token_windows() {
        let store = SessionStore::new(Arc::new(MemoryVault::new()));
        let now = Utc::now();
        let buffer = Duration::from_secs(300);
        assert_eq!(assess_token(&store.snapshot(), now, buffer), TokenStatus::Absent);

        store.establish(grant("a", None, 3600), now).unwrap();
        let session = store.snapshot();
        assert_eq!(assess_token(&session, now, buffer), TokenStatus::Valid);
        assert_eq!(
            assess_token(&session, now + chrono::Duration::seconds(3300), buffer),
            TokenStatus::ExpiringSoon
        );
        assert_eq!(
            assess_token(&session, now + chrono::Duration::seconds(3600), buffer),
            TokenStatus::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_refresh() {
        let auth = StubAuth::new(Ok(grant("a2", Some("r2"), 3600)));
        let lifecycle = lifecycle(auth.clone());
        // Inside the 300s buffer.
        lifecycle
            .store()
            .establish(grant("a1", Some("r1"), 60), Utc::now())
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move { lifecycle.access_token().await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some("a2".to_string()));
        }

        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        let session = lifecycle.store().snapshot();
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(session.refresh_token(), Some("r2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_expires_session() {
        let auth = StubAuth::new(Err(Error::Unauthorized("refresh token revoked".into())));
        let lifecycle = lifecycle(auth.clone());
        let mut events = lifecycle.store().subscribe_events();
        lifecycle
            .store()
            .establish(grant("a1", Some("r1"), 10), Utc::now())
            .unwrap();

        assert_eq!(lifecycle.access_token().await, None);
        assert_eq!(lifecycle.store().state(), SessionState::TokenExpired);
        assert!(lifecycle.store().snapshot().access_token().is_none());

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::LoggedIn { .. }));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Expired { .. }));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let auth = StubAuth::new(Ok(grant("unused", None, 3600)));
        let lifecycle = lifecycle(auth.clone());
        lifecycle
            .store()
            .establish(grant("a1", None, 0), Utc::now())
            .unwrap();

        assert!(matches!(lifecycle.refresh().await, Err(Error::Unauthorized(_))));
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.store().state(), SessionState::TokenExpired);
    }

    #[tokio::test]
    async fn test_valid_token_is_used_without_refresh() {
        let auth = StubAuth::new(Ok(grant("a2", None, 3600)));
        let lifecycle = lifecycle(auth.clone());
        lifecycle
            .login(LoginRequest::Password {
                username: "ana".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();

        assert_eq!(lifecycle.access_token().await, Some("a1".to_string()));
        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logout_revokes_and_clears() {
        let auth = StubAuth::new(Ok(grant("a2", None, 3600)));
        let lifecycle = lifecycle(auth.clone());
        lifecycle
            .store()
            .establish(grant("a1", Some("r1"), 3600), Utc::now())
            .unwrap();

        lifecycle.logout().await;
        assert_eq!(lifecycle.store().state(), SessionState::LoggedOut);
        assert_eq!(*auth.revoked.lock().unwrap(), vec!["a1".to_string()]);
        assert_eq!(lifecycle.access_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_refreshes_proactively() {
        let auth = StubAuth::new(Ok(grant("a2", None, 3600)));
        let lifecycle = lifecycle(auth.clone());
        lifecycle
            .store()
            .establish(grant("a1", Some("r1"), 120), Utc::now())
            .unwrap();

        let monitor = lifecycle.spawn_monitor(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.store().snapshot().access_token(), Some("a2"));
        assert_eq!(
            lifecycle.store().snapshot().refresh_token(),
            Some("r1"),
            "refresh token carries over when not rotated"
        );
        monitor.abort();
    }
}
