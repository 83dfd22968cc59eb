//! Process-wide session state.
//!
//! The signed-in part of a session lives in one `Arc<Credentials>`, so an
//! access token never exists without its user and every reader sees either
//! the old or the new credentials as a whole. All mutations go through a
//! short write lock; nothing is awaited while it is held.
//!
//! Vault writes happen after the lock is released, so each mutation takes a
//! generation number under the lock and the vault only accepts writes newer
//! than the last one it applied. The vault therefore ends in the state of
//! the latest in-memory mutation, whatever order the writes race in.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{Error, Result, TokenGrant, UserIdentity};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::vault::SessionVault;

const EVENT_CAPACITY: usize = 32;
const MAX_TOKEN_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
    TokenExpired,
    Refreshing,
}

/// Notifications for observers of the session (typically the UI layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { user_id: String },
    Refreshed,
    /// The session ended without the user asking; re-authentication is required.
    Expired { reason: String },
    LoggedOut,
}

/// Everything that makes up an authenticated session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: UserIdentity,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    fn from_grant(grant: TokenGrant, user: UserIdentity, now: DateTime<Utc>) -> Self {
        let lifetime = ChronoDuration::seconds(grant.expires_in.min(MAX_TOKEN_LIFETIME_SECS) as i64);
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            user,
            expires_at: now + lifetime,
        }
    }
}

/// Immutable view of the session at one instant.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    credentials: Option<Arc<Credentials>>,
}

impl Session {
    fn logged_out() -> Self {
        Self {
            state: SessionState::LoggedOut,
            credentials: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.credentials.as_ref().and_then(|c| c.refresh_token.as_deref())
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.credentials.as_ref().map(|c| &c.user)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.credentials.as_ref().map(|c| c.expires_at)
    }
}

/// Holder of the current session. Injected wherever credentials are needed.
pub struct SessionStore {
    current: RwLock<Session>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    vault: Arc<dyn SessionVault>,
    generation: AtomicU64,
    /// Generation of the last vault write; held for the duration of each write.
    vault_generation: Mutex<u64>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("state", &self.state())
            .finish()
    }
}

impl SessionStore {
    /// A logged-out store backed by `vault`.
    pub fn new(vault: Arc<dyn SessionVault>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::LoggedOut);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: RwLock::new(Session::logged_out()),
            state_tx,
            events,
            vault,
            generation: AtomicU64::new(0),
            vault_generation: Mutex::new(0),
        }
    }

    /// Build a store from whatever session the vault holds.
    ///
    /// An unreadable vault is cleared and treated as logged out.
    pub fn restore(vault: Arc<dyn SessionVault>) -> Self {
        let store = Self::new(vault);
        match store.vault.load() {
            Ok(Some(credentials)) => {
                info!("Restored session for user {}", credentials.user.id);
                let mut current = store.write();
                *current = Session {
                    state: SessionState::LoggedIn,
                    credentials: Some(Arc::new(credentials)),
                };
                store.state_tx.send_replace(SessionState::LoggedIn);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Discarding unreadable persisted session: {}", e);
                if let Err(e) = store.vault.clear() {
                    warn!("Failed to clear session vault: {}", e);
                }
            }
        }
        store
    }

    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// LOGGED_OUT (or any state) → LOGGED_IN after a successful credential exchange.
    pub fn establish(&self, grant: TokenGrant, now: DateTime<Utc>) -> Result<Session> {
        let user = grant
            .user
            .clone()
            .ok_or_else(|| Error::Auth("login response did not include a user".into()))?;
        let credentials = Credentials::from_grant(grant, user, now);
        let user_id = credentials.user.id.clone();

        let (session, generation) = {
            let mut current = self.write();
            *current = Session {
                state: SessionState::LoggedIn,
                credentials: Some(Arc::new(credentials)),
            };
            self.state_tx.send_replace(SessionState::LoggedIn);
            (current.clone(), self.next_generation())
        };

        self.sync_vault(generation, session.credentials());
        info!("Signed in as {}", user_id);
        let _ = self.events.send(SessionEvent::LoggedIn { user_id });
        Ok(session)
    }

    /// LOGGED_IN → REFRESHING. Returns false when there is nothing to refresh.
    pub fn begin_refresh(&self) -> bool {
        let mut current = self.write();
        match current.state {
            SessionState::LoggedIn => {
                current.state = SessionState::Refreshing;
                self.state_tx.send_replace(SessionState::Refreshing);
                true
            }
            SessionState::Refreshing => true,
            SessionState::LoggedOut | SessionState::TokenExpired => false,
        }
    }

    /// REFRESHING → LOGGED_IN when a refresh attempt was abandoned midway.
    pub fn abort_refresh(&self) {
        let mut current = self.write();
        if current.state == SessionState::Refreshing {
            current.state = SessionState::LoggedIn;
            self.state_tx.send_replace(SessionState::LoggedIn);
        }
    }

    /// REFRESHING → LOGGED_IN with every credential field replaced at once.
    ///
    /// The user and refresh token carry over when the grant omits them.
    /// Fails if the session ended while the refresh was in flight.
    pub fn apply_refresh(&self, grant: TokenGrant, now: DateTime<Utc>) -> Result<Session> {
        let (session, generation) = {
            let mut current = self.write();
            let previous = match (&current.state, &current.credentials) {
                (SessionState::Refreshing | SessionState::LoggedIn, Some(previous)) => {
                    Arc::clone(previous)
                }
                _ => {
                    return Err(Error::Unauthorized(
                        "session ended while the token was being refreshed".into(),
                    ))
                }
            };

            let user = grant.user.clone().unwrap_or_else(|| previous.user.clone());
            let mut credentials = Credentials::from_grant(grant, user, now);
            if credentials.refresh_token.is_none() {
                credentials.refresh_token = previous.refresh_token.clone();
            }

            *current = Session {
                state: SessionState::LoggedIn,
                credentials: Some(Arc::new(credentials)),
            };
            self.state_tx.send_replace(SessionState::LoggedIn);
            (current.clone(), self.next_generation())
        };

        self.sync_vault(generation, session.credentials());
        info!("Access token refreshed");
        let _ = self.events.send(SessionEvent::Refreshed);
        Ok(session)
    }

    /// LOGGED_IN / REFRESHING → TOKEN_EXPIRED. Credentials are wiped immediately.
    ///
    /// Returns false if there was no live session to expire.
    pub fn expire(&self, reason: &str) -> bool {
        let generation = {
            let mut current = self.write();
            if !matches!(
                current.state,
                SessionState::LoggedIn | SessionState::Refreshing
            ) {
                return false;
            }
            *current = Session {
                state: SessionState::TokenExpired,
                credentials: None,
            };
            self.state_tx.send_replace(SessionState::TokenExpired);
            self.next_generation()
        };

        self.sync_vault(generation, None);
        warn!("Session expired: {}", reason);
        let _ = self.events.send(SessionEvent::Expired {
            reason: reason.to_string(),
        });
        true
    }

    /// Expire the session only if it still uses `token_used`.
    ///
    /// A rejection of a token that a refresh has already replaced says
    /// nothing about the current session.
    pub fn invalidate_if_current(&self, token_used: Option<&str>, reason: &str) -> bool {
        let Some(token_used) = token_used else {
            return false;
        };
        let is_current = self.read().access_token() == Some(token_used);
        if !is_current {
            return false;
        }

        let generation = {
            let mut current = self.write();
            // Re-check under the write lock; a refresh may have landed in between.
            if current.access_token() != Some(token_used) {
                return false;
            }
            *current = Session {
                state: SessionState::TokenExpired,
                credentials: None,
            };
            self.state_tx.send_replace(SessionState::TokenExpired);
            self.next_generation()
        };

        self.sync_vault(generation, None);
        warn!("Session invalidated: {}", reason);
        let _ = self.events.send(SessionEvent::Expired {
            reason: reason.to_string(),
        });
        true
    }

    /// TOKEN_EXPIRED → LOGGED_OUT once the caller has been sent to sign in again.
    pub fn teardown(&self) -> bool {
        {
            let mut current = self.write();
            if current.state != SessionState::TokenExpired {
                return false;
            }
            *current = Session::logged_out();
            self.state_tx.send_replace(SessionState::LoggedOut);
        }
        let _ = self.events.send(SessionEvent::LoggedOut);
        true
    }

    /// Any state → LOGGED_OUT.
    pub fn logout(&self) {
        let generation = {
            let mut current = self.write();
            *current = Session::logged_out();
            self.state_tx.send_replace(SessionState::LoggedOut);
            self.next_generation()
        };
        self.sync_vault(generation, None);
        info!("Signed out");
        let _ = self.events.send(SessionEvent::LoggedOut);
    }

    /// Call with the session write lock held.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store or clear the vault unless a newer mutation already wrote it.
    fn sync_vault(&self, generation: u64, credentials: Option<&Credentials>) {
        let mut written = self
            .vault_generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if generation < *written {
            debug!("Skipping vault write for superseded session change");
            return;
        }
        *written = generation;

        let outcome = match credentials {
            Some(credentials) => self.vault.store(credentials),
            None => self.vault.clear(),
        };
        if let Err(e) = outcome {
            warn!("Failed to update session vault: {}", e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryVault;

    fn user() -> UserIdentity {
        UserIdentity {
            id: "u-1".into(),
            display_name: "Ana".into(),
            email: Some("ana@example.com".into()),
        }
    }

    fn grant(access: &str, refresh: Option<&str>, with_user: bool) -> TokenGrant {
        TokenGrant {
            access_token: access.into(),
            refresh_token: refresh.map(str::to_string),
            expires_in: 3600,
            user: with_user.then(user),
        }
    }

    fn store() -> (SessionStore, Arc<MemoryVault>) {
        let vault = Arc::new(MemoryVault::new());
        (SessionStore::new(vault.clone()), vault)
    }

    #[test]
    fn test_starts_logged_out_and_empty() {
        let (store, _) = store();
        let session = store.snapshot();
        assert_eq!(session.state(), SessionState::LoggedOut);
        assert!(session.access_token().is_none());
        assert!(session.user().is_none());
    }

    #[test]
    fn test_establish_persists_and_notifies() {
        let (store, vault) = store();
        let mut events = store.subscribe_events();
        let state_rx = store.subscribe_state();
        let now = Utc::now();

        let session = store.establish(grant("a1", Some("r1"), true), now).unwrap();
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(session.access_token(), Some("a1"));
        assert_eq!(session.user().map(|u| u.id.as_str()), Some("u-1"));
        assert_eq!(session.expires_at(), Some(now + ChronoDuration::seconds(3600)));

        assert_eq!(*state_rx.borrow(), SessionState::LoggedIn);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LoggedIn {
                user_id: "u-1".into()
            }
        );
        assert_eq!(vault.load().unwrap().map(|c| c.access_token), Some("a1".into()));
    }

    #[test]
    fn test_establish_without_user_is_rejected() {
        let (store, _) = store();
        let err = store.establish(grant("a1", None, false), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(store.state(), SessionState::LoggedOut);
    }

    #[test]
    fn test_refresh_replaces_credentials_and_keeps_user() {
        let (store, _) = store();
        store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();

        assert!(store.begin_refresh());
        assert_eq!(store.state(), SessionState::Refreshing);

        let session = store.apply_refresh(grant("a2", None, false), Utc::now()).unwrap();
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(session.access_token(), Some("a2"));
        assert_eq!(session.refresh_token(), Some("r1"), "refresh token carries over");
        assert_eq!(session.user(), Some(&user()));
    }

    #[test]
    fn test_refresh_after_logout_does_not_resurrect() {
        let (store, _) = store();
        store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
        assert!(store.begin_refresh());
        store.logout();

        assert!(store.apply_refresh(grant("a2", None, false), Utc::now()).is_err());
        assert_eq!(store.state(), SessionState::LoggedOut);
        assert!(store.snapshot().access_token().is_none());
    }

    #[test]
    fn test_begin_refresh_requires_session() {
        let (store, _) = store();
        assert!(!store.begin_refresh());
    }

    #[test]
    fn test_abort_refresh_returns_to_logged_in() {
        let (store, _) = store();
        store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
        store.begin_refresh();
        store.abort_refresh();
        assert_eq!(store.state(), SessionState::LoggedIn);
        assert_eq!(store.snapshot().access_token(), Some("a1"));
    }

    #[test]
    fn test_expire_then_teardown() {
        let (store, vault) = store();
        let mut events = store.subscribe_events();
        store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
        let _ = events.try_recv();

        assert!(store.expire("refresh rejected"));
        let session = store.snapshot();
        assert_eq!(session.state(), SessionState::TokenExpired);
        assert!(session.access_token().is_none() && session.user().is_none());
        assert!(vault.load().unwrap().is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Expired { .. }
        ));

        assert!(!store.expire("again"), "already expired");
        assert!(store.teardown());
        assert_eq!(store.state(), SessionState::LoggedOut);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
    }

    #[test]
    fn test_invalidate_only_matches_current_token() {
        let (store, _) = store();
        store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
        store.begin_refresh();
        store.apply_refresh(grant("a2", None, false), Utc::now()).unwrap();

        assert!(!store.invalidate_if_current(Some("a1"), "stale 401"));
        assert!(!store.invalidate_if_current(None, "anonymous 401"));
        assert_eq!(store.state(), SessionState::LoggedIn);

        assert!(store.invalidate_if_current(Some("a2"), "401"));
        assert_eq!(store.state(), SessionState::TokenExpired);
    }

    #[test]
    fn test_restore_from_vault() {
        let vault = Arc::new(MemoryVault::new());
        vault
            .store(&Credentials {
                access_token: "a1".into(),
                refresh_token: None,
                user: user(),
                expires_at: Utc::now(),
            })
            .unwrap();

        let store = SessionStore::restore(vault);
        assert_eq!(store.state(), SessionState::LoggedIn);
        assert_eq!(store.snapshot().access_token(), Some("a1"));
    }

    /// Vault whose writes take a while, like a slow disk.
    struct SlowVault {
        inner: MemoryVault,
        delay: std::time::Duration,
    }

    impl SessionVault for SlowVault {
        fn load(&self) -> Result<Option<Credentials>> {
            self.inner.load()
        }

        fn store(&self, credentials: &Credentials) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.store(credentials)
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_logout_during_slow_persist_stays_logged_out() {
        let vault = Arc::new(SlowVault {
            inner: MemoryVault::new(),
            delay: std::time::Duration::from_millis(100),
        });
        let store = Arc::new(SessionStore::new(vault.clone()));

        let signing_in = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        store.logout();
        signing_in.join().unwrap();

        assert_eq!(store.state(), SessionState::LoggedOut);
        assert!(vault.load().unwrap().is_none());
        let restarted = SessionStore::restore(vault);
        assert_eq!(restarted.state(), SessionState::LoggedOut);
    }

    #[test]
    fn test_superseded_vault_write_is_skipped() {
        let (store, vault) = store();
        let session = store.establish(grant("a1", Some("r1"), true), Utc::now()).unwrap();
        store.logout();
        assert!(vault.load().unwrap().is_none());

        // The sign-in's write arriving late must not bring the session back.
        store.sync_vault(1, session.credentials());
        assert!(vault.load().unwrap().is_none());

        let session = store.establish(grant("a2", Some("r2"), true), Utc::now()).unwrap();
        assert_eq!(vault.load().unwrap().map(|c| c.access_token), Some("a2".into()));
        assert_eq!(session.access_token(), Some("a2"));
    }

    #[test]
    fn test_readers_never_see_half_a_session() {
        let (store, _) = store();
        let store = Arc::new(store);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    store
                        .establish(grant(&format!("a{i}"), Some("r"), true), Utc::now())
                        .unwrap();
                    if i % 3 == 0 {
                        store.expire("test");
                    } else {
                        store.logout();
                    }
                }
            })
        };

        for _ in 0..2000 {
            let session = store.snapshot();
            assert_eq!(session.access_token().is_some(), session.user().is_some());
            if session.state() == SessionState::LoggedIn {
                assert!(session.access_token().is_some());
            }
        }
        writer.join().unwrap();
    }
}
