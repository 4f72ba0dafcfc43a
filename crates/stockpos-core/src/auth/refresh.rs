//! Single-flight token refresh.
//!
//! [`RefreshCoordinator::request_refresh`] guarantees that at most one refresh call is in
//! flight: the first caller spawns the refresh task and parks a shared handle to it, every
//! caller that arrives while it runs awaits that same handle. The task runs to completion
//! even if every caller goes away, and clears the slot on its way out whatever happened.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::{
    AuthError, Identity, LogoutCoordinator, LogoutReason, OAuthClient, SessionStore, TokenResult,
};

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenResult, AuthError>>>;

/// Retry schedule for transient refresh failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

struct Inner {
    oauth: OAuthClient,
    session: Arc<SessionStore>,
    logout: Arc<LogoutCoordinator>,
    policy: RetryPolicy,
    slot: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

/// Owns the in-flight refresh. Cheap to clone; clones share the slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        oauth: OAuthClient,
        session: Arc<SessionStore>,
        logout: Arc<LogoutCoordinator>,
    ) -> Self {
        Self::with_policy(oauth, session, logout, RetryPolicy::default())
    }

    pub fn with_policy(
        oauth: OAuthClient,
        session: Arc<SessionStore>,
        logout: Arc<LogoutCoordinator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                oauth,
                session,
                logout,
                policy,
                slot: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.slot().is_some()
    }

    /// Forget the in-flight refresh. The task itself still runs to completion; callers
    /// arriving after this start a new one.
    pub fn reset(&self) {
        self.inner.slot().take();
    }

    /// Refresh the access token, joining the refresh already in flight if there is one.
    pub async fn request_refresh(&self) -> Result<TokenResult, AuthError> {
        if self.inner.session.snapshot().is_authenticating {
            debug!("refresh suppressed while authenticating");
            return Err(AuthError::RefreshSuppressed);
        }

        let future = {
            let mut slot = self.inner.slot();
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(refresh = in_flight.id, "joining in-flight refresh");
                    in_flight.future.clone()
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(run(self.inner.clone(), id));
                    let future = async move {
                        task.await
                            .unwrap_or_else(|err| Err(AuthError::RefreshAborted(err.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        future.await
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh_with_retry(&self, refresh_token: &str) -> Result<TokenResult, AuthError> {
        let mut attempt = 1;
        loop {
            match self.oauth.refresh(refresh_token).await {
                Ok(token) => return Ok(token),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(attempt, error = %err, ?delay, "token refresh failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply(&self, epoch: u64, token: &TokenResult) -> Result<(), AuthError> {
        let user = self
            .session
            .snapshot()
            .user
            .or_else(|| Identity::from_access_token(&token.access_token))
            .unwrap_or_else(Identity::unknown);
        self.session.apply_refresh(epoch, user, token).map(|_| ())
    }
}

async fn run(inner: Arc<Inner>, id: u64) -> Result<TokenResult, AuthError> {
    let _clear = ClearSlot { inner: &inner, id };
    let epoch = inner.session.epoch();

    let result = match inner.session.refresh_token() {
        Some(refresh_token) => {
            debug!(refresh = id, "refreshing access token");
            inner.refresh_with_retry(&refresh_token).await
        }
        None => Err(AuthError::RefreshUnavailable),
    };

    match &result {
        Ok(token) => {
            if let Err(err) = inner.apply(epoch, token) {
                warn!(error = %err, "refreshed token could not be persisted");
            }
            info!(refresh = id, expires_in = token.expires_in, "access token refreshed");
        }
        Err(err) if err.is_fatal() => {
            warn!(refresh = id, error = %err, "refresh credential rejected; signing out");
            inner.logout.logout(LogoutReason::SessionExpired).await;
        }
        Err(err) => {
            warn!(refresh = id, error = %err, "token refresh failed");
        }
    }

    result
}

/// Empties the slot when the refresh task finishes, unless a newer refresh already took it.
struct ClearSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for ClearSlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot();
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == self.id) {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, MemoryCredentialStore};
    use crate::testing::{coordinators, memory_session, operator, refresh_body, token};
    use httpmock::prelude::*;

    fn coordinator(base_url: &str, session: Arc<SessionStore>) -> RefreshCoordinator {
        coordinators(base_url, session).refresh
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_call() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_contains("refresh_token=r-1");
            then.status(200)
                .json_body_obj(&refresh_body("fresh"))
                .delay(Duration::from_millis(200));
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let coordinator = coordinator(&server.base_url(), session.clone());

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.request_refresh().await })
            })
            .collect();

        for caller in callers {
            let result = caller.await.unwrap().unwrap();
            assert_eq!(result.access_token, "fresh");
        }
        mock.assert_hits(1);
        assert_eq!(session.authorization().as_deref(), Some("Bearer fresh"));
        assert_eq!(session.snapshot().user, Some(operator()));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_rejection() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(400)
                .json_body_obj(&serde_json::json!({ "error": "invalid_grant" }))
                .delay(Duration::from_millis(100));
        });
        server.mock(|when, then| {
            when.method(POST).path("/logout");
            then.status(204);
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let wired = coordinators(&server.base_url(), session.clone());
        let (coordinator, navigator) = (wired.refresh, wired.navigator);

        let (a, b, c) = tokio::join!(
            coordinator.request_refresh(),
            coordinator.request_refresh(),
            coordinator.request_refresh()
        );
        for result in [a, b, c] {
            assert!(matches!(result, Err(AuthError::InvalidGrant(_))));
        }
        mock.assert_hits(1);
        assert!(!session.has_credentials());
        assert_eq!(navigator.destinations().len(), 1);
    }

    #[tokio::test]
    async fn invalid_grant_stops_further_refreshes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(401)
                .json_body_obj(&serde_json::json!({ "error": "invalid_grant" }));
        });
        server.mock(|when, then| {
            when.method(POST).path("/logout");
            then.status(204);
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let coordinator = coordinator(&server.base_url(), session.clone());

        assert!(coordinator.request_refresh().await.unwrap_err().is_fatal());
        assert!(!session.snapshot().is_authenticated);

        let again = coordinator.request_refresh().await.unwrap_err();
        assert!(matches!(again, AuthError::RefreshUnavailable));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_surface() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(503);
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let coordinator = coordinator(&server.base_url(), session.clone());

        let err = coordinator.request_refresh().await.unwrap_err();
        assert!(err.is_transient());
        mock.assert_hits(3);
        assert!(session.snapshot().is_authenticated);
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn out_of_range_lifetime_keeps_current_session() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "fresh",
                "token_type": "bearer",
                "expires_in": i64::MAX
            }));
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let coordinator = coordinator(&server.base_url(), session.clone());

        let err = coordinator.request_refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenLifetime(_)));
        mock.assert_hits(1);
        assert_eq!(session.authorization().as_deref(), Some("Bearer stale"));
        assert!(session.has_refresh_credential());
    }

    #[tokio::test]
    async fn suppressed_while_authenticating() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&refresh_body("fresh"));
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        session.set_authenticating(true);
        let coordinator = coordinator(&server.base_url(), session);

        let err = coordinator.request_refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshSuppressed));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn restored_refresh_credential_derives_identity() {
        let server = MockServer::start();
        let access = crate::auth::identity::jwt_for(serde_json::json!({
            "sub": "9",
            "username": "gerente"
        }));
        server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_contains("refresh_token=r-1");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": access,
                "refresh_token": "r-2",
                "token_type": "bearer",
                "expires_in": 600
            }));
        });

        // Only the refresh credential survived the restart.
        let storage = Arc::new(MemoryCredentialStore::new());
        storage.save_refresh_token("default", "r-1").unwrap();
        let session = Arc::new(SessionStore::new(storage.clone(), "default"));
        assert!(!session.hydrate().unwrap());

        let coordinator = coordinator(&server.base_url(), session.clone());
        coordinator.request_refresh().await.unwrap();

        let snapshot = session.snapshot();
        assert!(snapshot.is_authenticated);
        let user = snapshot.user.unwrap();
        assert_eq!(user.id, "9");
        assert_eq!(user.name, "gerente");
        assert_eq!(session.refresh_token().as_deref(), Some("r-2"));
        assert_eq!(
            storage.load_refresh_token("default").unwrap().as_deref(),
            Some("r-2")
        );
    }

    #[tokio::test]
    async fn reset_starts_a_new_flight() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .json_body_obj(&refresh_body("fresh"))
                .delay(Duration::from_millis(100));
        });

        let session = memory_session();
        session.set_auth(operator(), &token("stale", Some("r-1"))).unwrap();
        let coordinator = coordinator(&server.base_url(), session);

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_refresh().await })
        };
        while !coordinator.is_in_flight() {
            tokio::task::yield_now().await;
        }
        coordinator.reset();
        coordinator.request_refresh().await.unwrap();
        first.await.unwrap().unwrap();
        mock.assert_hits(2);
    }
}
