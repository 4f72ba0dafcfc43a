use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::silent_refresh::{self, RouteKind, SilentRefreshConfig, SilentRefreshHandle};
use super::{
    AuthError, CredentialStore, FileCredentialStore, Identity, LoginFlow, LogoutCoordinator,
    LogoutOutcome, LogoutReason, Navigator, OAuthClient, PkceStore, RefreshCoordinator, Session,
    SessionStore,
};
use crate::api::{ApiClient, ApiResult};
use crate::config::Settings;

/// Wires the session store, login flow, refresh and logout coordinators together for one
/// profile.
pub struct AuthManager {
    session: Arc<SessionStore>,
    refresh: RefreshCoordinator,
    logout: Arc<LogoutCoordinator>,
    login: LoginFlow,
    refresh_buffer: Duration,
}

impl AuthManager {
    pub fn new(
        storage: Arc<dyn CredentialStore>,
        oauth: OAuthClient,
        navigator: Arc<dyn Navigator>,
        profile: impl Into<String>,
    ) -> Self {
        let session = Arc::new(SessionStore::new(storage, profile));
        let pkce = Arc::new(PkceStore::new());
        let logout = Arc::new(LogoutCoordinator::new(
            oauth.clone(),
            session.clone(),
            pkce.clone(),
            navigator.clone(),
        ));
        let refresh = RefreshCoordinator::new(oauth.clone(), session.clone(), logout.clone());
        let login = LoginFlow::new(oauth, session.clone(), pkce, navigator);
        Self {
            session,
            refresh,
            logout,
            login,
            refresh_buffer: silent_refresh::DEFAULT_REFRESH_BUFFER,
        }
    }

    /// Manager backed by the per-user config directory.
    pub fn from_settings(
        settings: &Settings,
        navigator: Arc<dyn Navigator>,
        profile: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let storage = Arc::new(FileCredentialStore::with_default_locator()?);
        let oauth = OAuthClient::from_settings(settings)?;
        Ok(Self::new(storage, oauth, navigator, profile)
            .with_refresh_buffer(settings.refresh_buffer))
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Load whatever the last run persisted.
    pub fn restore(&self) -> Result<bool, AuthError> {
        self.session.hydrate()
    }

    /// Resolve the initial session: keep a token that is still good, refresh one that is
    /// about to expire, and report `None` when there is nothing to work with. Marks the
    /// session hydrated either way.
    pub async fn ensure_fresh_session(&self) -> Result<Option<Session>, AuthError> {
        let usable = self.check_session().await;
        self.session.mark_hydrated();
        usable.map(|usable| usable.then(|| self.session.snapshot()))
    }

    async fn check_session(&self) -> Result<bool, AuthError> {
        let current = self.session.snapshot();
        let buffer = chrono::Duration::from_std(self.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());

        if current.is_authenticated
            && current.expires_at.is_some()
            && !current.will_expire_within(buffer)
        {
            return Ok(true);
        }
        if !self.session.has_refresh_credential() {
            if current.is_authenticated && !current.is_expired() {
                return Ok(true);
            }
            debug!("no usable session");
            return Ok(false);
        }

        match self.refresh.request_refresh().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_fatal() => Ok(false),
            Err(err) => {
                let current = self.session.snapshot();
                if current.is_authenticated && !current.is_expired() {
                    warn!(error = %err, "refresh failed; keeping current token until it expires");
                    Ok(true)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn authenticate_browser<F>(
        &self,
        open_browser: bool,
        notify: F,
    ) -> Result<Identity, AuthError>
    where
        F: Fn(&Url) -> Result<(), AuthError>,
    {
        self.login.run_loopback(open_browser, notify).await
    }

    pub async fn authenticate_manual<Notify, Input, Fut>(
        &self,
        open_browser: bool,
        notify: Notify,
        read_input: Input,
    ) -> Result<Identity, AuthError>
    where
        Notify: Fn(&Url) -> Result<(), AuthError>,
        Input: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AuthError>>,
    {
        self.login.run_manual(open_browser, notify, read_input).await
    }

    pub async fn logout(&self) -> LogoutOutcome {
        self.logout.logout(LogoutReason::UserRequested).await
    }

    pub fn api_client(&self, base_url: Url) -> ApiResult<ApiClient> {
        ApiClient::new(
            base_url,
            self.session.clone(),
            self.refresh.clone(),
            self.logout.clone(),
        )
    }

    /// Start proactive refresh. Runs until the returned handle is dropped.
    pub fn start_silent_refresh(&self, route: RouteKind) -> SilentRefreshHandle {
        silent_refresh::spawn(
            self.session.clone(),
            self.refresh.clone(),
            SilentRefreshConfig::with_buffer(self.refresh_buffer),
            route,
        )
    }
}
