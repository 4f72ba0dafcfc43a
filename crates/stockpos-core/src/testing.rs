//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::auth::{
    Destination, Identity, LogoutCoordinator, MemoryCredentialStore, Navigator, OAuthClient,
    OAuthConfig, OAuthEndpoints, PkceStore, RefreshCoordinator, RetryPolicy, SessionStore,
    TokenResult, TokenType,
};

pub(crate) fn operator() -> Identity {
    Identity {
        id: "1".into(),
        name: "Operador".into(),
        email: "operador@loja.com".into(),
        roles: vec!["USER".into()],
    }
}

pub(crate) fn token(access: &str, refresh: Option<&str>) -> TokenResult {
    token_expiring_in(access, refresh, 3600)
}

pub(crate) fn token_expiring_in(
    access: &str,
    refresh: Option<&str>,
    expires_in: u64,
) -> TokenResult {
    TokenResult {
        access_token: access.into(),
        token_type: TokenType::Bearer,
        expires_in,
        scope: vec![],
        refresh_token: refresh.map(Into::into),
    }
}

pub(crate) fn oauth_client(base_url: &str) -> OAuthClient {
    let config = OAuthConfig::new(
        "stockpos-test",
        Url::parse("http://localhost/authorized").unwrap(),
    )
    .with_scopes(["openid", "profile"]);
    let endpoints = OAuthEndpoints::from_base(&Url::parse(base_url).unwrap()).unwrap();
    OAuthClient::with_endpoints(config, endpoints).unwrap()
}

pub(crate) fn memory_session() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(
        Arc::new(MemoryCredentialStore::new()),
        "default",
    ))
}

pub(crate) fn refresh_body(access: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": 3600,
        "scope": "openid profile"
    })
}

/// Logout and refresh coordinators wired against a mock provider, with fast retries.
pub(crate) struct Coordinators {
    pub(crate) refresh: RefreshCoordinator,
    pub(crate) logout: Arc<LogoutCoordinator>,
    pub(crate) navigator: Arc<RecordingNavigator>,
}

pub(crate) fn coordinators(base_url: &str, session: Arc<SessionStore>) -> Coordinators {
    let oauth = oauth_client(base_url);
    let navigator = Arc::new(RecordingNavigator::default());
    let logout = Arc::new(LogoutCoordinator::new(
        oauth.clone(),
        session.clone(),
        Arc::new(PkceStore::new()),
        navigator.clone(),
    ));
    let refresh = RefreshCoordinator::with_policy(
        oauth,
        session,
        logout.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        },
    );
    Coordinators {
        refresh,
        logout,
        navigator,
    }
}

#[derive(Default)]
pub(crate) struct RecordingNavigator {
    destinations: Mutex<Vec<Destination>>,
}

impl RecordingNavigator {
    pub(crate) fn destinations(&self) -> Vec<Destination> {
        self.destinations.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, destination: Destination) {
        self.destinations.lock().unwrap().push(destination);
    }
}
