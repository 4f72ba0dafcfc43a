use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::Settings;

use super::{AuthError, PkceChallenge, TokenType};

const DEFAULT_USER_AGENT: &str = "stockpos/0.1.0";
const DEFAULT_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// OAuth client configuration supplied by consumers.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn new<S: Into<String>>(client_id: S, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            scopes: vec![],
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

/// Identity provider endpoints.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
    pub logout_url: Url,
}

impl OAuthEndpoints {
    /// Standard layout under a provider base URL: `/oauth2/authorize`, `/oauth2/token`,
    /// `/logout`.
    pub fn from_base(base: &Url) -> Result<Self, AuthError> {
        let root = base.as_str().trim_end_matches('/');
        Ok(Self {
            authorization_url: Url::parse(&format!("{root}/oauth2/authorize"))?,
            token_url: Url::parse(&format!("{root}/oauth2/token"))?,
            logout_url: Url::parse(&format!("{root}/logout"))?,
        })
    }
}

/// Outcome of a successful token call.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResult {
    pub access_token: String,
    pub token_type: TokenType,
    /// Lifetime in seconds, as reported by the provider.
    pub expires_in: u64,
    pub scope: Vec<String>,
    /// Present only when the provider rotates the refresh credential.
    pub refresh_token: Option<String>,
}

impl TokenResult {
    /// When the access token stops being valid, counted from `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
        expiry_after(now, self.expires_in)
    }
}

fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> Result<DateTime<Utc>, AuthError> {
    if expires_in == 0 {
        return Err(AuthError::InvalidTokenLifetime(expires_in));
    }
    i64::try_from(expires_in)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or(AuthError::InvalidTokenLifetime(expires_in))
}

/// Performs the token-bearing calls against the identity provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OAuthConfig,
    endpoints: OAuthEndpoints,
    timeout: StdDuration,
}

impl OAuthClient {
    pub fn from_settings(settings: &Settings) -> Result<Self, AuthError> {
        let config = OAuthConfig::new(settings.client_id.clone(), settings.redirect_uri.clone())
            .with_scopes(settings.scopes.clone());
        Self::with_endpoints(config, OAuthEndpoints::from_base(&settings.auth_url)?)
    }

    pub fn with_endpoints(
        config: OAuthConfig,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            http,
            config,
            endpoints,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clone the OAuth client while overriding the redirect URI.
    pub fn clone_with_redirect(&self, redirect_uri: Url) -> Self {
        let mut config = self.config.clone();
        config.redirect_uri = redirect_uri;
        Self {
            http: self.http.clone(),
            config,
            endpoints: self.endpoints.clone(),
            timeout: self.timeout,
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub fn authorization_url(&self, pkce: &PkceChallenge) -> Url {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            if !self.config.scopes.is_empty() {
                pairs.append_pair("scope", &self.config.scopes.join(" "));
            }
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            pairs.append_pair("state", pkce.state());
            pairs.append_pair("code_challenge", pkce.challenge());
            pairs.append_pair("code_challenge_method", "S256");
        }
        url
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResult, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await?;

        handle_token_response(response).await
    }

    /// Obtain a new access token with the refresh credential.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResult, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await?;

        handle_token_response(response).await
    }

    /// Tell the provider the session is over. Never fails: logout goes ahead either way.
    pub async fn revoke(&self, refresh_token: Option<&str>) {
        let mut form = vec![("client_id", self.config.client_id.as_str())];
        if let Some(token) = refresh_token {
            form.push(("token", token));
            form.push(("token_type_hint", "refresh_token"));
        }

        let result = self
            .http
            .post(self.endpoints.logout_url.clone())
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("provider session revoked");
            }
            Ok(response) => {
                warn!(status = %response.status(), "provider logout rejected; clearing locally");
            }
            Err(err) => {
                warn!(error = %err, "provider logout failed; clearing locally");
            }
        }
    }
}

async fn handle_token_response(response: reqwest::Response) -> Result<TokenResult, AuthError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(classify_failure(status, body));
    }

    let payload: TokenResponse = serde_json::from_str(&body)?;
    payload.into_result()
}

/// 400/401 or an explicit `invalid_grant` means the grant is dead; anything else is the
/// provider having trouble.
fn classify_failure(status: StatusCode, body: String) -> AuthError {
    let oauth_error = serde_json::from_str::<TokenErrorResponse>(&body).ok();
    let invalid_grant = oauth_error
        .as_ref()
        .is_some_and(|err| err.error == "invalid_grant");

    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED || invalid_grant {
        let reason = match oauth_error {
            Some(err) => err.error_description.unwrap_or(err.error),
            None if body.is_empty() => status.to_string(),
            None => body,
        };
        AuthError::InvalidGrant(reason)
    } else {
        AuthError::TokenEndpoint { status, body }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: String,
    expires_in: u64,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_result(self) -> Result<TokenResult, AuthError> {
        let token_type = match self.token_type.to_ascii_lowercase().as_str() {
            "bearer" => TokenType::Bearer,
            other => return Err(AuthError::InvalidTokenType(other.to_owned())),
        };
        expiry_after(Utc::now(), self.expires_in)?;

        let scope = self
            .scope
            .unwrap_or_default()
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect();

        Ok(TokenResult {
            access_token: self.access_token,
            token_type,
            expires_in: self.expires_in,
            scope,
            refresh_token: self.refresh_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::oauth_client;
    use httpmock::prelude::*;

    #[test]
    fn authorization_url_carries_pkce_parameters() {
        let client = oauth_client("http://localhost:9000");
        let pkce = PkceChallenge::generate();
        let url = client.authorization_url(&pkce);

        assert_eq!(url.path(), "/oauth2/authorize");
        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };
        assert_eq!(param("response_type").as_deref(), Some("code"));
        assert_eq!(param("client_id").as_deref(), Some("stockpos-test"));
        assert_eq!(param("scope").as_deref(), Some("openid profile"));
        assert_eq!(param("state").as_deref(), Some(pkce.state()));
        assert_eq!(param("code_challenge").as_deref(), Some(pkce.challenge()));
        assert_eq!(param("code_challenge_method").as_deref(), Some("S256"));
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains("grant_type=authorization_code")
                .body_contains("code=code123")
                .body_contains("code_verifier=the-verifier");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "refresh_token": "refresh456",
                "token_type": "bearer",
                "expires_in": 3600,
                "scope": "openid profile"
            }));
        });

        let client = oauth_client(&server.base_url());
        let result = client
            .exchange_code("code123", "the-verifier")
            .await
            .unwrap();
        mock.assert();
        assert_eq!(result.access_token, "abc123");
        assert_eq!(result.refresh_token.as_deref(), Some("refresh456"));
        assert_eq!(result.scope, vec!["openid", "profile"]);
        assert_eq!(result.token_type, TokenType::Bearer);
        assert_eq!(result.expires_in, 3600);
    }

    #[tokio::test]
    async fn refresh_sends_refresh_grant() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=r-1")
                .body_contains("client_id=stockpos-test");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 900,
                "scope": "openid"
            }));
        });

        let client = oauth_client(&server.base_url());
        let result = client.refresh("r-1").await.unwrap();
        mock.assert();
        assert_eq!(result.access_token, "new-access");
        assert!(result.refresh_token.is_none());
    }

    #[tokio::test]
    async fn rejected_grant_is_invalid_grant() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(400).json_body_obj(&serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Refresh token expired"
            }));
        });

        let client = oauth_client(&server.base_url());
        let err = client.refresh("dead").await.unwrap_err();
        mock.assert();
        match err {
            AuthError::InvalidGrant(reason) => assert_eq!(reason, "Refresh token expired"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_grant_body_wins_over_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(403)
                .json_body_obj(&serde_json::json!({ "error": "invalid_grant" }));
        });

        let client = oauth_client(&server.base_url());
        let err = client.exchange_code("bad", "verifier").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(503).body("maintenance");
        });

        let client = oauth_client(&server.base_url());
        let err = client.refresh("r-1").await.unwrap_err();
        match &err {
            AuthError::TokenEndpoint { status, body } => {
                assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).delay(StdDuration::from_millis(500));
        });

        let client = oauth_client(&server.base_url()).with_timeout(StdDuration::from_millis(50));
        let err = client.refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }

    #[tokio::test]
    async fn unsupported_token_type() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc",
                "token_type": "mac",
                "expires_in": 60
            }));
        });

        let client = oauth_client(&server.base_url());
        let err = client.refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenType(kind) if kind == "mac"));
    }

    #[tokio::test]
    async fn unusable_lifetimes_are_rejected() {
        for expires_in in [serde_json::json!(0), serde_json::json!(i64::MAX)] {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "abc",
                    "token_type": "bearer",
                    "expires_in": expires_in
                }));
            });

            let client = oauth_client(&server.base_url());
            let err = client.exchange_code("code", "verifier").await.unwrap_err();
            assert!(
                matches!(err, AuthError::InvalidTokenLifetime(_)),
                "{expires_in}: {err:?}"
            );
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn negative_lifetime_is_a_malformed_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc",
                "token_type": "bearer",
                "expires_in": -5
            }));
        });

        let client = oauth_client(&server.base_url());
        let err = client.refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AuthError::Serde(_)));
    }

    #[test]
    fn expiry_is_checked_arithmetic() {
        let now = Utc::now();
        assert_eq!(
            expiry_after(now, 60).unwrap(),
            now + TimeDelta::try_seconds(60).unwrap()
        );
        assert!(expiry_after(now, 0).is_err());
        assert!(expiry_after(now, u64::MAX).is_err());
        assert!(expiry_after(DateTime::<Utc>::MAX_UTC, 1).is_err());
    }

    #[tokio::test]
    async fn revoke_swallows_failures() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/logout").body_contains("token=r-1");
            then.status(500);
        });

        let client = oauth_client(&server.base_url());
        client.revoke(Some("r-1")).await;
        mock.assert();

        let unreachable = oauth_client("http://127.0.0.1:9");
        unreachable.revoke(None).await;
    }
}
