use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use super::pkce::ATTEMPT_TTL;
use super::{
    AuthError, Destination, Identity, Navigator, OAuthClient, PkceChallenge, PkceStore,
    SessionStore,
};

const SUCCESS_HTML: &str = r#"<html><body><h1>Signed in to StockPOS</h1><p>You may close this window and return to the terminal.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Sign-in failed</h1><p>Please return to the terminal for details.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

/// Query parameters delivered to the redirect callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }

    /// Parse what the operator pasted: the full redirect URL, or a bare code.
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AuthError::InvalidAuthorizationResponse(
                "empty input".into(),
            ));
        }

        match Url::parse(input) {
            Ok(url) => Ok(Self::from_url(&url)),
            Err(_) => Ok(Self {
                code: Some(input.to_owned()),
                ..Self::default()
            }),
        }
    }

    fn is_callback(&self) -> bool {
        self.code.is_some() || self.state.is_some() || self.error.is_some()
    }
}

/// Authorization-code login with PKCE.
pub struct LoginFlow {
    oauth: OAuthClient,
    session: Arc<SessionStore>,
    pkce: Arc<PkceStore>,
    navigator: Arc<dyn Navigator>,
}

impl LoginFlow {
    pub fn new(
        oauth: OAuthClient,
        session: Arc<SessionStore>,
        pkce: Arc<PkceStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            oauth,
            session,
            pkce,
            navigator,
        }
    }

    /// Start a login attempt. Replaces any pending attempt and returns the URL the
    /// operator's browser should visit.
    pub fn begin(&self) -> Url {
        let challenge = PkceChallenge::generate();
        let url = self.oauth.authorization_url(&challenge);
        self.pkce.save(challenge);
        debug!("login attempt started");
        url
    }

    /// Handle the redirect callback for the pending attempt.
    ///
    /// State and verifier are checked before anything goes to the token endpoint. The
    /// pending attempt is consumed whatever the outcome.
    pub async fn complete(&self, params: CallbackParams) -> Result<Identity, AuthError> {
        self.session.set_authenticating(true);
        let result = self.exchange(params).await;
        self.pkce.clear();
        self.session.set_authenticating(false);

        match &result {
            Ok(user) => {
                info!(user = %user.name, "signed in");
                self.navigator.navigate(Destination::Home);
            }
            Err(err) if err.is_integrity_failure() => {
                warn!(error = %err, "login rejected");
                self.navigator.navigate(Destination::SecurityError {
                    message: err.to_string(),
                });
            }
            Err(AuthError::MissingAuthorizationCode) => {
                self.navigator.navigate(Destination::Login { notice: None });
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                self.navigator.navigate(Destination::Login {
                    notice: Some(err.to_string()),
                });
            }
        }
        result
    }

    async fn exchange(&self, params: CallbackParams) -> Result<Identity, AuthError> {
        if let Some(reason) = params.error {
            return Err(AuthError::AccessDenied(reason));
        }
        let code = params.code.ok_or(AuthError::MissingAuthorizationCode)?;
        let returned = params.state.ok_or(AuthError::MissingAuthorizationCode)?;

        if self.pkce.state().as_deref() != Some(returned.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        let verifier = self.pkce.verifier().ok_or(AuthError::MissingVerifier)?;

        let token = self.oauth.exchange_code(&code, &verifier).await?;
        let user = Identity::from_access_token(&token.access_token).unwrap_or_else(Identity::unknown);
        self.session.set_auth(user.clone(), &token)?;
        Ok(user)
    }

    /// Browser login through a loopback listener on the redirect URI's host and port.
    ///
    /// Port `0` picks a free port; the redirect URI sent to the provider then carries the
    /// bound port.
    pub async fn run_loopback<F>(
        &self,
        open_browser: bool,
        notify_authorization_url: F,
    ) -> Result<Identity, AuthError>
    where
        F: Fn(&Url) -> Result<(), AuthError>,
    {
        let configured = &self.oauth.config().redirect_uri;
        let host = configured.host_str().unwrap_or("127.0.0.1").to_owned();
        let port = configured.port_or_known_default().unwrap_or(0);
        let listener = TcpListener::bind((host.as_str(), port)).await?;

        let mut redirect_uri = configured.clone();
        redirect_uri
            .set_port(Some(listener.local_addr()?.port()))
            .map_err(|_| AuthError::InvalidAuthorizationResponse("redirect URI has no host".into()))?;
        let flow = self.with_redirect(redirect_uri);

        let auth_url = flow.begin();
        notify_authorization_url(&auth_url)?;
        if open_browser {
            open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
        }

        let (mut stream, params) = tokio::time::timeout(ATTEMPT_TTL, accept_callback(&listener))
            .await
            .map_err(|_| AuthError::ListenerClosed)??;

        let result = flow.complete(params).await;
        let page = if result.is_ok() { (200, SUCCESS_HTML) } else { (400, ERROR_HTML) };
        if let Err(err) = respond(&mut stream, page.0, page.1).await {
            debug!(error = %err, "could not answer the browser");
        }
        let _ = stream.shutdown().await;
        result
    }

    /// Copy/paste login for hosts where the redirect cannot reach a local listener.
    pub async fn run_manual<Notify, Input, Fut>(
        &self,
        open_browser: bool,
        notify_authorization_url: Notify,
        read_input: Input,
    ) -> Result<Identity, AuthError>
    where
        Notify: Fn(&Url) -> Result<(), AuthError>,
        Input: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AuthError>>,
    {
        let auth_url = self.begin();
        notify_authorization_url(&auth_url)?;
        if open_browser {
            open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
        }

        let raw = read_input().await?;
        let params = CallbackParams::parse(&raw)?;
        self.complete(params).await
    }

    fn with_redirect(&self, redirect_uri: Url) -> Self {
        Self {
            oauth: self.oauth.clone_with_redirect(redirect_uri),
            session: self.session.clone(),
            pkce: self.pkce.clone(),
            navigator: self.navigator.clone(),
        }
    }
}

/// Wait for the browser's redirect, answering anything else with a 404.
async fn accept_callback(listener: &TcpListener) -> Result<(TcpStream, CallbackParams), AuthError> {
    loop {
        let (mut stream, _addr) = listener.accept().await?;
        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);
        let path = parse_request_path(&request)?;
        let url = Url::parse(&format!("http://localhost{path}"))?;

        let params = CallbackParams::from_url(&url);
        if params.is_callback() {
            return Ok((stream, params));
        }
        respond(&mut stream, 404, NOT_FOUND_HTML).await?;
    }
}

fn parse_request_path(request: &str) -> Result<&str, AuthError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing method".into()))?;
    parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing path".into()))
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
