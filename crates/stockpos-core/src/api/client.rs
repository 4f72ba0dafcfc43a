use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::queue::{PendingQueue, Ticket};
use super::{ApiRequest, AuthenticatedRequest};
use crate::auth::{AuthError, LogoutCoordinator, LogoutReason, RefreshCoordinator, SessionStore};

const USER_AGENT: &str = "stockpos/0.1.0";

/// Errors returned by the application API client.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("HTTP error: {0}")]
    Http(#[source] Arc<reqwest::Error>),
    #[error("HTTP status {status} body: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request rejected as unauthorized after refreshing the session")]
    Unauthorized,
    #[error("session expired; sign in again")]
    SessionExpired,
    #[error("session expired, reload")]
    QueueOverflow,
    #[error("timed out waiting for the session to refresh")]
    QueueTimeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid API URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to (de)serialize payload: {0}")]
    Serde(#[source] Arc<serde_json::Error>),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serde(Arc::new(err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP client for the application API.
///
/// Attaches the current access token to every call and recovers from 401s by refreshing
/// once and replaying. Requests that hit a 401 while another request is already
/// refreshing wait for that refresh instead of starting their own.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base_url: Url,
    session: Arc<SessionStore>,
    refresh: RefreshCoordinator,
    logout: Arc<LogoutCoordinator>,
    queue: PendingQueue,
}

impl ApiClient {
    pub fn new(
        base_url: Url,
        session: Arc<SessionStore>,
        refresh: RefreshCoordinator,
        logout: Arc<LogoutCoordinator>,
    ) -> ApiResult<Self> {
        Self::with_queue(base_url, session, refresh, logout, PendingQueue::default())
    }

    pub fn with_queue(
        mut base_url: Url,
        session: Arc<SessionStore>,
        refresh: RefreshCoordinator,
        logout: Arc<LogoutCoordinator>,
        queue: PendingQueue,
    ) -> ApiResult<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url,
                session,
                refresh,
                logout,
                queue,
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.inner.queue
    }

    /// Send a request, refreshing and replaying once on 401.
    pub async fn send(&self, request: ApiRequest) -> ApiResult<Response> {
        let mut request = AuthenticatedRequest::new(request);
        let mut authorization = self.inner.session.authorization();

        loop {
            request.record_attempt();
            let response = self
                .inner
                .execute(request.request(), authorization.as_deref())
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return error_for_status(response).await;
            }
            if !request.can_replay() {
                warn!(path = request.request().path(), "still unauthorized after refresh");
                return Err(ApiError::Unauthorized);
            }

            debug!(path = request.request().path(), "401 received; recovering session");
            authorization = Some(self.inner.recover(authorization.as_deref()).await?);
        }
    }

    /// Like [`send`](Self::send), but gives up as soon as `cancel` fires. A refresh this
    /// call started keeps running for the benefit of other requests.
    pub async fn send_cancellable(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> ApiResult<Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            result = self.send(request) => result,
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> ApiResult<T> {
        let response = self.send(request).await?;
        decode(response).await
    }

    pub async fn send_json_cancellable<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> ApiResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            result = self.send_json(request) => result,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> ApiResult<T> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |request, (key, value)| {
                request.query(*key, value)
            });
        self.send_json(request).await
    }
}

impl Inner {
    async fn execute(
        &self,
        request: &ApiRequest,
        authorization: Option<&str>,
    ) -> ApiResult<Response> {
        let url = self
            .base_url
            .join(request.path().trim_start_matches('/'))?;
        let mut headers = request.headers().clone();
        headers.remove(AUTHORIZATION);

        let mut builder = self
            .http
            .request(request.method().clone(), url)
            .headers(headers);
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }

    /// Obtain an authorization header worth replaying with after a 401 for `sent`.
    async fn recover(&self, sent: Option<&str>) -> ApiResult<String> {
        if let Some(current) = self.session.authorization() {
            if Some(current.as_str()) != sent {
                debug!("token already rotated; replaying");
                return Ok(current);
            }
        }

        if !self.session.has_refresh_credential() {
            info!("401 with no refresh credential; signing out");
            self.logout
                .logout(LogoutReason::MissingRefreshCredential)
                .await;
            return Err(ApiError::SessionExpired);
        }

        loop {
            match self.queue.enter()? {
                Ticket::Follower(follower) => match follower.wait().await {
                    Some(outcome) => return outcome,
                    None => continue,
                },
                Ticket::Leader(leader) => {
                    let outcome = self.lead_refresh().await;
                    leader.settle(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    async fn lead_refresh(&self) -> ApiResult<String> {
        match self.refresh.request_refresh().await {
            Ok(_) => self.session.authorization().ok_or(ApiError::SessionExpired),
            // The refresh coordinator has already signed out.
            Err(err) if err.is_fatal() => Err(ApiError::SessionExpired),
            Err(err) => Err(err.into()),
        }
    }
}

async fn error_for_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status { status, body })
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
