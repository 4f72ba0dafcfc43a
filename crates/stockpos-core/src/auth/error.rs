use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication and credential management routines.
///
/// The type is `Clone` because one refresh outcome is handed to every caller waiting on
/// it; sources that are not `Clone` themselves are kept behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(Arc<ConfigError>),
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("serialization error: {0}")]
    Serde(#[source] Arc<serde_json::Error>),
    #[error("network error: {0}")]
    Network(#[source] Arc<reqwest::Error>),
    #[error("request to identity provider timed out")]
    Timeout,
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("grant rejected by identity provider: {0}")]
    InvalidGrant(String),
    #[error("invalid token type '{0}'")]
    InvalidTokenType(String),
    #[error("token lifetime of {0} seconds is out of range")]
    InvalidTokenLifetime(u64),
    #[error("no refresh credential available")]
    RefreshUnavailable,
    #[error("refresh skipped while a login or logout is in progress")]
    RefreshSuppressed,
    #[error("refresh task ended unexpectedly: {0}")]
    RefreshAborted(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error("authorization request denied ({0})")]
    AccessDenied(String),
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("PKCE verifier missing for this login attempt")]
    MissingVerifier,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid authorization response: {0}")]
    InvalidAuthorizationResponse(String),
}

impl AuthError {
    /// The provider refused the grant, or there is nothing to refresh with.
    /// Both end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::InvalidGrant(_) | AuthError::RefreshUnavailable)
    }

    /// Failures worth retrying against the token endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(_) | AuthError::Timeout => true,
            AuthError::TokenEndpoint { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Login-integrity failures. These mean the callback may have been tampered with and
    /// are shown as an explicit error instead of a silent redirect.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, AuthError::StateMismatch | AuthError::MissingVerifier)
    }
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Config(Arc::new(err))
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        AuthError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Serde(Arc::new(err))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout
        } else {
            AuthError::Network(Arc::new(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(AuthError::InvalidGrant("invalid_grant".into()).is_fatal());
        assert!(AuthError::RefreshUnavailable.is_fatal());
        assert!(!AuthError::Timeout.is_fatal());

        assert!(AuthError::Timeout.is_transient());
        assert!(AuthError::TokenEndpoint {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        }
        .is_transient());
        assert!(!AuthError::TokenEndpoint {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        }
        .is_transient());

        assert!(AuthError::StateMismatch.is_integrity_failure());
        assert!(AuthError::MissingVerifier.is_integrity_failure());
        assert!(!AuthError::MissingAuthorizationCode.is_integrity_failure());
    }
}
