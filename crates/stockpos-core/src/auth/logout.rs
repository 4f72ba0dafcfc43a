use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Destination, Navigator, OAuthClient, PkceStore, SessionStore};

const EXPIRED_NOTICE: &str = "Your session has expired. Please sign in again.";

/// Why a logout was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutReason {
    /// The operator chose to sign out.
    UserRequested,
    /// The provider rejected the refresh credential.
    SessionExpired,
    /// A request needed a refresh but no refresh credential exists.
    MissingRefreshCredential,
}

impl LogoutReason {
    fn notice(&self) -> Option<String> {
        match self {
            LogoutReason::UserRequested => None,
            LogoutReason::SessionExpired | LogoutReason::MissingRefreshCredential => {
                Some(EXPIRED_NOTICE.to_owned())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// This call tore the session down and navigated away.
    SignedOut,
    /// Another logout was underway; this call did nothing.
    AlreadyInProgress,
    /// There was nothing to tear down; no navigation happened.
    AlreadySignedOut,
}

/// Single path for ending a session, whether the operator asked for it or a refresh
/// failed for good.
pub struct LogoutCoordinator {
    oauth: OAuthClient,
    session: Arc<SessionStore>,
    pkce: Arc<PkceStore>,
    navigator: Arc<dyn Navigator>,
    in_progress: AtomicBool,
}

impl LogoutCoordinator {
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
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn logout(&self, reason: LogoutReason) -> LogoutOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(?reason, "logout already in progress");
            return LogoutOutcome::AlreadyInProgress;
        }
        let _reset = InProgress(&self.in_progress);

        if !self.session.has_credentials() {
            self.pkce.clear();
            debug!(?reason, "logout requested with no session");
            return LogoutOutcome::AlreadySignedOut;
        }

        info!(?reason, "signing out");
        self.session.set_authenticating(true);

        let refresh_token = self.session.refresh_token();
        self.oauth.revoke(refresh_token.as_deref()).await;

        if let Err(err) = self.session.logout() {
            warn!(error = %err, "session cleared in memory only");
        }
        self.pkce.clear();
        self.navigator.navigate(Destination::Login {
            notice: reason.notice(),
        });
        LogoutOutcome::SignedOut
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
