use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{AuthError, CredentialStore, Identity, PersistedSession, TokenResult};

/// Type of token returned by the identity provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Bearer,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Bearer => f.write_str("Bearer"),
        }
    }
}

/// Snapshot of the client's authentication state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user: Option<Identity>,
    pub access_token: Option<String>,
    pub token_type: TokenType,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_authenticated: bool,
    pub is_hydrated: bool,
    pub is_authenticating: bool,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(ts) => Utc::now() >= ts,
            None => false,
        }
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(ts) => Utc::now() + window >= ts,
            None => false,
        }
    }

    /// Value for the `Authorization` header, if a token is held.
    pub fn authorization(&self) -> Option<String> {
        self.access_token
            .as_ref()
            .map(|token| format!("{} {token}", self.token_type))
    }
}

/// Owner of the [`Session`]. All mutation goes through here and every change is a single
/// assignment published to subscribers.
pub struct SessionStore {
    state: watch::Sender<Session>,
    refresh_token: Mutex<Option<String>>,
    /// Held across every login, logout and refresh write so an epoch check and the write
    /// it guards cannot interleave with another lifecycle change.
    epoch: Mutex<u64>,
    storage: Arc<dyn CredentialStore>,
    profile: String,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn CredentialStore>, profile: impl Into<String>) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            state,
            refresh_token: Mutex::new(None),
            epoch: Mutex::new(0),
            storage,
            profile: profile.into(),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Changes on every login and logout; refreshes leave it alone.
    pub fn epoch(&self) -> u64 {
        *self.lifecycle()
    }

    pub fn authorization(&self) -> Option<String> {
        self.state.borrow().authorization()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_slot().clone()
    }

    pub fn has_refresh_credential(&self) -> bool {
        self.refresh_slot().is_some()
    }

    /// Whether there is anything for a logout to tear down.
    pub fn has_credentials(&self) -> bool {
        let state = self.state.borrow();
        state.is_authenticated || state.access_token.is_some() || self.has_refresh_credential()
    }

    /// Restore the persisted session. Does not mark the store hydrated; that waits for
    /// the initial validity check.
    pub fn hydrate(&self) -> Result<bool, AuthError> {
        let _epoch = self.lifecycle();
        let persisted = self.storage.load(&self.profile)?;
        let refresh_token = self.storage.load_refresh_token(&self.profile)?;
        *self.refresh_slot() = refresh_token;

        let Some(persisted) = persisted else {
            debug!(profile = %self.profile, "no persisted session");
            return Ok(false);
        };

        self.state.send_modify(|state| {
            state.user = Some(persisted.user);
            state.access_token = Some(persisted.access_token);
            state.token_type = persisted.token_type;
            state.expires_at = persisted.expires_at;
            state.is_authenticated = true;
        });
        debug!(profile = %self.profile, "session restored from storage");
        Ok(true)
    }

    /// Accept a token from a completed login. Starts a new session epoch; a refresh
    /// credential from an earlier session does not carry over.
    pub fn set_auth(&self, user: Identity, token: &TokenResult) -> Result<(), AuthError> {
        let mut epoch = self.lifecycle();
        let expires_at = token.expires_at(Utc::now())?;
        *epoch += 1;
        if token.refresh_token.is_none() {
            self.refresh_slot().take();
            self.storage.delete_refresh_token(&self.profile)?;
        }
        self.accept(user, token, expires_at)
    }

    /// Accept a refreshed token, unless a login or logout happened since `epoch` was read.
    pub fn apply_refresh(
        &self,
        epoch: u64,
        user: Identity,
        token: &TokenResult,
    ) -> Result<bool, AuthError> {
        let current = self.lifecycle();
        if *current != epoch {
            debug!("discarding refresh result from a previous session");
            return Ok(false);
        }
        let expires_at = token.expires_at(Utc::now())?;
        self.accept(user, token, expires_at)?;
        Ok(true)
    }

    /// Caller holds the epoch lock.
    fn accept(
        &self,
        user: Identity,
        token: &TokenResult,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if let Some(refresh_token) = &token.refresh_token {
            *self.refresh_slot() = Some(refresh_token.clone());
        }

        self.state.send_modify(|state| {
            state.user = Some(user.clone());
            state.access_token = Some(token.access_token.clone());
            state.token_type = token.token_type;
            state.expires_at = Some(expires_at);
            state.is_authenticated = true;
        });

        if let Some(refresh_token) = &token.refresh_token {
            self.storage
                .save_refresh_token(&self.profile, refresh_token)?;
        }
        self.storage.save(
            &self.profile,
            &PersistedSession {
                user,
                access_token: token.access_token.clone(),
                token_type: token.token_type,
                expires_at: Some(expires_at),
            },
        )
    }

    /// Reset to the empty session, in memory and on disk. Hydration is not undone.
    pub fn logout(&self) -> Result<(), AuthError> {
        let mut epoch = self.lifecycle();
        *epoch += 1;
        self.refresh_slot().take();
        self.state.send_modify(|state| {
            *state = Session {
                is_hydrated: state.is_hydrated,
                ..Session::default()
            };
        });
        self.storage.delete(&self.profile).map_err(|err| {
            warn!(error = %err, "failed to delete persisted session");
            err
        })
    }

    /// First resolution of the initial session state. Later calls change nothing.
    pub fn mark_hydrated(&self) {
        self.state.send_if_modified(|state| {
            if state.is_hydrated {
                false
            } else {
                state.is_hydrated = true;
                true
            }
        });
    }

    pub fn set_authenticating(&self, value: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_authenticating != value;
            state.is_authenticating = value;
            changed
        });
    }

    fn lifecycle(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
