use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;

use super::{AuthError, Identity, TokenType};

/// The part of a session that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub user: Identity,
    pub access_token: String,
    pub token_type: TokenType,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persistence abstraction for the session and the refresh credential.
pub trait CredentialStore: Send + Sync {
    fn load(&self, profile: &str) -> Result<Option<PersistedSession>, AuthError>;
    fn save(&self, profile: &str, session: &PersistedSession) -> Result<(), AuthError>;
    fn load_refresh_token(&self, profile: &str) -> Result<Option<String>, AuthError>;
    fn save_refresh_token(&self, profile: &str, token: &str) -> Result<(), AuthError>;
    fn delete_refresh_token(&self, profile: &str) -> Result<(), AuthError>;
    /// Remove the session and the refresh credential.
    fn delete(&self, profile: &str) -> Result<(), AuthError>;
}

/// Filesystem-backed credential storage located in the user configuration directory.
pub struct FileCredentialStore {
    locator: ConfigLocator,
}

impl FileCredentialStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;

        // `mode` only applies on creation.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(payload.as_bytes())?;
        Ok(())
    }

    fn remove_file(path: &Path) -> Result<(), AuthError> {
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, profile: &str) -> Result<Option<PersistedSession>, AuthError> {
        let path = self.locator.session_file(profile);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let envelope: SessionEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(envelope.session))
    }

    fn save(&self, profile: &str, session: &PersistedSession) -> Result<(), AuthError> {
        let path = self.locator.session_file(profile);
        let envelope = SessionEnvelope {
            profile: profile.to_owned(),
            session: session.clone(),
            version: 1,
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        Self::write_file(&path, &payload)
    }

    fn load_refresh_token(&self, profile: &str) -> Result<Option<String>, AuthError> {
        let path = self.locator.refresh_file(profile);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let envelope: RefreshEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(envelope.refresh_token))
    }

    fn save_refresh_token(&self, profile: &str, token: &str) -> Result<(), AuthError> {
        let path = self.locator.refresh_file(profile);
        let envelope = RefreshEnvelope {
            version: 1,
            refresh_token: token.to_owned(),
        };
        let payload = serde_json::to_string(&envelope)?;
        Self::write_file(&path, &payload)
    }

    fn delete_refresh_token(&self, profile: &str) -> Result<(), AuthError> {
        Self::remove_file(&self.locator.refresh_file(profile))
    }

    fn delete(&self, profile: &str) -> Result<(), AuthError> {
        Self::remove_file(&self.locator.session_file(profile))?;
        Self::remove_file(&self.locator.refresh_file(profile))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    version: u32,
    profile: String,
    session: PersistedSession,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshEnvelope {
    version: u32,
    refresh_token: String,
}

/// Process-local store, for embedding without a filesystem and for tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: Mutex<Option<PersistedSession>>,
    refresh_token: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, _profile: &str) -> Result<Option<PersistedSession>, AuthError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, _profile: &str, session: &PersistedSession) -> Result<(), AuthError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn load_refresh_token(&self, _profile: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_refresh_token(&self, _profile: &str, token: &str) -> Result<(), AuthError> {
        *self
            .refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_owned());
        Ok(())
    }

    fn delete_refresh_token(&self, _profile: &str) -> Result<(), AuthError> {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn delete(&self, _profile: &str) -> Result<(), AuthError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
