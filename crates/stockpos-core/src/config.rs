use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_AUTH_URL: &str = "http://localhost:9000";
pub const DEFAULT_CLIENT_ID: &str = "stockpos-cli";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:5173/authorized";
pub const DEFAULT_SCOPES: &[&str; 2] = &["openid", "profile"];
pub const DEFAULT_REFRESH_BUFFER_SECS: u64 = 120;

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "stockpos", "stockpos")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Use an explicit directory instead of the platform default.
    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path to the persisted session (identity, access token, expiry) for a profile.
    pub fn session_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("session-{profile}.json"))
    }

    /// Path to the refresh credential for a profile. Kept apart from the session file so
    /// readers of the session never see it.
    pub fn refresh_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("refresh-{profile}.json"))
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Runtime settings for the identity provider and the application API.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: Url,
    pub auth_url: Url,
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub refresh_buffer: Duration,
}

impl Settings {
    /// Read settings from `STOCKPOS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let api_url = parse_url("STOCKPOS_API_URL", get("STOCKPOS_API_URL"), DEFAULT_API_URL)?;
        let auth_url = parse_url(
            "STOCKPOS_AUTH_URL",
            get("STOCKPOS_AUTH_URL"),
            DEFAULT_AUTH_URL,
        )?;
        let redirect_uri = parse_url(
            "STOCKPOS_REDIRECT_URI",
            get("STOCKPOS_REDIRECT_URI"),
            DEFAULT_REDIRECT_URI,
        )?;
        let client_id = get("STOCKPOS_CLIENT_ID").unwrap_or_else(|| DEFAULT_CLIENT_ID.to_owned());

        let scopes = match get("STOCKPOS_SCOPES") {
            Some(raw) => raw.split_whitespace().map(str::to_owned).collect(),
            None => DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect(),
        };

        let refresh_buffer = match get("STOCKPOS_REFRESH_BUFFER_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    key: "STOCKPOS_REFRESH_BUFFER_SECS",
                    value: raw,
                })?,
            None => Duration::from_secs(DEFAULT_REFRESH_BUFFER_SECS),
        };

        Ok(Self {
            api_url,
            auth_url,
            client_id,
            redirect_uri,
            scopes,
            refresh_buffer,
        })
    }
}

fn parse_url(key: &'static str, value: Option<String>, default: &str) -> Result<Url, ConfigError> {
    let raw = value.unwrap_or_else(|| default.to_owned());
    Url::parse(&raw).map_err(|_| ConfigError::InvalidValue { key, value: raw })
}

/// Errors that can occur when working with configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for stockpos")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
