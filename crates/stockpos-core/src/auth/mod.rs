mod credential_store;
mod error;
pub(crate) mod identity;
mod login;
mod logout;
mod navigation;
mod oauth;
mod orchestrator;
pub mod pkce;
mod refresh;
mod session;
pub mod silent_refresh;

pub use credential_store::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, PersistedSession,
};
pub use error::AuthError;
pub use identity::Identity;
pub use login::{CallbackParams, LoginFlow};
pub use logout::{LogoutCoordinator, LogoutOutcome, LogoutReason};
pub use navigation::{Destination, Navigator};
pub use oauth::{OAuthClient, OAuthConfig, OAuthEndpoints, TokenResult};
pub use orchestrator::AuthManager;
pub use pkce::{PkceChallenge, PkceStore};
pub use refresh::{RefreshCoordinator, RetryPolicy};
pub use session::{Session, SessionStore, TokenType};
pub use silent_refresh::{
    RouteKind, SchedulerEvent, SchedulerState, SilentRefreshConfig, SilentRefreshHandle,
};
