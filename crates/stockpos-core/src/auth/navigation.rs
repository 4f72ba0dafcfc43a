/// Where the front-end should take the operator next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The unauthenticated entry point, with an optional neutral notice.
    Login { notice: Option<String> },
    /// Landing screen after a completed login.
    Home,
    /// Explicit error screen for login-integrity failures.
    SecurityError { message: String },
}

/// Implemented by the front-end; the auth layer only decides where to go.
pub trait Navigator: Send + Sync {
    fn navigate(&self, destination: Destination);
}
