use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

const DEFAULT_ROLE: &str = "USER";

/// The signed-in operator as known to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl Identity {
    /// Read identity claims from a JWT access token.
    ///
    /// The signature is not checked: the token came straight from the token endpoint over
    /// TLS and the API verifies it on every call. Returns `None` for opaque tokens.
    pub fn from_access_token(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: Claims = serde_json::from_slice(&bytes).ok()?;
        Some(claims.into())
    }

    /// Placeholder used when the token carries no readable claims.
    pub fn unknown() -> Self {
        Self {
            id: "unknown".into(),
            name: "unknown".into(),
            email: String::new(),
            roles: vec![DEFAULT_ROLE.into()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    username: Option<String>,
    name: Option<String>,
    email: Option<String>,
    roles: Option<Vec<String>>,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        let sub = claims.sub.unwrap_or_else(|| "unknown".into());
        Self {
            name: claims
                .username
                .or(claims.name)
                .unwrap_or_else(|| sub.clone()),
            email: claims.email.unwrap_or_else(|| sub.clone()),
            roles: claims
                .roles
                .filter(|roles| !roles.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_ROLE.into()]),
            id: sub,
        }
    }
}

#[cfg(test)]
pub(crate) fn jwt_for(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}
