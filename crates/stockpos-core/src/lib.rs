//! Authenticated request layer for the StockPOS terminal client: OAuth2 login with PKCE,
//! session persistence, single-flight token refresh and an API client that recovers from
//! expired tokens.

pub mod api;
pub mod auth;
pub mod config;
pub mod services;

#[cfg(test)]
mod testing;
