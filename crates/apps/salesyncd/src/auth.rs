//! Caller authentication for the HTTP surface
//!
//! Two kinds of callers: the external scheduler, which presents the shared
//! secret in `x-sync-secret`, and signed-in users, who present a session
//! token as `Authorization: Bearer <token>`. Sessions are issued elsewhere;
//! the daemon only asks a [`SessionVerifier`] which account a token maps to.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::collections::HashMap;

use crate::error::ApiError;

pub const SECRET_HEADER: &str = "x-sync-secret";

/// Sessions file in the salesync config directory
const SESSIONS_FILE: &str = "sessions.json";

/// Resolves a user session token to the account it belongs to
pub trait SessionVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<String>;
}

/// Fixed token-to-account table, loaded once at startup
#[derive(Debug, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, String>,
}

impl StaticSessions {
    pub fn new(sessions: HashMap<String, String>) -> Self {
        Self { sessions }
    }

    /// Load `sessions.json` if present; no file means no user sessions
    pub fn load() -> anyhow::Result<Self> {
        if !config::config_exists(SESSIONS_FILE) {
            return Ok(Self::default());
        }
        Ok(Self::new(config::load_json(SESSIONS_FILE)?))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionVerifier for StaticSessions {
    fn verify(&self, token: &str) -> Option<String> {
        self.sessions.get(token).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Scheduler,
    User { account_id: String },
}

/// Identify the caller or reject the request with 401.
///
/// The secret header wins when both are present. A daemon without a
/// configured secret accepts no scheduler calls.
pub fn authenticate(
    headers: &HeaderMap,
    secret: Option<&str>,
    sessions: &dyn SessionVerifier,
) -> Result<Caller, ApiError> {
    if let Some(presented) = headers.get(SECRET_HEADER) {
        let Some(expected) = secret else {
            return Err(ApiError::unauthorized());
        };
        if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Ok(Caller::Scheduler);
        }
        return Err(ApiError::unauthorized());
    }

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    sessions
        .verify(token)
        .map(|account_id| Caller::User { account_id })
        .ok_or_else(ApiError::unauthorized)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
