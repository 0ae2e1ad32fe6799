use std::sync::Arc;

use anyhow::Result;
use constant_time_eq::constant_time_eq;
use rand::Rng;

use super::{AccessToken, KeyValuePersistence};

/// Lifetime of an issued admin session: 30 days.
pub const SESSION_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Holds the one active admin credential.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValuePersistence<AccessToken>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValuePersistence<AccessToken>>) -> Self {
        Self { backend }
    }

    pub fn current(&self) -> Result<Option<AccessToken>> {
        self.backend.load()
    }

    /// Mint a fresh credential expiring at `expires` and make it the only valid one.
    pub fn issue(&self, expires: i64) -> Result<AccessToken> {
        let token = AccessToken {
            token: generate_token(),
            expires,
        };
        self.backend.save(&token)?;
        Ok(token)
    }

    /// Constant-time check of a presented cookie value against the stored token.
    pub fn verify(&self, presented: &str, now: i64) -> bool {
        if presented.is_empty() {
            return false;
        }
        match self.current() {
            Ok(Some(stored)) => {
                constant_time_eq(stored.token.as_bytes(), presented.as_bytes())
                    && stored.is_live(now)
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "could not load admin token");
                false
            }
        }
    }
}

/// 16 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
