use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::token::generate_token;
use super::{KeyValuePersistence, MagicLinks};

/// Shortest lifetime a magic link may be created with.
pub const MIN_MAGIC_TTL_SECS: i64 = 60;
/// Lifetime used when the caller does not pick one.
pub const DEFAULT_MAGIC_TTL_SECS: i64 = 600;

/// Result of looking up a magic-link token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    /// Token existed and its expiry has not passed.
    Valid,
    /// Token existed but had already expired.
    Expired,
    /// Token was never issued or was already used.
    Unknown,
    /// Token was found but its removal could not be persisted, so it is
    /// not honoured.
    Unsaved,
}

/// Persistent map of single-use login tokens.
#[derive(Clone)]
pub struct MagicLinkStore {
    backend: Arc<dyn KeyValuePersistence<MagicLinks>>,
}

impl MagicLinkStore {
    pub fn new(backend: Arc<dyn KeyValuePersistence<MagicLinks>>) -> Self {
        Self { backend }
    }

    fn load(&self) -> MagicLinks {
        match self.backend.load() {
            Ok(map) => map.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "could not load magic links");
                MagicLinks::new()
            }
        }
    }

    /// Insert a new token valid for at least [`MIN_MAGIC_TTL_SECS`].
    /// Entries that expired before `now` are dropped in the same write.
    pub fn create(&self, now: i64, ttl_secs: i64) -> Result<String> {
        let token = generate_token();
        let expires = now.saturating_add(ttl_secs.max(MIN_MAGIC_TTL_SECS));

        let mut map = self.load();
        map.retain(|_, exp| *exp >= now);
        map.insert(token.clone(), expires);
        self.backend.save(&map)?;

        debug!(expires, "magic link created");
        Ok(token)
    }

    /// Remove `token` and report whether it was still usable.
    pub fn redeem(&self, token: &str, now: i64) -> Redemption {
        if token.is_empty() {
            return Redemption::Unknown;
        }
        let mut map = self.load();
        let Some(expires) = map.remove(token) else {
            return Redemption::Unknown;
        };
        if let Err(e) = self.backend.save(&map) {
            warn!(error = %e, "could not persist magic link removal");
            return Redemption::Unsaved;
        }
        if now > expires {
            Redemption::Expired
        } else {
            Redemption::Valid
        }
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
