use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The single admin credential. Stored server-side and mirrored in the
/// `ADMIN_ACCESS` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    /// 32 hex chars of OS randomness.
    pub token: String,
    /// Unix timestamp (seconds) after which the token no longer authenticates.
    pub expires: i64,
}

impl AccessToken {
    /// Returns true while `now` is strictly before the expiry.
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires
    }
}

/// Magic-link tokens mapped to their expiry timestamps.
pub type MagicLinks = BTreeMap<String, i64>;

/// Outcome of the most recent OTP delivery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChannelStatus {
    pub channel: Option<String>,
    pub error: Option<String>,
}
