//! Session-scoped one-time passcodes.
//!
//! At most one code is pending per OTP session. Any verify attempt removes
//! it, so a mistyped code means requesting a new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use constant_time_eq::constant_time_eq;
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Codes older than this are rejected: 10 minutes.
pub const OTP_TTL_SECS: i64 = 600;
/// Minimum gap between two codes being sent.
pub const OTP_RESEND_SECS: i64 = 10;
/// Sessions that may hold an unexpired code at once.
pub const MAX_PENDING_SESSIONS: usize = 16;

#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct PendingOtp {
    pub code: String,
    pub created: i64,
}

impl PendingOtp {
    pub fn generate(now: i64) -> Self {
        let code: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        Self {
            code: code.to_string(),
            created: now,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.created > OTP_TTL_SECS
    }

    fn matches(&self, submitted: &str) -> bool {
        constant_time_eq(self.code.as_bytes(), submitted.trim().as_bytes())
    }
}

/// Why a verify attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    Accepted,
    NoPending,
    Expired,
    Mismatch,
}

/// Why no new code was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OtpThrottle {
    #[error("otp requested too recently")]
    TooSoon,
    #[error("too many pending otp sessions")]
    TooMany,
}

#[derive(Default)]
struct Pending {
    codes: HashMap<String, PendingOtp>,
    last_start: Option<i64>,
}

/// Pending codes keyed by OTP session id.
#[derive(Clone, Default)]
pub struct OtpSessions {
    inner: Arc<Mutex<Pending>>,
}

impl OtpSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a fresh code for `session`, replacing any earlier one, and
    /// forget codes from other sessions that have already expired.
    ///
    /// Codes are handed out at most once per [`OTP_RESEND_SECS`] across all
    /// sessions, and never to more than [`MAX_PENDING_SESSIONS`] at a time.
    pub fn start(&self, session: &str, now: i64) -> Result<PendingOtp, OtpThrottle> {
        let mut pending = self.lock();
        if pending
            .last_start
            .is_some_and(|at| now >= at && now - at < OTP_RESEND_SECS)
        {
            return Err(OtpThrottle::TooSoon);
        }
        pending.codes.retain(|_, p| !p.is_expired(now));
        if !pending.codes.contains_key(session) && pending.codes.len() >= MAX_PENDING_SESSIONS {
            return Err(OtpThrottle::TooMany);
        }

        let otp = PendingOtp::generate(now);
        pending.codes.insert(session.to_owned(), otp.clone());
        pending.last_start = Some(now);
        Ok(otp)
    }

    /// Consume the pending code for `session` and compare it to `submitted`.
    pub fn check(&self, session: &str, submitted: &str, now: i64) -> OtpCheck {
        let Some(pending) = self.lock().codes.remove(session) else {
            return OtpCheck::NoPending;
        };
        if pending.is_expired(now) {
            OtpCheck::Expired
        } else if pending.matches(submitted) {
            OtpCheck::Accepted
        } else {
            OtpCheck::Mismatch
        }
    }

    pub fn is_pending(&self, session: &str) -> bool {
        self.lock().codes.contains_key(session)
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, session: &str, pending: PendingOtp) {
        self.lock().codes.insert(session.to_owned(), pending);
    }
}
