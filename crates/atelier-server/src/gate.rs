//! The admin gate: every way of obtaining and checking the write credential.
//!
//! Request state (cookies, clock) arrives as an explicit [`SessionContext`];
//! the gate itself holds no per-request globals.

use constant_time_eq::constant_time_eq;
use tracing::{debug, info, warn};

use crate::license::{LicenseError, LicenseVerifier};
use crate::notify::{DeliveryError, Notifier, OtpDispatch};
use crate::otp::{OtpCheck, OtpSessions};
use crate::store::magic::Redemption;
use crate::store::token::SESSION_TTL_SECS;
use crate::store::{AccessToken, MagicLinkStore, TokenStore};

/// Per-request inputs to the gate.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Value of the `ADMIN_ACCESS` cookie, if sent.
    pub credential: Option<String>,
    /// Id scoping the pending OTP, if the client has one.
    pub otp_session: Option<String>,
    /// Unix seconds.
    pub now: i64,
}

impl SessionContext {
    pub fn at(now: i64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_otp_session(mut self, session: impl Into<String>) -> Self {
        self.otp_session = Some(session.into());
        self
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MagicLinkError {
    #[error("magic link not found")]
    NotFound,
    #[error("magic link expired")]
    Expired,
    #[error("could not persist login session")]
    Storage,
}

pub struct AuthGate {
    tokens: TokenStore,
    magic: MagicLinkStore,
    otps: OtpSessions,
    notifier: Notifier,
    license: LicenseVerifier,
    static_secret: Option<String>,
}

impl AuthGate {
    pub fn new(
        tokens: TokenStore,
        magic: MagicLinkStore,
        notifier: Notifier,
        license: LicenseVerifier,
        static_secret: Option<String>,
    ) -> Self {
        Self {
            tokens,
            magic,
            otps: OtpSessions::new(),
            notifier,
            license,
            static_secret: static_secret.filter(|s| !s.is_empty()),
        }
    }

    /// True iff the request's cookie matches the live stored credential.
    pub fn status(&self, ctx: &SessionContext) -> bool {
        ctx.credential
            .as_deref()
            .is_some_and(|c| self.tokens.verify(c, ctx.now))
    }

    /// Replace the session's pending code with a fresh one and send it out.
    pub async fn start_otp(&self, ctx: &SessionContext) -> OtpDispatch {
        let Some(session) = ctx.otp_session.as_deref() else {
            return OtpDispatch {
                ok: false,
                channel: None,
                error: Some("missing otp session".into()),
            };
        };
        match self.otps.start(session, ctx.now) {
            Ok(pending) => self.notifier.deliver_code(&pending.code).await,
            Err(throttle) => {
                warn!(%throttle, "otp request refused");
                OtpDispatch {
                    ok: false,
                    channel: None,
                    error: Some(throttle.to_string()),
                }
            }
        }
    }

    /// Consume the pending code. On a match, a fresh 30-day credential is issued.
    pub fn verify_otp(&self, ctx: &SessionContext, code: &str) -> Option<AccessToken> {
        let session = ctx.otp_session.as_deref()?;
        match self.otps.check(session, code, ctx.now) {
            OtpCheck::Accepted => self.issue(ctx.now + SESSION_TTL_SECS, "otp").ok(),
            outcome => {
                debug!(?outcome, "otp rejected");
                None
            }
        }
    }

    /// Returns `None` when the magic-link map could not be persisted.
    pub fn create_magic_link(&self, now: i64, ttl_secs: i64) -> Option<String> {
        match self.magic.create(now, ttl_secs) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "could not create magic link");
                None
            }
        }
    }

    pub fn use_magic_link(
        &self,
        ctx: &SessionContext,
        token: &str,
    ) -> Result<AccessToken, MagicLinkError> {
        match self.magic.redeem(token.trim(), ctx.now) {
            Redemption::Valid => self
                .issue(ctx.now + SESSION_TTL_SECS, "magic_link")
                .map_err(|_| MagicLinkError::Storage),
            Redemption::Expired => Err(MagicLinkError::Expired),
            Redemption::Unknown => Err(MagicLinkError::NotFound),
            Redemption::Unsaved => Err(MagicLinkError::Storage),
        }
    }

    /// The issued credential never outlives the license.
    pub fn activate_license(
        &self,
        ctx: &SessionContext,
        license: &str,
        device_fingerprint: &str,
    ) -> Result<AccessToken, LicenseError> {
        let payload = self
            .license
            .verify(license, device_fingerprint, ctx.now)
            .inspect_err(|e| debug!(error = %e, "license rejected"))?;
        let expires = payload.exp.min(ctx.now + SESSION_TTL_SECS);
        self.issue(expires, "license")
            .map_err(|_| LicenseError::Storage)
    }

    pub async fn test_telegram(&self) -> Result<(), DeliveryError> {
        self.notifier.test_telegram().await
    }

    /// Write access: a live cookie session, or the configured static secret.
    pub fn authorize_write(&self, ctx: &SessionContext, presented_secret: Option<&str>) -> bool {
        if self.status(ctx) {
            return true;
        }
        match (&self.static_secret, presented_secret) {
            (Some(expected), Some(given)) if !given.is_empty() => {
                constant_time_eq(expected.as_bytes(), given.as_bytes())
            }
            _ => false,
        }
    }

    /// A bearer or header value may be either the static secret or a session token.
    pub fn authorize_bearer(&self, now: i64, presented: &str) -> bool {
        self.authorize_write(&SessionContext::at(now).with_credential(presented), Some(presented))
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn issue(&self, expires: i64, via: &'static str) -> anyhow::Result<AccessToken> {
        match self.tokens.issue(expires) {
            Ok(token) => {
                info!(via, expires, "admin session issued");
                Ok(token)
            }
            Err(e) => {
                warn!(via, error = %e, "could not persist admin session");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::license::tests::{issuer, verifier_in, FP, NOW};
    use crate::store::{JsonFile, MAGIC_KEY, OTP_STATUS_KEY, TOKEN_KEY};

    pub fn make_gate(dir: &Path, secret: Option<&str>) -> AuthGate {
        let file = |name: &str| dir.join(format!("{name}.json"));
        let notifier = Notifier::new(
            None,
            None,
            dir.join("otp_debug.log"),
            Arc::new(JsonFile::new(file(OTP_STATUS_KEY))),
        )
        .unwrap();
        AuthGate::new(
            TokenStore::new(Arc::new(JsonFile::new(file(TOKEN_KEY)))),
            MagicLinkStore::new(Arc::new(JsonFile::new(file(MAGIC_KEY)))),
            notifier,
            verifier_in(dir),
            secret.map(str::to_owned),
        )
    }

    fn last_logged_code(dir: &Path) -> String {
        let log = std::fs::read_to_string(dir.join("otp_debug.log")).unwrap();
        let line = log.lines().last().unwrap();
        line.rsplit(' ').next().unwrap().to_owned()
    }

    #[tokio::test]
    async fn otp_flow_issues_thirty_day_session() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let ctx = SessionContext::at(NOW).with_otp_session("sess");

        let dispatch = gate.start_otp(&ctx).await;
        assert_eq!(
            dispatch,
            OtpDispatch {
                ok: false,
                channel: None,
                error: Some("no configured channel".into()),
            }
        );
        let code = last_logged_code(dir.path());

        let tok = gate.verify_otp(&ctx, &code).unwrap();
        assert_eq!(tok.expires, NOW + SESSION_TTL_SECS);
        assert!(gate.verify_otp(&ctx, &code).is_none());

        let authed = SessionContext::at(NOW + 10).with_credential(tok.token.clone());
        assert!(gate.status(&authed));
        assert!(gate.status(&authed));
        let later = SessionContext::at(tok.expires).with_credential(tok.token.clone());
        assert!(!gate.status(&later));
    }

    #[tokio::test]
    async fn stale_otp_fails_and_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let ctx = SessionContext::at(NOW).with_otp_session("sess");
        gate.start_otp(&ctx).await;
        let code = last_logged_code(dir.path());

        let late = SessionContext::at(NOW + 601).with_otp_session("sess");
        assert!(gate.verify_otp(&late, &code).is_none());
        assert!(!gate.otps.is_pending("sess"));
    }

    #[tokio::test]
    async fn repeated_otp_requests_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        gate.start_otp(&SessionContext::at(NOW).with_otp_session("a"))
            .await;
        let code = last_logged_code(dir.path());

        let dispatch = gate
            .start_otp(&SessionContext::at(NOW + 1).with_otp_session("b"))
            .await;
        assert_eq!(dispatch.error.as_deref(), Some("otp requested too recently"));
        assert_eq!(last_logged_code(dir.path()), code);
        assert!(!gate.otps.is_pending("b"));
    }

    #[tokio::test]
    async fn otp_without_session_id_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let dispatch = gate.start_otp(&SessionContext::at(NOW)).await;
        assert!(!dispatch.ok);
        assert!(gate.verify_otp(&SessionContext::at(NOW), "123456").is_none());
    }

    #[test]
    fn magic_link_is_refused_when_its_removal_cannot_be_saved() {
        use crate::store::magic::tests::ReadOnlyAfterFirstSave;

        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate {
            magic: MagicLinkStore::new(Arc::new(ReadOnlyAfterFirstSave::default())),
            ..make_gate(dir.path(), None)
        };
        let token = gate.create_magic_link(NOW, 600).unwrap();
        let ctx = SessionContext::at(NOW + 5);
        for _ in 0..2 {
            assert_eq!(
                gate.use_magic_link(&ctx, &token),
                Err(MagicLinkError::Storage)
            );
        }
        assert!(!dir.path().join(format!("{TOKEN_KEY}.json")).exists());
    }

    #[test]
    fn magic_link_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let token = gate.create_magic_link(NOW, 600).unwrap();
        let ctx = SessionContext::at(NOW + 5);

        let tok = gate.use_magic_link(&ctx, &token).unwrap();
        assert_eq!(tok.expires, NOW + 5 + SESSION_TTL_SECS);
        assert_eq!(
            gate.use_magic_link(&ctx, &token),
            Err(MagicLinkError::NotFound)
        );
    }

    #[test]
    fn expired_magic_link_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let token = gate.create_magic_link(NOW, 60).unwrap();
        let ctx = SessionContext::at(NOW + 61);
        assert_eq!(gate.use_magic_link(&ctx, &token), Err(MagicLinkError::Expired));
        assert_eq!(
            gate.use_magic_link(&ctx, &token),
            Err(MagicLinkError::NotFound)
        );
    }

    #[test]
    fn license_session_is_capped_by_license_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let ctx = SessionContext::at(NOW);

        let short = issuer().issue(FP, 2, NOW);
        let tok = gate.activate_license(&ctx, &short, FP).unwrap();
        assert_eq!(tok.expires, NOW + 2 * 86_400);

        let long = issuer().issue(FP, 365, NOW);
        let tok = gate.activate_license(&ctx, &long, FP).unwrap();
        assert_eq!(tok.expires, NOW + SESSION_TTL_SECS);
        assert!(gate.status(&ctx.clone().with_credential(tok.token.clone())));
    }

    #[test]
    fn bad_license_issues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let lic = issuer().issue(FP, 30, NOW);
        assert_eq!(
            gate.activate_license(&SessionContext::at(NOW), &lic, "other"),
            Err(LicenseError::DeviceMismatch)
        );
        assert!(gate.tokens.current().unwrap().is_none());
    }

    #[test]
    fn new_session_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), None);
        let ctx = SessionContext::at(NOW);
        let a = gate
            .use_magic_link(&ctx, &gate.create_magic_link(NOW, 600).unwrap())
            .unwrap();
        let b = gate
            .use_magic_link(&ctx, &gate.create_magic_link(NOW, 600).unwrap())
            .unwrap();
        assert!(!gate.status(&ctx.clone().with_credential(a.token.clone())));
        assert!(gate.status(&ctx.clone().with_credential(b.token.clone())));
    }

    #[test]
    fn write_access_via_session_or_static_secret() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), Some("s3cret"));
        let ctx = SessionContext::at(NOW);
        assert!(!gate.authorize_write(&ctx, None));
        assert!(!gate.authorize_write(&ctx, Some("wrong")));
        assert!(gate.authorize_write(&ctx, Some("s3cret")));
        assert!(gate.authorize_bearer(NOW, "s3cret"));

        let tok = gate
            .use_magic_link(&ctx, &gate.create_magic_link(NOW, 600).unwrap())
            .unwrap();
        assert!(gate.authorize_write(&ctx.clone().with_credential(tok.token.clone()), None));
        assert!(gate.authorize_bearer(NOW, &tok.token));
    }

    #[test]
    fn without_configured_secret_only_sessions_count() {
        let dir = tempfile::tempdir().unwrap();
        let gate = make_gate(dir.path(), Some(""));
        let ctx = SessionContext::at(NOW);
        assert!(!gate.authorize_write(&ctx, Some("")));
        assert!(!gate.authorize_write(&ctx, Some("anything")));
    }
}
