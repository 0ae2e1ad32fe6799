use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::OffsetDateTime;
use tracing::warn;

use crate::content::ContentError;
use crate::error::ApiError;
use crate::gate::{unix_now, SessionContext};
use crate::store::AccessToken;
use crate::AppState;

/// Carries the admin access token.
pub const ACCESS_COOKIE: &str = "ADMIN_ACCESS";
/// Scopes the pending OTP to one browser.
pub const OTP_SESSION_COOKIE: &str = "ATELIER_OTP_SESSION";

pub fn session_context(jar: &CookieJar, now: i64) -> SessionContext {
    let value = |name: &str| {
        jar.get(name)
            .map(|c| c.value().to_owned())
            .filter(|v| !v.is_empty())
    };
    SessionContext {
        credential: value(ACCESS_COOKIE),
        otp_session: value(OTP_SESSION_COOKIE),
        now,
    }
}

/// HTTP-only, Lax, site-wide, expiring with the token.
pub fn access_cookie(token: &AccessToken, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::build((ACCESS_COOKIE, token.token.clone()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    if let Ok(at) = OffsetDateTime::from_unix_timestamp(token.expires) {
        cookie.set_expires(at);
    }
    cookie
}

/// Browser-session cookie; no expiry.
pub fn otp_session_cookie(session: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((OTP_SESSION_COOKIE, session.to_owned()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// `Authorization: Bearer <t>` first, then `X-ADMIN-TOKEN`.
pub fn presented_secret(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let scheme = v.get(..7)?;
            scheme.eq_ignore_ascii_case("bearer ").then(|| v.get(7..)).flatten()
        });
    bearer
        .or_else(|| headers.get("x-admin-token").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Axum middleware guarding the write endpoints.
pub async fn require_admin(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let now = unix_now();
    let ctx = session_context(&jar, now);
    let secret = presented_secret(request.headers());

    let allowed = state.gate.authorize_write(&ctx, secret.as_deref())
        || secret
            .as_deref()
            .is_some_and(|s| state.gate.authorize_bearer(now, s));
    if allowed {
        return next.run(request).await;
    }

    let path = request.uri().path();
    warn!(path, "unauthorized write attempt");
    if path.starts_with("/save_content") {
        ApiError::Content(ContentError::Unauthorized).into_response()
    } else {
        ApiError::Unauthorized.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum_extra::extract::cookie::Expiration;

    #[test]
    fn bearer_wins_over_header() {
        let mut h = HeaderMap::new();
        h.insert("x-admin-token", HeaderValue::from_static("from-header"));
        assert_eq!(presented_secret(&h).as_deref(), Some("from-header"));
        h.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer  from-bearer "),
        );
        assert_eq!(presented_secret(&h).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn non_bearer_schemes_are_ignored() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert_eq!(presented_secret(&h), None);
        h.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bear"));
        assert_eq!(presented_secret(&h), None);
    }

    #[test]
    fn access_cookie_attributes() {
        let tok = AccessToken {
            token: "abc".into(),
            expires: 1_700_000_000,
        };
        let c = access_cookie(&tok, true);
        assert_eq!(c.name(), ACCESS_COOKIE);
        assert_eq!(c.value(), "abc");
        assert_eq!(c.http_only(), Some(true));
        assert_eq!(c.secure(), Some(true));
        assert_eq!(c.same_site(), Some(SameSite::Lax));
        assert_eq!(c.path(), Some("/"));
        let Some(Expiration::DateTime(at)) = c.expires() else {
            panic!("expected a fixed expiry");
        };
        assert_eq!(at.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn context_reads_both_cookies() {
        let jar = CookieJar::new()
            .add(Cookie::new(ACCESS_COOKIE, "tok"))
            .add(Cookie::new(OTP_SESSION_COOKIE, "sess"));
        let ctx = session_context(&jar, 5);
        assert_eq!(ctx.credential.as_deref(), Some("tok"));
        assert_eq!(ctx.otp_session.as_deref(), Some("sess"));
        assert_eq!(ctx.now, 5);

        let empty = session_context(&CookieJar::new().add(Cookie::new(ACCESS_COOKIE, "")), 0);
        assert!(empty.credential.is_none());
    }
}
