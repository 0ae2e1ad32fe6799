use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    auth::{access_cookie, otp_session_cookie, session_context},
    content::{ContentError, PageId},
    error::ApiError,
    gate::unix_now,
    store::token::generate_token,
    upload::SubmittedFile,
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct GateQuery {
    #[serde(default)]
    pub action: String,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LicenseForm {
    #[serde(default)]
    license: String,
    #[serde(default)]
    device_fingerprint: String,
}

/// Single endpoint dispatching on `?action=`. Failures are reported in-band.
pub async fn gate(
    State(state): State<AppState>,
    Query(q): Query<GateQuery>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut ctx = session_context(&jar, unix_now());
    let gate = &state.gate;

    match q.action.as_str() {
        "status" => Ok(Json(json!({"ok": true, "authenticated": gate.status(&ctx)})).into_response()),

        "start_otp" => {
            let mut jar = jar;
            if ctx.otp_session.is_none() {
                let session = generate_token();
                jar = jar.add(otp_session_cookie(&session, state.secure_cookies));
                ctx.otp_session = Some(session);
            }
            let dispatch = gate.start_otp(&ctx).await;
            Ok((jar, Json(dispatch)).into_response())
        }

        "verify_otp" => {
            let code = submitted_code(&body);
            let issued = match code.as_deref() {
                Some(code) => gate.verify_otp(&ctx, code),
                None => None,
            };
            match issued {
                Some(token) => {
                    let jar = jar.add(access_cookie(&token, state.secure_cookies));
                    Ok((jar, Json(json!({"ok": true}))).into_response())
                }
                None => Ok(Json(json!({"ok": false})).into_response()),
            }
        }

        "use_magic" => {
            let token = gate.use_magic_link(&ctx, q.token.as_deref().unwrap_or_default())?;
            let jar = jar.add(access_cookie(&token, state.secure_cookies));
            Ok((jar, Json(json!({"ok": true}))).into_response())
        }

        "test_telegram" => {
            gate.test_telegram().await?;
            Ok(Json(json!({"ok": true})).into_response())
        }

        "activate_license" => {
            let form = license_form(&headers, &body);
            let token = gate.activate_license(&ctx, &form.license, &form.device_fingerprint)?;
            let jar = jar.add(access_cookie(&token, state.secure_cookies));
            Ok((jar, Json(json!({"ok": true, "expires": token.expires}))).into_response())
        }

        other => {
            debug!(action = other, "unknown gate action");
            Err(ApiError::Validation("invalid action".into()))
        }
    }
}

/// `{"code": "123456"}`; numeric codes are accepted too.
fn submitted_code(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let code = match value.get("code")? {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!code.is_empty()).then_some(code)
}

fn license_form(headers: &HeaderMap, body: &[u8]) -> LicenseForm {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let parsed = if is_json {
        serde_json::from_slice(body).ok()
    } else {
        serde_urlencoded::from_bytes(body).ok()
    };
    parsed.unwrap_or_default()
}

// ── Content ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: String,
}

pub async fn get_content(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let page = PageId::parse(&q.page).map_err(|_| ContentError::NotFound)?;
    let bytes = state.content.get(page)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

pub async fn save_content(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let page = PageId::parse(&q.page)?;
    state.content.put(page, &body)?;
    Ok(Json(json!({"status": "success", "message": "Content saved successfully."})).into_response())
}

// ── Upload ────────────────────────────────────────────────────────────────────

const IMAGE_FIELDS: [&str; 2] = ["images[]", "images"];

pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut files = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "multipart body ended early");
                break;
            }
        };
        if !field.name().is_some_and(|n| IMAGE_FIELDS.contains(&n)) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_owned();
        let declared_type = field.content_type().map(str::to_owned);
        let file = match field.bytes().await {
            Ok(data) => SubmittedFile {
                file_name,
                declared_type,
                data: data.to_vec(),
                transport_error: None,
            },
            Err(e) => SubmittedFile {
                file_name,
                declared_type,
                data: Vec::new(),
                transport_error: Some(e.to_string()),
            },
        };
        files.push(file);
    }

    if files.is_empty() {
        return Err(ApiError::Validation("No files uploaded".into()));
    }

    let submitted = files.len();
    let pipeline = state.uploads.clone();
    let stored = tokio::task::spawn_blocking(move || pipeline.ingest_all(files))
        .await
        .map_err(|e| ApiError::Storage(e.into()))?;

    info!(submitted, stored = stored.len(), "upload processed");
    if stored.is_empty() {
        return Err(ApiError::Validation(
            "Upload failed or unsupported file types".into(),
        ));
    }
    Ok((StatusCode::OK, Json(json!({"ok": true, "files": stored}))).into_response())
}
