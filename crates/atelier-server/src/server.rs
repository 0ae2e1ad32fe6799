use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin,
    content::ContentStore,
    gate::AuthGate,
    handlers::{gate, get_content, health, save_content, upload_image},
    license::{LicenseVerifier, PUBLIC_KEY_FILE},
    notify::{Notifier, TelegramConfig, TwilioConfig},
    store::{
        MagicLinkStore, StateBackend, StateLocation, TokenStore, MAGIC_KEY, OTP_STATUS_KEY,
        TOKEN_KEY,
    },
    upload::UploadPipeline,
    AppState,
};

/// Shipped in sample configs; never accepted as a real secret.
pub const PLACEHOLDER_ADMIN_TOKEN: &str = "CHANGE_THIS_ADMIN_TOKEN";
/// Whole multipart request; each file is still capped at 10 MiB.
pub const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Static write secret ($ATELIER_ADMIN_TOKEN); the file variant wins.
    pub admin_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Directory served as the public site; holds `content/` and `assets/`.
    pub site_root: PathBuf,
    pub cors_origins: Option<String>,
    pub secure_cookies: bool,
    pub state_backend: StateBackend,
    /// Overrides `<data_dir>/license_issuer_public.pem`.
    pub license_public_key: Option<PathBuf>,
    /// Set `ATELIER_RESIZE_IMAGES=false` to store uploads untouched.
    pub resize_images: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub twilio_sid: Option<String>,
    pub twilio_token: Option<String>,
    pub twilio_from: Option<String>,
    pub admin_phone: Option<String>,
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(default)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("ATELIER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("ATELIER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            admin_token: std::env::var("ATELIER_ADMIN_TOKEN").ok(),
            data_dir: std::env::var("ATELIER_DATA_DIR").ok().map(PathBuf::from),
            site_root: std::env::var("ATELIER_SITE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            cors_origins: std::env::var("ATELIER_CORS_ORIGINS").ok(),
            secure_cookies: flag("ATELIER_SECURE_COOKIES", false),
            state_backend: std::env::var("ATELIER_STATE_BACKEND")
                .ok()
                .and_then(|v| StateBackend::parse(&v))
                .unwrap_or_default(),
            license_public_key: std::env::var("ATELIER_LICENSE_PUBLIC_KEY")
                .ok()
                .map(PathBuf::from),
            resize_images: flag("ATELIER_RESIZE_IMAGES", true),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            twilio_sid: std::env::var("TWILIO_SID").ok(),
            twilio_token: std::env::var("TWILIO_TOKEN").ok(),
            twilio_from: std::env::var("TWILIO_FROM").ok(),
            admin_phone: std::env::var("ADMIN_PHONE").ok(),
        }
    }
}

/// Read a secret from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the static write secret from `ATELIER_ADMIN_TOKEN_FILE` (preferred)
/// or the given env value. Empty and placeholder values mean "not configured".
pub fn resolve_admin_token(from_env: Option<String>) -> Result<Option<String>> {
    let token = match std::env::var("ATELIER_ADMIN_TOKEN_FILE") {
        Ok(path) => {
            if from_env.is_some() {
                warn!("both ATELIER_ADMIN_TOKEN and ATELIER_ADMIN_TOKEN_FILE are set; using file");
            }
            Some(read_key_file(Path::new(&path))?)
        }
        Err(_) => from_env.map(|t| t.trim().to_owned()),
    };
    Ok(token.filter(|t| {
        if t == PLACEHOLDER_ADMIN_TOKEN {
            warn!("admin token is still the placeholder value; static secret disabled");
            return false;
        }
        !t.is_empty()
    }))
}

/// `ATELIER_DATA_DIR` when configured, else the platform data dir; created
/// if missing.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => crate::dirs::platform_data_dir()?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Magic-link map on the configured backend, for the operator CLI.
pub fn open_magic_links(backend: StateBackend, data_dir: &Path) -> Result<MagicLinkStore> {
    let location = StateLocation::open(backend, data_dir).context("open state store")?;
    Ok(MagicLinkStore::new(location.cell(MAGIC_KEY)))
}

/// Wire stores, channels and the gate from config.
pub fn build_state(cfg: &ServerConfig, data_dir: &Path) -> Result<AppState> {
    let location = StateLocation::open(cfg.state_backend, data_dir).context("open state store")?;

    let telegram = TelegramConfig::from_parts(
        cfg.telegram_bot_token.clone(),
        cfg.telegram_chat_id.clone(),
    );
    let twilio = TwilioConfig::from_parts(
        cfg.twilio_sid.clone(),
        cfg.twilio_token.clone(),
        cfg.twilio_from.clone(),
        cfg.admin_phone.clone(),
    );
    let notifier = Notifier::new(
        telegram,
        twilio,
        data_dir.join("otp_debug.log"),
        location.cell(OTP_STATUS_KEY),
    )?;
    if !notifier.has_channel() {
        warn!("no OTP channel configured; codes will only reach otp_debug.log");
    }

    let key_path = cfg
        .license_public_key
        .clone()
        .unwrap_or_else(|| data_dir.join(PUBLIC_KEY_FILE));
    if !key_path.exists() {
        info!(path = %key_path.display(), "no license public key; license activation disabled");
    }

    let static_secret = resolve_admin_token(cfg.admin_token.clone())?;

    let gate = AuthGate::new(
        TokenStore::new(location.cell(TOKEN_KEY)),
        MagicLinkStore::new(location.cell(MAGIC_KEY)),
        notifier,
        LicenseVerifier::new(key_path),
        static_secret,
    );

    Ok(AppState {
        gate: Arc::new(gate),
        content: ContentStore::new(cfg.site_root.join("content")),
        uploads: UploadPipeline::new(
            cfg.site_root.join("assets").join("images").join("gallery"),
            cfg.resize_images,
        ),
        secure_cookies: cfg.secure_cookies,
    })
}

/// All routes. Anything unmatched is served from `site_root`.
pub fn router(state: AppState, site_root: &Path, cors: CorsLayer) -> Router {
    // Public routes (no auth required).
    let public = Router::new()
        .route("/health", get(health))
        .route("/gate", get(gate).post(gate))
        .route("/content", get(get_content));

    // Write routes (session cookie, bearer or X-ADMIN-TOKEN).
    let protected = Router::new()
        .route("/save_content", post(save_content))
        .route(
            "/upload_image",
            post(upload_image).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback_service(ServeDir::new(site_root))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(
        data_dir = %data_dir.display(),
        site_root = %cfg.site_root.display(),
        backend = ?cfg.state_backend,
        "using directories"
    );

    let state = build_state(&cfg, &data_dir)?;
    let cors = build_cors(cfg.cors_origins.as_deref());
    let app = router(state, &cfg.site_root, cors);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "atelier server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

pub fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::HEAD,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
